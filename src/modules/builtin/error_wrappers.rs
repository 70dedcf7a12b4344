//! Error response wrapper modules.

use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::error::PipelineError;
use crate::http::context::RequestContext;
use crate::http::response::{ResponseContext, ResponseSink};
use crate::modules::{ErrorResponseWrapper, ModuleFilters};

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JsonErrorOptions {
    pub object_type: String,
    pub default_code: String,
}

impl Default for JsonErrorOptions {
    fn default() -> Self {
        Self {
            object_type: "APIException".to_string(),
            default_code: "-2".to_string(),
        }
    }
}

/// Renders pipeline errors as a 500 JSON envelope:
///
/// ```json
/// {"result": {"error": {"objectType": "...", "code": "...", "message": "..."}}, "executionTime": 0.012}
/// ```
pub struct JsonErrorWrapper {
    options: JsonErrorOptions,
    filters: ModuleFilters,
}

impl JsonErrorWrapper {
    pub fn new(options: JsonErrorOptions, filters: ModuleFilters) -> Self {
        Self { options, filters }
    }
}

impl ErrorResponseWrapper for JsonErrorWrapper {
    fn wrap(&self, err: &PipelineError, request: &RequestContext, response: &ResponseContext) -> bool {
        if response.is_ended() || !self.filters.matches(request) {
            return false;
        }
        let code = err
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| self.options.default_code.clone());
        let body = json!({
            "result": {
                "error": {
                    "objectType": self.options.object_type,
                    "code": code,
                    "message": err.to_string(),
                }
            },
            "executionTime": request.start_time().elapsed().as_secs_f64(),
        });
        let body = match serde_json::to_string_pretty(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(request_id = %request.id(), error = %e, "Failed to render error envelope");
                return false;
            }
        };
        response.respond(StatusCode::INTERNAL_SERVER_ERROR, "application/json", body);
        true
    }
}
