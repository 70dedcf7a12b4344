//! Enricher modules.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{GatewayError, ModuleError};
use crate::http::context::RequestContext;
use crate::http::response::ResponseContext;
use crate::modules::{Enricher, ModuleFilters};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonReducerOptions {
    pub paths: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    ".".to_string()
}

/// Removes configured fields from JSON response bodies.
///
/// `{"paths": ["result.secret"]}` deletes `secret` under `result`. Array elements are
/// addressed by index. Missing paths are ignored.
pub struct JsonReducer {
    paths: Vec<Vec<String>>,
    filters: ModuleFilters,
}

impl JsonReducer {
    pub fn new(options: JsonReducerOptions, filters: ModuleFilters) -> Result<Self, GatewayError> {
        if options.paths.is_empty() {
            return Err(GatewayError::module("json-reducer requires at least one path"));
        }
        if options.delimiter.is_empty() {
            return Err(GatewayError::module("json-reducer delimiter must not be empty"));
        }
        let paths = options
            .paths
            .iter()
            .map(|p| p.split(options.delimiter.as_str()).map(str::to_string).collect())
            .collect();
        Ok(Self { paths, filters })
    }

    fn reduce(json: &mut Value, path: &[String]) {
        let Some((head, rest)) = path.split_first() else {
            return;
        };
        if rest.is_empty() {
            match json {
                Value::Object(map) => {
                    map.remove(head);
                }
                Value::Array(items) => {
                    if let Ok(index) = head.parse::<usize>() {
                        if index < items.len() {
                            items.remove(index);
                        }
                    }
                }
                _ => {}
            }
            return;
        }
        let child = match json {
            Value::Object(map) => map.get_mut(head),
            Value::Array(items) => head.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        };
        if let Some(child) = child {
            Self::reduce(child, rest);
        }
    }
}

#[async_trait]
impl Enricher for JsonReducer {
    async fn enrich(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if response.body().is_empty() || !self.filters.matches(request) {
            return Ok(());
        }
        let mut json: Value = serde_json::from_slice(&response.body())?;
        for path in &self.paths {
            Self::reduce(&mut json, path);
        }
        response.set_body(serde_json::to_string_pretty(&json)?);
        Ok(())
    }
}
