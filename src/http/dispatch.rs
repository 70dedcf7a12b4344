//! The dispatch race: every workflow is offered the request, exactly one serves it.
//!
//! # Responsibilities
//! - Race all workflows' eligibility checks; the first claim wins
//! - Run the winner's pipeline to completion
//! - Map unhandled outcomes to client responses (404 / 502 / 500)

use std::sync::Arc;

use axum::http::StatusCode;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::json;

use crate::error::PipelineError;
use crate::http::context::RequestContext;
use crate::http::response::ResponseContext;
use crate::workflow::stage::race;
use crate::workflow::Workflow;

/// Body of the 404 sent when no workflow accepts a request.
pub const NO_WORKFLOW_MATCHED: &str = "no workflow matched";

/// Races the configured workflows for each request.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    workflows: Arc<[Arc<Workflow>]>,
}

impl Dispatcher {
    pub fn new(workflows: Vec<Arc<Workflow>>) -> Self {
        Self {
            workflows: workflows.into(),
        }
    }

    pub fn workflows(&self) -> &[Arc<Workflow>] {
        &self.workflows
    }

    /// Serve one request. Always leaves the response flushed.
    pub async fn dispatch(&self, mut request: RequestContext, response: ResponseContext) {
        if self.workflows.is_empty() {
            tracing::debug!(request_id = %request.id(), "No workflows configured");
            not_found(&response, NO_WORKFLOW_MATCHED);
            return;
        }

        let winner = {
            let (req, res) = (&request, &response);
            let attempts: Vec<BoxFuture<'_, Result<Arc<Workflow>, PipelineError>>> = self
                .workflows
                .iter()
                .map(|workflow| {
                    async move {
                        workflow.handle(req, res).await?;
                        Ok(Arc::clone(workflow))
                    }
                    .boxed()
                })
                .collect();
            race(attempts).await
        };

        let workflow = match winner {
            Ok(workflow) => workflow,
            Err(_) => {
                tracing::debug!(
                    request_id = %request.id(),
                    method = %request.method(),
                    url = %request.url(),
                    "No workflow matched"
                );
                not_found(&response, NO_WORKFLOW_MATCHED);
                return;
            }
        };

        if let Err(err) = workflow.run(&mut request, &response).await {
            respond_error(&request, &response, &err);
        }
    }
}

fn not_found(response: &ResponseContext, message: &str) {
    response.respond(StatusCode::NOT_FOUND, "text/plain", message.to_string());
    response.flush();
}

/// Fallback for errors no error response wrapper handled.
fn respond_error(request: &RequestContext, response: &ResponseContext, err: &PipelineError) {
    response.discard();
    if response.is_flushed() {
        tracing::warn!(request_id = %request.id(), error = %err, "Error after response was sent");
        return;
    }
    match err {
        PipelineError::NoProxyDefined | PipelineError::NoProxyMatched => {
            response.respond(StatusCode::NOT_FOUND, "text/plain", err.to_string());
        }
        PipelineError::Upstream(_) => {
            response.respond(StatusCode::BAD_GATEWAY, "text/plain", err.to_string());
        }
        _ => match err.code() {
            Some(code) => {
                let body = json!({ "message": err.to_string(), "code": code });
                response.respond(StatusCode::INTERNAL_SERVER_ERROR, "application/json", body.to_string());
            }
            None => {
                response.respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", err.to_string());
            }
        },
    }
    response.flush();
}
