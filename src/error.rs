//! Error types for the gateway.
//!
//! `GatewayError` covers process-level failures (startup, binding, spawning).
//! `PipelineError` is the per-request taxonomy a workflow attempt can end with,
//! and `ModuleError` is what pluggable stage modules hand back to the engine.

use std::fmt;
use std::io;

use crate::config::loader::ConfigError;
use crate::workflow::stage::Stage;

/// Process-level error.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Module error: {0}")]
    Module(String),
}

impl GatewayError {
    pub fn tls(msg: impl Into<String>) -> Self {
        GatewayError::Tls(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        GatewayError::Spawn(msg.into())
    }

    pub fn module(msg: impl Into<String>) -> Self {
        GatewayError::Module(msg.into())
    }
}

/// Error returned by a stage module.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// The module refused the request with a reason (and optionally a code).
    #[error("{message}")]
    Rejected { message: String, code: Option<i64> },

    /// The module does not apply to this request (race stages treat this as "lost").
    #[error("not applicable")]
    NotApplicable,

    /// The module already answered the request; the pipeline stops without an error body.
    #[error("response already sent")]
    Answered,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ModuleError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        ModuleError::Rejected {
            message: msg.into(),
            code: None,
        }
    }

    pub fn rejected_with_code(msg: impl Into<String>, code: i64) -> Self {
        ModuleError::Rejected {
            message: msg.into(),
            code: Some(code),
        }
    }

    pub fn http(msg: impl fmt::Display) -> Self {
        ModuleError::Http(msg.to_string())
    }
}

/// Outcome of a failed workflow attempt.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The workflow (or a race participant) declined the request. Not an error.
    #[error("filters did not match")]
    FilterMismatch,

    /// Another workflow already claimed the request.
    #[error("request claimed by another workflow")]
    Claimed,

    #[error("{0}")]
    Prerequisite(ModuleError),

    #[error("{0}")]
    Processor(ModuleError),

    #[error("{0}")]
    Validator(ModuleError),

    #[error("No proxy defined")]
    NoProxyDefined,

    #[error("No proxy found")]
    NoProxyMatched,

    /// A proxy claimed the request but the upstream call failed.
    #[error("Upstream error: {0}")]
    Upstream(ModuleError),

    /// A module answered the request itself and asked the pipeline to stop.
    #[error("pipeline stopped by module")]
    Aborted,
}

impl PipelineError {
    /// Whether this outcome should be routed to the error response wrappers.
    ///
    /// Declines and self-answered requests carry no error value.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            PipelineError::FilterMismatch | PipelineError::Claimed | PipelineError::Aborted
        )
    }

    /// Numeric error code carried by the underlying module error, if any.
    pub fn code(&self) -> Option<i64> {
        match self {
            PipelineError::Prerequisite(e)
            | PipelineError::Processor(e)
            | PipelineError::Validator(e) => match e {
                ModuleError::Rejected { code, .. } => *code,
                _ => None,
            },
            _ => None,
        }
    }

    /// Map a stage module error into the pipeline taxonomy for the given stage.
    pub(crate) fn from_stage(stage: Stage, err: ModuleError) -> Self {
        if matches!(err, ModuleError::Answered) {
            return PipelineError::Aborted;
        }
        match stage {
            Stage::Prerequisites => PipelineError::Prerequisite(err),
            Stage::Validators => PipelineError::Validator(err),
            _ => PipelineError::Processor(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
