//! Pipeline stages and the race combinator the interpreter runs concurrent stages with.

use std::fmt;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};

/// One step of the request pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prerequisites,
    ReadBody,
    Processors,
    Validators,
    CacheCheck,
    Proxy,
}

impl Stage {
    /// The pipeline every workflow interprets.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Prerequisites,
        Stage::ReadBody,
        Stage::Processors,
        Stage::Validators,
        Stage::CacheCheck,
        Stage::Proxy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Prerequisites => "prerequisites",
            Stage::ReadBody => "read-body",
            Stage::Processors => "processors",
            Stage::Validators => "validators",
            Stage::CacheCheck => "cache-check",
            Stage::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run participants concurrently and resolve with the first `Ok`.
///
/// Remaining participants are dropped as soon as one succeeds, which cancels them at
/// their next suspension point. When every participant fails, all errors are returned
/// in completion order. No participants at all yields an empty error list.
pub async fn race<'a, T, E>(participants: Vec<BoxFuture<'a, Result<T, E>>>) -> Result<T, Vec<E>>
where
    T: Send + 'a,
    E: Send + 'a,
{
    let mut pending: FuturesUnordered<_> = participants.into_iter().collect();
    let mut errors = Vec::with_capacity(pending.len());
    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) => errors.push(e),
        }
    }
    Err(errors)
}
