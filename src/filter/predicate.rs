//! Named filters and their per-request memoised evaluation.

use std::sync::Arc;

use regex::Regex;

use crate::config::FilterConfig;
use crate::filter::matcher::{
    parse_ip_range, AndMatcher, ContentTypeMatcher, IpRangeMatcher, Matcher, MethodMatcher,
    PathMatcher,
};
use crate::filter::FilterError;
use crate::http::context::RequestContext;

/// A named, immutable predicate over request attributes.
#[derive(Debug)]
pub struct Filter {
    name: String,
    matcher: AndMatcher,
    negate: bool,
}

impl Filter {
    /// Compile a filter from its configuration.
    pub fn from_config(name: impl Into<String>, config: &FilterConfig) -> Result<Self, FilterError> {
        let name = name.into();
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();

        if let Some(methods) = &config.methods {
            matchers.push(Box::new(MethodMatcher::new(methods.clone())));
        }
        if let Some(patterns) = &config.content_types {
            matchers.push(Box::new(ContentTypeMatcher::new(compile(&name, patterns)?)));
        }
        if let Some(patterns) = &config.paths {
            matchers.push(Box::new(PathMatcher::new(compile(&name, patterns)?)));
        }
        if let Some(ranges) = &config.ip_range {
            let ranges = ranges
                .to_vec()
                .into_iter()
                .map(|range| {
                    parse_ip_range(&range).ok_or_else(|| FilterError::InvalidIpRange {
                        filter: name.clone(),
                        range,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            matchers.push(Box::new(IpRangeMatcher::new(ranges)));
        }

        Ok(Self {
            name,
            matcher: AndMatcher::new(matchers),
            negate: config.not,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate every configured dimension against the request, without memoisation.
    pub fn evaluate(&self, request: &RequestContext) -> bool {
        self.matcher.matches(request) != self.negate
    }

    /// Memoised evaluation handle for this request.
    ///
    /// The first call registers the filter on the request; later calls on the
    /// same request share the cached result.
    pub fn get<'r>(&'r self, request: &'r RequestContext) -> RequestFilter<'r> {
        request.register_filter(&self.name);
        RequestFilter {
            filter: self,
            request,
        }
    }
}

fn compile(filter: &str, patterns: &[String]) -> Result<Vec<Regex>, FilterError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| FilterError::InvalidRegex {
                filter: filter.to_string(),
                source,
            })
        })
        .collect()
}

/// Per-request view of one filter's evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RequestFilter<'r> {
    filter: &'r Filter,
    request: &'r RequestContext,
}

impl RequestFilter<'_> {
    /// Cached result for this request, evaluating on first use or when forced.
    ///
    /// Attributes changed by earlier stages are only observed with `reevaluate`.
    pub fn is_fulfilled(&self, reevaluate: bool) -> bool {
        if !reevaluate {
            if let Some(value) = self.request.cached_filter(self.filter.name()) {
                return value;
            }
        }
        let value = self.filter.evaluate(self.request);
        self.request.cache_filter(self.filter.name(), value);
        value
    }
}

/// True when every filter is fulfilled for the request (memoised).
pub fn filters_match(filters: &[Arc<Filter>], request: &RequestContext) -> bool {
    filters.iter().all(|f| f.get(request).is_fulfilled(false))
}
