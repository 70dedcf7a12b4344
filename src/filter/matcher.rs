//! Request dimension matchers.
//!
//! # Responsibilities
//! - Match HTTP method (exact, case-sensitive like the wire format)
//! - Match content-type header against regexes
//! - Match request URL (path and query) against regexes
//! - Match client IP against CIDR ranges
//! - Combine dimensions with AND semantics
//!
//! # Design Decisions
//! - A configured dimension is satisfied when at least one of its values matches
//! - An unset dimension is never compiled, so it is always satisfied
//! - Regexes are compiled once, when the filter is built

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::http::context::RequestContext;

/// Trait for matching requests against one filter dimension.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &RequestContext) -> bool;
}

/// Parse a CIDR range or a single address (treated as a host range).
pub fn parse_ip_range(range: &str) -> Option<IpNet> {
    let range = range.trim();
    range
        .parse::<IpNet>()
        .ok()
        .or_else(|| range.parse::<IpAddr>().ok().map(IpNet::from))
}

/// Matches the request method against a set.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<String>,
}

impl MethodMatcher {
    pub fn new(methods: Vec<String>) -> Self {
        Self { methods }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, req: &RequestContext) -> bool {
        let method = req.method().as_str();
        self.methods.iter().any(|m| m == method)
    }
}

/// Matches the content-type header against a set of regexes.
#[derive(Debug, Clone)]
pub struct ContentTypeMatcher {
    patterns: Vec<Regex>,
}

impl ContentTypeMatcher {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl Matcher for ContentTypeMatcher {
    fn matches(&self, req: &RequestContext) -> bool {
        let content_type = req.content_type().unwrap_or_default();
        self.patterns.iter().any(|re| re.is_match(content_type))
    }
}

/// Matches the request URL against a set of regexes.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    patterns: Vec<Regex>,
}

impl PathMatcher {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl Matcher for PathMatcher {
    fn matches(&self, req: &RequestContext) -> bool {
        let url = req.url();
        self.patterns.iter().any(|re| re.is_match(&url))
    }
}

/// Matches the client IP against a list of ranges.
#[derive(Debug, Clone)]
pub struct IpRangeMatcher {
    ranges: Vec<IpNet>,
}

impl IpRangeMatcher {
    pub fn new(ranges: Vec<IpNet>) -> Self {
        Self { ranges }
    }
}

impl Matcher for IpRangeMatcher {
    fn matches(&self, req: &RequestContext) -> bool {
        match req.client_ip() {
            Some(ip) => self.ranges.iter().any(|range| range.contains(&ip)),
            None => false,
        }
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &RequestContext) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}
