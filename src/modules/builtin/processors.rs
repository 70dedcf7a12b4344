//! Processor modules: rewrite the URL, lift parameters into the parsed body,
//! (de)serialise JSON bodies, track API versions and derive cache keys.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use md5::{Digest, Md5};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::error::{GatewayError, ModuleError};
use crate::http::context::RequestContext;
use crate::modules::{ModuleFilters, PipelineData, Processor};

/// Base that relative request paths are resolved against. Only path and query survive.
const RESOLVE_BASE: &str = "http://gateway.invalid/";

#[derive(Debug, Deserialize)]
pub struct PathOptions {
    pub path: String,
}

/// Resolves the request URL against a configured base path.
///
/// `{"path": "/internal/"}` turns `/v1/users?id=3` into `/internal/v1/users?id=3`.
pub struct PathProcessor {
    base: Url,
    filters: ModuleFilters,
}

impl PathProcessor {
    pub fn new(options: PathOptions, filters: ModuleFilters) -> Result<Self, GatewayError> {
        let base = Url::parse(RESOLVE_BASE)
            .and_then(|root| root.join(&options.path))
            .map_err(|e| GatewayError::module(format!("invalid path [{}]: {}", options.path, e)))?;
        Ok(Self { base, filters })
    }

    fn resolve(&self, url: &str) -> Result<String, ModuleError> {
        let resolved = self
            .base
            .join(url.trim_start_matches('/'))
            .map_err(|e| ModuleError::rejected(format!("Cannot resolve [{}]: {}", url, e)))?;
        Ok(match resolved.query() {
            Some(query) => format!("{}?{}", resolved.path(), query),
            None => resolved.path().to_string(),
        })
    }
}

#[async_trait]
impl Processor for PathProcessor {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        if !self.filters.matches(data.request) {
            return Ok(());
        }
        let from = data.request.url();
        let to = self.resolve(&from)?;
        tracing::debug!(request_id = %data.request.id(), from = %from, to = %to, "Request path changed");
        data.request.set_url(&to)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryStringOptions {
    pub params_regex: Option<String>,
    pub nested_regex: Option<String>,
}

const DEFAULT_PARAMS_REGEX: &str = r"^(.*/service/[^/]+/action/[^/]+)/(.+)$";
const DEFAULT_NESTED_REGEX: &str = r"^([^\[]+)\[([^\[]+)\](.*)$";

/// Lifts path parameters and query-string parameters into the parsed body.
///
/// `/service/user/action/get/id/3?filter[status]=1` becomes URL
/// `/service/user/action/get` with body `{"id": "3", "filter": {"status": "1"}}`.
/// Keys nest with `a:b` or `a[b]`.
pub struct QueryStringProcessor {
    params: Regex,
    nested: Regex,
    filters: ModuleFilters,
}

impl QueryStringProcessor {
    pub fn new(options: QueryStringOptions, filters: ModuleFilters) -> Result<Self, GatewayError> {
        let compile = |pattern: Option<String>, default: &str| {
            let pattern = pattern.unwrap_or_else(|| default.to_string());
            Regex::new(&pattern).map_err(|e| GatewayError::module(format!("invalid regex [{}]: {}", pattern, e)))
        };
        Ok(Self {
            params: compile(options.params_regex, DEFAULT_PARAMS_REGEX)?,
            nested: compile(options.nested_regex, DEFAULT_NESTED_REGEX)?,
            filters,
        })
    }

    fn append(&self, target: &mut Value, key: &str, value: Value) {
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        let Value::Object(json) = target else {
            return;
        };

        if let Some((parent, child)) = key.split_once(':').filter(|(parent, _)| !parent.is_empty()) {
            let slot = json.entry(parent.to_string()).or_insert(Value::Null);
            self.append(slot, child, value);
        } else if let Some(caps) = self.nested.captures(key) {
            let parent = caps.get(1).map_or("", |m| m.as_str());
            let rest = format!(
                "{}{}",
                caps.get(2).map_or("", |m| m.as_str()),
                caps.get(3).map_or("", |m| m.as_str())
            );
            let slot = json.entry(parent.to_string()).or_insert(Value::Null);
            self.append(slot, &rest, value);
        } else {
            match json.get_mut(key) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    json.insert(key.to_string(), value);
                }
            }
        }
    }
}

#[async_trait]
impl Processor for QueryStringProcessor {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        if !self.filters.matches(data.request) {
            return Ok(());
        }
        let request = &mut *data.request;
        let uri = request.uri().clone();
        let mut path = uri.path().to_string();
        let mut pairs: Vec<(String, String)> = Vec::new();

        if let Some(caps) = self.params.captures(uri.path()) {
            path = caps.get(1).map_or("", |m| m.as_str()).to_string();
            let params: Vec<&str> = caps.get(2).map_or("", |m| m.as_str()).split('/').collect();
            if params.len() >= 2 {
                for pair in params.chunks(2) {
                    if let [key, value] = pair {
                        pairs.push((key.to_string(), value.to_string()));
                    }
                }
            }
        }
        if let Some(query) = uri.query() {
            pairs.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
        }

        if !pairs.is_empty() {
            let json = request.parsed_body.get_or_insert_with(|| Value::Object(Map::new()));
            if !json.is_object() {
                return Err(ModuleError::rejected("Parsed body is not an object"));
            }
            for (key, value) in pairs {
                self.append(json, &key, Value::String(value));
            }
        }

        request.set_url(&path)
    }
}

/// True for POST requests carrying a JSON content type.
fn is_json_post(request: &RequestContext) -> bool {
    request.method() == axum::http::Method::POST
        && request
            .content_type()
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
            .unwrap_or(false)
}

/// Parses JSON POST bodies into the parsed body.
pub struct JsonParser {
    filters: ModuleFilters,
}

impl JsonParser {
    pub fn new(filters: ModuleFilters) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl Processor for JsonParser {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        if !is_json_post(data.request) || !self.filters.matches(data.request) {
            return Ok(());
        }
        let parsed = serde_json::from_str::<Value>(&data.request.body)
            .map_err(|e| ModuleError::rejected(format!("{}, Body: {}", e, data.request.body)))?;
        data.request.parsed_body = Some(parsed);
        Ok(())
    }
}

/// Serialises the parsed body back into the request body forwarded upstream.
pub struct JsonStringifier {
    filters: ModuleFilters,
}

impl JsonStringifier {
    pub fn new(filters: ModuleFilters) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl Processor for JsonStringifier {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        let Some(json) = &data.request.parsed_body else {
            return Ok(());
        };
        if !is_json_post(data.request) || !self.filters.matches(data.request) {
            return Ok(());
        }
        let body = serde_json::to_string(json)?;
        data.request.set_body(body);
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyOptions {
    pub fields_to_ignore: Vec<String>,
}

/// Sets the cache key to `md5(url + parsed body)`, ignoring volatile fields.
pub struct KeyGenerator {
    fields_to_ignore: Vec<String>,
    filters: ModuleFilters,
}

impl KeyGenerator {
    pub fn new(options: KeyOptions, filters: ModuleFilters) -> Self {
        Self {
            fields_to_ignore: options.fields_to_ignore,
            filters,
        }
    }

    fn key_for(&self, request: &RequestContext) -> String {
        let body = match &request.parsed_body {
            Some(Value::Object(map)) => {
                let mut map = map.clone();
                for field in &self.fields_to_ignore {
                    map.remove(field);
                }
                Value::Object(map).to_string()
            }
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let mut hasher = Md5::new();
        hasher.update(request.url().as_bytes());
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl Processor for KeyGenerator {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        if self.filters.matches(data.request) {
            data.request.cache_key = Some(self.key_for(data.request));
        }
        Ok(())
    }
}

const VERSION_PREFIX: &str = r"^/(v\d+_\d+)/";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VersionOptions {
    /// Partner id to `{version pattern: replacement version}`. `x` in a pattern matches anything.
    pub overrides: HashMap<String, BTreeMap<String, String>>,
}

/// Records the `/vX_Y/` URL prefix as `session.version`.
///
/// When the session carries a `partnerId` with overrides, the first matching pattern
/// rewrites the prefix: `{"42": {"v1_x": "v2_0"}}` sends partner 42's `/v1_3/users` to `/v2_0/users`.
pub struct VersionProcessor {
    prefix: Regex,
    overrides: HashMap<String, Vec<(Regex, String)>>,
    filters: ModuleFilters,
}

impl VersionProcessor {
    pub fn new(options: VersionOptions, filters: ModuleFilters) -> Result<Self, GatewayError> {
        let prefix = Regex::new(VERSION_PREFIX).map_err(|e| GatewayError::module(e.to_string()))?;
        let mut overrides = HashMap::with_capacity(options.overrides.len());
        for (partner, rules) in options.overrides {
            let mut compiled = Vec::with_capacity(rules.len());
            for (pattern, target) in rules {
                let re = Regex::new(&pattern.replacen('x', ".*", 1)).map_err(|e| {
                    GatewayError::module(format!("invalid version pattern [{}]: {}", pattern, e))
                })?;
                compiled.push((re, target));
            }
            overrides.insert(partner, compiled);
        }
        Ok(Self {
            prefix,
            overrides,
            filters,
        })
    }
}

/// `partnerId` as a string, whether the session stores it as text or a number.
fn partner_id(session: &Map<String, Value>) -> Option<String> {
    match session.get("partnerId")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Processor for VersionProcessor {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        if !self.filters.matches(data.request) {
            return Ok(());
        }
        let url = data.request.url();
        let Some(version) = self.prefix.captures(&url).and_then(|caps| caps.get(1)) else {
            return Ok(());
        };
        let version = version.as_str().to_string();

        let session = data.request.session.get_or_insert_with(Map::new);
        session.insert("version".to_string(), Value::String(version.clone()));
        let Some(rules) = partner_id(session).and_then(|id| self.overrides.get(&id)) else {
            return Ok(());
        };

        if let Some((_, target)) = rules.iter().find(|(re, _)| re.is_match(&version)) {
            let to = self
                .prefix
                .replace(&url, regex::NoExpand(&format!("/{}/", target)))
                .into_owned();
            tracing::debug!(request_id = %data.request.id(), from = %url, to = %to, "Version overridden");
            data.request.set_url(&to)?;
        }
        Ok(())
    }
}
