//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from the JSON config file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::modules::Capability;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Number of worker processes. Defaults to the number of CPU cores.
    pub workers: Option<usize>,

    /// Host the listeners bind to.
    pub host: String,

    /// Listener ports.
    pub ports: PortsConfig,

    /// Certificate and key for the HTTPS listener.
    pub ssl_options: Option<SslOptions>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Maximum request body size in bytes.
    pub body_limit: usize,

    /// How often the master polls the config file for modification.
    pub reload_poll_secs: u64,

    /// Master control API.
    pub admin: AdminConfig,

    /// Named request filters.
    pub filters: BTreeMap<String, FilterConfig>,

    /// Shared modules, referenced by name from workflows.
    pub modules: BTreeMap<String, ModuleConfig>,

    /// Workflows raced against every request.
    pub workflows: BTreeMap<String, WorkflowConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workers: None,
            host: "0.0.0.0".to_string(),
            ports: PortsConfig::default(),
            ssl_options: None,
            log_level: "info".to_string(),
            body_limit: 2 * 1024 * 1024, // 2MB
            reload_poll_secs: 2,
            admin: AdminConfig::default(),
            filters: BTreeMap::new(),
            modules: BTreeMap::new(),
            workflows: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Worker pool size, falling back to the number of available cores.
    pub fn worker_count(&self) -> usize {
        self.workers.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Listener ports. At least one must be set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PortsConfig {
    pub http: Option<u16>,
    pub https: Option<u16>,
}

/// TLS material for the HTTPS listener (PEM files).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SslOptions {
    pub key: PathBuf,
    pub cert: PathBuf,
}

/// Admin control API configuration (served by the master).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Admin API bind address.
    pub bind_address: String,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8081".to_string(),
            api_key: String::new(),
        }
    }
}

/// A string or a list of strings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Declarative request filter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterConfig {
    /// Accepted HTTP methods.
    pub methods: Option<Vec<String>>,

    /// Regexes tested against the content-type header.
    pub content_types: Option<Vec<String>>,

    /// Regexes tested against the request URL (path and query).
    pub paths: Option<Vec<String>>,

    /// CIDR ranges (or single addresses) the client IP must fall in.
    pub ip_range: Option<OneOrMany>,

    /// Invert the result.
    pub not: bool,

    /// Filter implementation. Only the built-in declarative filter exists.
    pub require: Option<String>,
}

/// A module definition: a registry identifier plus free-form options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleConfig {
    /// Registry identifier of the module implementation.
    pub require: String,

    /// Filters gating this module.
    #[serde(default)]
    pub filters: Vec<String>,

    /// Module-specific options.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ModuleConfig {
    pub fn new(require: impl Into<String>) -> Self {
        Self {
            require: require.into(),
            filters: Vec::new(),
            options: serde_json::Map::new(),
        }
    }

    /// Builder helper for tests and programmatic configs.
    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn with_filters(mut self, filters: &[&str]) -> Self {
        self.filters = filters.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Reference to a module from a workflow stage list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ModuleRef {
    /// Name of a shared module in `modules`.
    Named(String),
    /// Module instantiated privately for this workflow.
    Inline(ModuleConfig),
}

/// Workflow definition.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Workflow whose stage lists are inherited (prepended stage by stage).
    pub extends: Option<String>,

    /// Filters deciding whether this workflow applies to a request.
    pub filters: Vec<String>,

    pub prerequisites: Vec<ModuleRef>,
    pub processors: Vec<ModuleRef>,
    pub validators: Vec<ModuleRef>,
    pub cachers: Vec<ModuleRef>,
    pub proxies: Vec<ModuleRef>,
    pub enrichers: Vec<ModuleRef>,
    pub error_response_wrappers: Vec<ModuleRef>,
}

impl WorkflowConfig {
    /// Stage lists paired with the capability they require, in pipeline order.
    pub fn stage_refs(&self) -> [(Capability, &[ModuleRef]); 7] {
        [
            (Capability::Prerequisite, self.prerequisites.as_slice()),
            (Capability::Processor, self.processors.as_slice()),
            (Capability::Validator, self.validators.as_slice()),
            (Capability::Cacher, self.cachers.as_slice()),
            (Capability::Proxy, self.proxies.as_slice()),
            (Capability::Enricher, self.enrichers.as_slice()),
            (Capability::ErrorResponseWrapper, self.error_response_wrappers.as_slice()),
        ]
    }
}
