//! Filter registry: every named filter of a configuration, built once per worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::FilterConfig;
use crate::filter::predicate::Filter;
use crate::filter::FilterError;

/// Immutable map of compiled filters shared by all modules and workflows.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: BTreeMap<String, Arc<Filter>>,
}

impl FilterRegistry {
    /// Compile every configured filter.
    pub fn from_config(configs: &BTreeMap<String, FilterConfig>) -> Result<Self, FilterError> {
        let filters = configs
            .iter()
            .map(|(name, config)| Ok((name.clone(), Arc::new(Filter::from_config(name, config)?))))
            .collect::<Result<BTreeMap<_, _>, FilterError>>()?;

        tracing::debug!(count = filters.len(), "Filters compiled");
        Ok(Self { filters })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Filter>> {
        self.filters.get(name).cloned()
    }

    /// Resolve a list of filter names, failing on the first unknown one.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<Filter>>, FilterError> {
        names
            .iter()
            .map(|name| self.get(name).ok_or_else(|| FilterError::Unknown(name.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
