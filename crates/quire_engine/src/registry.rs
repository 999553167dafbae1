//! Alias to filter lookup, populated explicitly at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quire_config::ProjectConfig;

use crate::builtin::{builtin_filters, CommandFilter};
use crate::error::EngineError;
use crate::filter::{Filter, FilterInfo};

/// Registered filters keyed by alias.
#[derive(Default, Clone)]
pub struct FilterRegistry {
    filters: BTreeMap<String, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in filters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for filter in builtin_filters() {
            let alias = filter.info().alias.clone();
            registry.filters.insert(alias, filter);
        }
        registry
    }

    /// Creates a registry holding the built-ins plus every command filter
    /// declared in `config`.
    pub fn from_config(config: &ProjectConfig) -> Result<Self, EngineError> {
        let mut registry = Self::with_builtins();
        let default_timeout = Duration::from_secs(config.build.filter_timeout_secs);
        for (alias, filter) in &config.filters {
            registry.register(Arc::new(CommandFilter::from_config(
                alias,
                filter,
                default_timeout,
            )))?;
        }
        Ok(registry)
    }

    /// Adds a filter. Fails if its alias is already taken.
    pub fn register(&mut self, filter: Arc<dyn Filter>) -> Result<(), EngineError> {
        let alias = filter.info().alias.clone();
        if self.filters.contains_key(&alias) {
            return Err(EngineError::DuplicateFilter(alias));
        }
        tracing::debug!(filter = %alias, "registered filter");
        self.filters.insert(alias, filter);
        Ok(())
    }

    /// Looks up a filter by alias.
    pub fn get(&self, alias: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(alias).cloned()
    }

    /// Returns `true` if `alias` is registered.
    pub fn contains(&self, alias: &str) -> bool {
        self.filters.contains_key(alias)
    }

    /// Descriptions of every registered filter, sorted by alias.
    pub fn infos(&self) -> Vec<&FilterInfo> {
        self.filters.values().map(|f| f.info()).collect()
    }

    /// Number of registered filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::DexyFilter;
    use quire_config::load_config_from_str;

    #[test]
    fn builtins_are_present() {
        let registry = FilterRegistry::with_builtins();
        assert!(registry.contains("dexy"));
        assert!(registry.contains("join"));
        assert!(registry.contains("sections"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let mut registry = FilterRegistry::with_builtins();
        let err = registry.register(Arc::new(DexyFilter::new())).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateFilter(alias) if alias == "dexy"));
    }

    #[test]
    fn command_filters_from_config() {
        let config = load_config_from_str(
            r#"
[build]
filter_timeout_secs = 7

[filters.shout]
command = ["tr", "a-z", "A-Z"]
output_extensions = [".txt"]
version = "3"
"#,
        )
        .unwrap();
        let registry = FilterRegistry::from_config(&config).unwrap();
        let shout = registry.get("shout").unwrap();
        let info = shout.info();
        assert_eq!(info.version, "3");
        assert_eq!(info.output_extensions, vec![".txt"]);
        assert_eq!(info.timeout, Some(Duration::from_secs(7)));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn infos_are_sorted() {
        let registry = FilterRegistry::with_builtins();
        let aliases: Vec<_> = registry.infos().iter().map(|i| i.alias.as_str()).collect();
        assert_eq!(aliases, vec!["dexy", "join", "sections"]);
    }
}
