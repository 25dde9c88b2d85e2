//! Filter factories and the registry that resolves configured filter types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::schema::FilterDefinition;
use crate::filter::{builtin, Filter, FilterError};

/// Creates a fresh [`Filter`] for every accepted connection.
pub trait FilterFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn create_filter(&self) -> Result<Filter, FilterError>;
}

/// Error type for turning a filter definition into a factory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterConfigError {
    #[error("unknown filter type '{0}'")]
    UnknownType(String),

    #[error("invalid config for filter '{filter_type}': {message}")]
    InvalidConfig { filter_type: String, message: String },
}

type Constructor = Arc<dyn Fn(&toml::Value) -> Result<Arc<dyn FilterFactory>, FilterConfigError> + Send + Sync>;

/// Maps configured filter `type` names to factory constructors.
#[derive(Clone, Default)]
pub struct FilterFactoryRegistry {
    constructors: HashMap<String, Constructor>,
}

impl FilterFactoryRegistry {
    /// A registry with no filter types.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in filter types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::REQUEST_LOGGER, builtin::RequestLoggerFactory::from_config);
        registry.register(builtin::CLIENT_ID_PREFIX, builtin::ClientIdPrefixFactory::from_config);
        registry
    }

    pub fn register<F>(&mut self, filter_type: impl Into<String>, constructor: F)
    where
        F: Fn(&toml::Value) -> Result<Arc<dyn FilterFactory>, FilterConfigError> + Send + Sync + 'static,
    {
        self.constructors.insert(filter_type.into(), Arc::new(constructor));
    }

    pub fn knows(&self, filter_type: &str) -> bool {
        self.constructors.contains_key(filter_type)
    }

    /// Build the factory for one configured filter.
    pub fn create(&self, definition: &FilterDefinition) -> Result<Arc<dyn FilterFactory>, FilterConfigError> {
        let constructor = self
            .constructors
            .get(&definition.filter_type)
            .ok_or_else(|| FilterConfigError::UnknownType(definition.filter_type.clone()))?;
        constructor(&definition.config)
    }

    /// Build the factories for a whole chain, in order.
    pub fn create_chain(&self, definitions: &[FilterDefinition]) -> Result<Vec<Arc<dyn FilterFactory>>, FilterConfigError> {
        definitions.iter().map(|d| self.create(d)).collect()
    }
}

impl fmt::Debug for FilterFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("FilterFactoryRegistry").field("types", &types).finish()
    }
}
