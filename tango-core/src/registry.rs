//! Component registry: constructs components by string key.
//!
//! Components are registered at startup under a name such as
//! `"flax::dataloader"` and built later from JSON parameters.

use crate::error::RegistryError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A factory building a `T` from JSON parameters.
pub type Factory<T> = Arc<dyn Fn(&serde_json::Value) -> Result<T, RegistryError> + Send + Sync>;

/// String-keyed registry of factories for one kind of component.
pub struct Registry<T> {
    kind: String,
    factories: HashMap<String, Factory<T>>,
}

impl<T> Registry<T> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            factories: HashMap::new(),
        }
    }

    /// The kind of component this registry builds, used in error messages.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Register a factory. Returns error if the key is already taken.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&serde_json::Value) -> Result<T, RegistryError> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.factories.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                kind: self.kind.clone(),
                key,
            });
        }
        debug!(kind = %self.kind, key = %key, "Registering component");
        self.factories.insert(key, Arc::new(factory));
        Ok(())
    }

    /// Build the component registered under `key`.
    pub fn construct(&self, key: &str, params: &serde_json::Value) -> Result<T, RegistryError> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| RegistryError::NotFound {
                kind: self.kind.clone(),
                key: key.to_string(),
            })?;
        factory(params)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Deserialize factory parameters, mapping failures onto [`RegistryError::InvalidParams`].
pub fn parse_params<P: serde::de::DeserializeOwned>(
    key: &str,
    params: &serde_json::Value,
) -> Result<P, RegistryError> {
    let value = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| RegistryError::InvalidParams {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Scale {
        #[serde(default = "one")]
        factor: f64,
    }

    fn one() -> f64 {
        1.0
    }

    fn registry() -> Registry<f64> {
        let mut registry = Registry::new("scale");
        registry
            .register("scale", |params| {
                let p: Scale = parse_params("scale", params)?;
                Ok(p.factor * 2.0)
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_construct_with_params() {
        let registry = registry();
        let v = registry
            .construct("scale", &serde_json::json!({"factor": 3.0}))
            .unwrap();
        assert_eq!(v, 6.0);
        let v = registry.construct("scale", &serde_json::Value::Null).unwrap();
        assert_eq!(v, 2.0);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        let err = registry.register("scale", |_| Ok(0.0)).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_key() {
        let registry = registry();
        let err = registry
            .construct("missing", &serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn test_bad_params() {
        let registry = registry();
        let err = registry
            .construct("scale", &serde_json::json!({"factor": "big"}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams { .. }));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = registry();
        registry.register("a", |_| Ok(0.0)).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "scale".to_string()]);
        assert!(registry.contains("a"));
        assert!(!registry.is_empty());
    }
}
