//! Resolution of `$`-prefixed references outside the per-event scopes.
//!
//! Settings and fixed mapper expressions may reference the process
//! environment (`$env.NAME`) or application properties (`$property.NAME`).
//! Properties are held by an explicit resolver object handed to the manager
//! at construction; there is no process-global registry.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

const RESOLVER_ENV: &str = "env";
const RESOLVER_PROPERTY: &str = "property";

/// Resolves environment and property references.
#[derive(Debug, Default)]
pub struct Resolver {
    properties: HashMap<String, Value>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: HashMap<String, Value>) -> Self {
        Self { properties }
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    /// True when `reference` names a resolver this type can satisfy without
    /// a scope, i.e. it is fixed at load time.
    pub fn is_fixed(reference: &str) -> bool {
        let name = reference.trim_start_matches('$');
        match name.split_once('.') {
            Some((resolver, _)) => resolver == RESOLVER_ENV || resolver == RESOLVER_PROPERTY,
            None => false,
        }
    }

    /// Resolves a `$env.NAME` or `$property.NAME` reference.
    pub fn resolve(&self, reference: &str) -> PipelineResult<Value> {
        let stripped = reference.trim_start_matches('$');
        let (resolver, name) = stripped
            .split_once('.')
            .ok_or_else(|| PipelineError::Mapper(format!("invalid reference '{}'", reference)))?;

        match resolver {
            RESOLVER_ENV => std::env::var(name)
                .map(Value::String)
                .map_err(|_| PipelineError::Mapper(format!("environment variable '{}' not set", name))),
            RESOLVER_PROPERTY => self
                .properties
                .get(name)
                .cloned()
                .ok_or_else(|| PipelineError::Mapper(format!("property '{}' not defined", name))),
            other => Err(PipelineError::Mapper(format!(
                "unknown resolver '{}' in '{}'",
                other, reference
            ))),
        }
    }

    /// Resolves a `$`-prefixed setting value, keeping the literal when
    /// resolution fails (settings fall back to their configured value).
    pub fn resolve_setting(&self, name: &str, value: Value) -> Value {
        if let Value::String(s) = &value {
            if s.starts_with('$') {
                match self.resolve(s) {
                    Ok(resolved) => {
                        debug!("resolved setting [{}: {}] to: {}", name, s, resolved);
                        return resolved;
                    }
                    Err(e) => debug!("setting [{}] kept as literal: {}", name, e),
                }
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_property() {
        let mut resolver = Resolver::new();
        resolver.set_property("threshold", json!(10));
        assert_eq!(resolver.resolve("$property.threshold").unwrap(), json!(10));
        assert!(resolver.resolve("$property.missing").is_err());
    }

    #[test]
    fn test_resolve_env() {
        std::env::set_var("PIPELINE_RESOLVE_TEST", "on");
        let resolver = Resolver::new();
        assert_eq!(
            resolver.resolve("$env.PIPELINE_RESOLVE_TEST").unwrap(),
            json!("on")
        );
    }

    #[test]
    fn test_resolve_setting_keeps_literal() {
        let resolver = Resolver::new();
        let v = resolver.resolve_setting("interval", json!("$property.nope"));
        assert_eq!(v, json!("$property.nope"));
        let v = resolver.resolve_setting("interval", json!(250));
        assert_eq!(v, json!(250));
    }

    #[test]
    fn test_unknown_resolver() {
        let resolver = Resolver::new();
        assert!(resolver.resolve("$bogus.name").is_err());
    }
}
