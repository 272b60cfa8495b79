//! Compiled value mappings between pipeline scopes.
//!
//! A mapper is built once at pipeline load from a `name -> value` map where
//! each value is either a literal or a `=`-prefixed scope reference, and is
//! applied per event against a stage scope.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::resolve::Resolver;
use crate::scope::MultiScope;

/// One compiled mapping expression.
#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ref { scope: Option<String>, path: Vec<String> },
}

/// A compiled set of mappings from scope values to named outputs.
#[derive(Debug)]
pub struct Mapper {
    entries: Vec<(String, Expr)>,
}

/// Compiles mapper configuration using a resolver for fixed references.
pub struct MapperFactory {
    resolver: Arc<Resolver>,
}

impl MapperFactory {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    /// Compiles `mappings` into a mapper. An empty map yields `None`, which
    /// the engine treats as the identity mapping.
    pub fn new_mapper(
        &self,
        mappings: &HashMap<String, Value>,
    ) -> PipelineResult<Option<Mapper>> {
        if mappings.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(mappings.len());
        for (name, value) in mappings {
            entries.push((name.clone(), self.compile(value)?));
        }
        // map iteration order is arbitrary, keep application deterministic
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Some(Mapper { entries }))
    }

    fn compile(&self, value: &Value) -> PipelineResult<Expr> {
        let expr = match value {
            Value::String(s) if s.starts_with('=') => &s[1..],
            _ => return Ok(Expr::Literal(value.clone())),
        };

        if !expr.starts_with('$') {
            return Err(PipelineError::Mapper(format!(
                "invalid expression '{}'",
                expr
            )));
        }

        if Resolver::is_fixed(expr) {
            return Ok(Expr::Literal(self.resolver.resolve(expr)?));
        }

        let stripped = &expr[1..];
        let mut parts = stripped.split('.');
        let head = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.map(str::to_string).collect();

        if path.is_empty() {
            return Err(PipelineError::Mapper(format!(
                "reference '{}' names no attribute",
                expr
            )));
        }

        let scope = if head.is_empty() {
            None
        } else {
            Some(head.to_string())
        };

        Ok(Expr::Ref { scope, path })
    }
}

impl Mapper {
    /// Evaluates every mapping against `scope`, returning the produced
    /// name/value pairs.
    pub fn apply(&self, scope: &dyn MultiScope) -> PipelineResult<HashMap<String, Value>> {
        let mut output = HashMap::with_capacity(self.entries.len());
        for (name, expr) in &self.entries {
            output.insert(name.clone(), self.eval(expr, scope)?);
        }
        Ok(output)
    }

    fn eval(&self, expr: &Expr, scope: &dyn MultiScope) -> PipelineResult<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ref { scope: target, path } => {
                let root_name = &path[0];
                let root = match target {
                    None => scope.get_value(root_name),
                    Some(id) => scope.get_value_by_scope(id, root_name),
                }
                .ok_or_else(|| {
                    PipelineError::Mapper(format!(
                        "failed to resolve attr '{}' in scope '{}'",
                        root_name,
                        target.as_deref().unwrap_or("current")
                    ))
                })?;

                let mut value = root;
                for field in &path[1..] {
                    value = match &value {
                        Value::Object(map) => map.get(field).cloned().ok_or_else(|| {
                            PipelineError::Mapper(format!(
                                "field '{}' not found while resolving '{}'",
                                field,
                                path.join(".")
                            ))
                        })?,
                        _ => {
                            return Err(PipelineError::Mapper(format!(
                                "cannot index non-object value with '{}'",
                                field
                            )))
                        }
                    };
                }
                Ok(value)
            }
        }
    }
}
