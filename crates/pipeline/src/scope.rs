//! Scopes expose named values to mappers and activities.
//!
//! `SharedScope` is the mutable pipeline-level scope carried by each group
//! state. The stage scopes are read-only views over the execution context
//! buckets, used when applying input and output mappers.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{PipelineError, PipelineResult};

/// Scope id for the immutable pipeline input bucket.
pub const SCOPE_PIPELINE: &str = "pipeline";
/// Scope id for the current stage input bucket.
pub const SCOPE_INPUT: &str = "input";
/// Scope id for values carried forward by `passthru.` output mappings.
pub const SCOPE_PASSTHRU: &str = "passthru";

/// Read and write access to named values.
pub trait Scope {
    fn get_value(&self, name: &str) -> Option<Value>;

    fn set_value(&self, name: &str, value: Value) -> PipelineResult<()>;
}

/// A scope that can additionally resolve names from sibling scopes.
pub trait MultiScope: Scope {
    fn get_value_by_scope(&self, scope_id: &str, name: &str) -> Option<Value>;
}

/// Mutable shared scope, safe for concurrent readers and writers.
#[derive(Debug, Default)]
pub struct SharedScope {
    attrs: RwLock<HashMap<String, Value>>,
}

impl SharedScope {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scope for SharedScope {
    fn get_value(&self, name: &str) -> Option<Value> {
        self.attrs.read().unwrap().get(name).cloned()
    }

    fn set_value(&self, name: &str, value: Value) -> PipelineResult<()> {
        self.attrs.write().unwrap().insert(name.to_string(), value);
        Ok(())
    }
}

/// Read-only view a stage's input mapper evaluates against.
///
/// Unscoped names resolve to the previous stage's output; scoped lookups
/// reach the pipeline input and the passthru bucket.
pub struct StageInputScope<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> StageInputScope<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }
}

impl Scope for StageInputScope<'_> {
    fn get_value(&self, name: &str) -> Option<Value> {
        self.ctx.current_output.get(name).cloned()
    }

    fn set_value(&self, _name: &str, _value: Value) -> PipelineResult<()> {
        Err(PipelineError::ReadOnlyScope)
    }
}

impl MultiScope for StageInputScope<'_> {
    fn get_value_by_scope(&self, scope_id: &str, name: &str) -> Option<Value> {
        match scope_id {
            SCOPE_PIPELINE => self.ctx.pipeline_input.get(name).cloned(),
            SCOPE_PASSTHRU => self.ctx.pass_thru.get(name).cloned(),
            _ => None,
        }
    }
}

/// Read-only view a stage's output mapper evaluates against.
///
/// Unscoped names resolve to the activity's freshly produced output; the
/// `input` scope exposes the stage's own input as well.
pub struct StageOutputScope<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> StageOutputScope<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }
}

impl Scope for StageOutputScope<'_> {
    fn get_value(&self, name: &str) -> Option<Value> {
        self.ctx.current_output.get(name).cloned()
    }

    fn set_value(&self, _name: &str, _value: Value) -> PipelineResult<()> {
        Err(PipelineError::ReadOnlyScope)
    }
}

impl MultiScope for StageOutputScope<'_> {
    fn get_value_by_scope(&self, scope_id: &str, name: &str) -> Option<Value> {
        match scope_id {
            SCOPE_INPUT => self.ctx.current_input.get(name).cloned(),
            SCOPE_PIPELINE => self.ctx.pipeline_input.get(name).cloned(),
            SCOPE_PASSTHRU => self.ctx.pass_thru.get(name).cloned(),
            _ => None,
        }
    }
}
