//! Integration tests for the execution engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::activity::{Activity, ActivityContext, ActivityFactory, InitContext, TimerCallback};
use crate::config::DefinitionConfig;
use crate::context::{ExecutionContext, ExecutionStatus};
use crate::data::{Attribute, IOMetadata, Type, ValueMap};
use crate::definition::Definition;
use crate::error::{ActivityError, PipelineError};
use crate::instance::Instance;
use crate::mapper::MapperFactory;
use crate::registry::ActivityRegistry;
use crate::resolve::Resolver;
use crate::scope::{Scope, StageInputScope, StageOutputScope};
use crate::telemetry::TelemetryService;

/// Copies its `in` input to its `out` output.
struct EchoActivity {
    metadata: IOMetadata,
}

impl EchoActivity {
    fn new() -> Self {
        Self {
            metadata: IOMetadata::new(
                vec![Attribute::new("in", Type::Any)],
                vec![Attribute::new("out", Type::Any)],
            ),
        }
    }
}

impl Activity for EchoActivity {
    fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let value = ctx.get_input("in").unwrap_or(Value::Null);
        ctx.set_output("out", value);
        Ok(true)
    }
}

struct EchoFactory;

impl ActivityFactory for EchoFactory {
    fn create(&self, _init_ctx: &InitContext) -> Result<Box<dyn Activity>, ActivityError> {
        Ok(Box::new(EchoActivity::new()))
    }
}

/// Counts the events seen by its group.
struct CountActivity {
    metadata: IOMetadata,
}

impl Activity for CountActivity {
    fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let shared = ctx.shared_data();
        let mut guard = shared.lock().unwrap();
        let count = guard
            .entry("count".to_string())
            .or_insert_with(|| Box::new(0_i64));
        let count = count.downcast_mut::<i64>().expect("count slot");
        *count += 1;
        let seen = *count;
        drop(guard);

        ctx.set_output("count", json!(seen));
        Ok(true)
    }
}

struct CountFactory;

impl ActivityFactory for CountFactory {
    fn create(&self, _init_ctx: &InitContext) -> Result<Box<dyn Activity>, ActivityError> {
        Ok(Box::new(CountActivity {
            metadata: IOMetadata::new(
                vec![Attribute::new("in", Type::Any)],
                vec![Attribute::new("count", Type::Integer)],
            ),
        }))
    }
}

/// Stalls every event and resumes it from a one-shot timer.
struct StallActivity {
    metadata: IOMetadata,
}

impl Activity for StallActivity {
    fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let ts = ctx.timer_support().expect("engine context has timers");
        if !ts.has_timer(false) {
            let callback: TimerCallback = Arc::new(|_ctx| true);
            ts.create_timer(Duration::from_millis(20), callback, false)
                .map_err(|e| ActivityError::Other(e.to_string()))?;
        }
        ts.update_timer(false);
        Ok(false)
    }

    fn post_eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        ctx.set_output("out", json!("resumed"));
        Ok(true)
    }
}

struct StallFactory;

impl ActivityFactory for StallFactory {
    fn create(&self, _init_ctx: &InitContext) -> Result<Box<dyn Activity>, ActivityError> {
        Ok(Box::new(StallActivity {
            metadata: IOMetadata::new(
                vec![Attribute::new("in", Type::Any)],
                vec![Attribute::new("out", Type::Any)],
            ),
        }))
    }
}

/// Panics during evaluation.
struct PanicActivity {
    metadata: IOMetadata,
}

struct PanicFactory;

impl Activity for PanicActivity {
    fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    fn eval(&self, _ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        panic!("boom");
    }
}

impl ActivityFactory for PanicFactory {
    fn create(&self, _init_ctx: &InitContext) -> Result<Box<dyn Activity>, ActivityError> {
        Ok(Box::new(PanicActivity {
            metadata: IOMetadata::default(),
        }))
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    events: Mutex<Vec<String>>,
}

impl TelemetryService for RecordingTelemetry {
    fn pipeline_started(&self, _pipeline_id: &str, _instance_id: &str, _data: &ValueMap) {
        self.events.lock().unwrap().push("pipeline-started".into());
    }

    fn stage_started(&self, _pipeline_id: &str, _instance_id: &str, stage_id: &str, _data: &ValueMap) {
        self.events
            .lock()
            .unwrap()
            .push(format!("stage-started:{}", stage_id));
    }

    fn stage_finished(&self, _pipeline_id: &str, _instance_id: &str, stage_id: &str, _data: &ValueMap) {
        self.events
            .lock()
            .unwrap()
            .push(format!("stage-finished:{}", stage_id));
    }

    fn pipeline_finished(&self, _pipeline_id: &str, _instance_id: &str, _data: &ValueMap) {
        self.events.lock().unwrap().push("pipeline-finished".into());
    }
}

fn registry() -> Arc<ActivityRegistry> {
    let mut registry = ActivityRegistry::new();
    registry.register("echo", Box::new(EchoFactory));
    registry.register("count", Box::new(CountFactory));
    registry.register("stall", Box::new(StallFactory));
    registry.register("panic", Box::new(PanicFactory));
    Arc::new(registry)
}

fn build_definition(descriptor: &str) -> Arc<Definition> {
    let config: DefinitionConfig = serde_json::from_str(descriptor).unwrap();
    let resolver = Arc::new(Resolver::new());
    let mapper_factory = MapperFactory::new(resolver.clone());
    Arc::new(Definition::new(&config, &registry(), &mapper_factory, &resolver).unwrap())
}

fn inputs(value: Value) -> ValueMap {
    HashMap::from([("value".to_string(), value)])
}

#[test]
fn test_single_stage_completes() {
    let def = build_definition(
        r#"
        {
            "name": "echo-line",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "y", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "echo",
                    "input":  { "in": "=$.value" },
                    "output": { "pipeline.y": "=$.out" }
                }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let outcome = inst.run("", inputs(json!(7))).unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.outputs.unwrap()["y"], json!(7));
}

#[test]
fn test_output_routing_buckets() {
    // keys without a prefix stay stage-local, prefixed keys land in the
    // pipeline and passthru buckets
    let def = build_definition(
        r#"
        {
            "name": "routing",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "y", "type": "integer"}, {"name": "z", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "echo",
                    "input":  { "in": "=$.value" },
                    "output": {
                        "pipeline.y": "=$.out",
                        "passthru.keep": "=$.out",
                        "local": "=$.out"
                    }
                },
                {
                    "ref": "echo",
                    "input":  { "in": "=$passthru.keep" },
                    "output": { "pipeline.z": "=$.out" }
                }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let outcome = inst.run("", inputs(json!(7))).unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let outputs = outcome.outputs.unwrap();
    assert_eq!(outputs["y"], json!(7));
    assert_eq!(outputs["z"], json!(7));
    // the stage-local key never reaches the pipeline output
    assert!(!outputs.contains_key("local"));
    assert!(!outputs.contains_key("keep"));
}

#[test]
fn test_second_stage_reads_prior_output() {
    let def = build_definition(
        r#"
        {
            "name": "chained",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "y", "type": "integer"}]
            },
            "stages": [
                { "ref": "echo", "input": { "in": "=$.value" } },
                { "ref": "echo", "input": { "in": "=$.out" },
                  "output": { "pipeline.y": "=$.out" } }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let outcome = inst.run("", inputs(json!(42))).unwrap();
    assert_eq!(outcome.outputs.unwrap()["y"], json!(42));
}

#[test]
fn test_unknown_pipeline_output_fails() {
    let def = build_definition(
        r#"
        {
            "name": "bad-output",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "y", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "echo",
                    "input":  { "in": "=$.value" },
                    "output": { "pipeline.undeclared": "=$.out" }
                }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let err = inst.run("", inputs(json!(1))).unwrap_err();
    assert!(matches!(err, PipelineError::UnknownPipelineOutput { .. }));
}

#[test]
fn test_unknown_input_fails() {
    let def = build_definition(
        r#"
        {
            "name": "strict-inputs",
            "metadata": { "input": [{"name": "value", "type": "integer"}] },
            "stages": [ { "ref": "echo" } ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let err = inst
        .run("", HashMap::from([("bogus".to_string(), json!(1))]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownInput { .. }));
}

#[test]
fn test_input_defaults_and_coercion() {
    let def = build_definition(
        r#"
        {
            "name": "defaults",
            "metadata": {
                "input": [
                    {"name": "value", "type": "integer"},
                    {"name": "mode", "type": "string", "value": "auto"}
                ],
                "output": [{"name": "mode", "type": "string"}, {"name": "y", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "echo",
                    "input":  { "in": "=$.value" },
                    "output": { "pipeline.y": "=$.out", "pipeline.mode": "=$pipeline.mode" }
                }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    // the integer arrives as a numeric string and coerces on entry
    let outcome = inst.run("", inputs(json!("7"))).unwrap();
    let outputs = outcome.outputs.unwrap();
    assert_eq!(outputs["y"], json!(7));
    assert_eq!(outputs["mode"], json!("auto"));
}

#[test]
fn test_activity_panic_is_captured() {
    let def = build_definition(
        r#"
        {
            "name": "panicky",
            "metadata": { "input": [{"name": "value", "type": "integer"}] },
            "stages": [ { "ref": "panic" } ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let outcome = inst.run("", inputs(json!(1))).unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.outputs.is_none());
}

#[test]
fn test_stall_and_resume_via_timer() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let def = build_definition(
        r#"
        {
            "name": "stall-resume",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "y", "type": "string"}]
            },
            "stages": [
                { "ref": "stall", "output": { "pipeline.y": "=$.out" } }
            ]
        }
        "#,
    );
    let (tx, rx) = flume::unbounded();
    let inst = Instance::new(def, "t", true, Some(tx), None);

    let outcome = inst.run("", inputs(json!(1))).unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Stalled);
    assert!(outcome.outputs.is_none());

    // the one-shot timer resumes the event and publishes to the sink
    let outputs = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outputs["y"], json!("resumed"));

    inst.teardown();
}

#[test]
fn test_multi_group_isolation() {
    let def = build_definition(
        r#"
        {
            "name": "grouped-count",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "count", "type": "integer"}]
            },
            "stages": [
                { "ref": "count", "output": { "pipeline.count": "=$.count" } }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", false, None, None);

    let run = |disc: &str| {
        inst.run(disc, inputs(json!(1)))
            .unwrap()
            .outputs
            .unwrap()["count"]
            .clone()
    };

    assert_eq!(run("X"), json!(1));
    assert_eq!(run("X"), json!(2));
    // group Y never observed X's events
    assert_eq!(run("Y"), json!(1));
    assert_eq!(run("X"), json!(3));
    assert_eq!(run("Y"), json!(2));
}

#[test]
fn test_single_state_ignores_discriminator() {
    let def = build_definition(
        r#"
        {
            "name": "shared-count",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "count", "type": "integer"}]
            },
            "stages": [
                { "ref": "count", "output": { "pipeline.count": "=$.count" } }
            ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);

    let run = |disc: &str| {
        inst.run(disc, inputs(json!(1)))
            .unwrap()
            .outputs
            .unwrap()["count"]
            .clone()
    };

    assert_eq!(run("X"), json!(1));
    assert_eq!(run("Y"), json!(2));
}

#[test]
fn test_stage_scopes_are_read_only() {
    let def = build_definition(
        r#"
        {
            "name": "scopes",
            "metadata": { "input": [{"name": "value", "type": "integer"}] },
            "stages": [ { "ref": "echo" } ]
        }
        "#,
    );
    let inst = Instance::new(def, "t", true, None, None);
    let ctx = ExecutionContext::new(inst.clone(), "", inputs(json!(1)));

    let input_scope = StageInputScope::new(&ctx);
    assert!(matches!(
        input_scope.set_value("x", json!(1)),
        Err(PipelineError::ReadOnlyScope)
    ));

    let output_scope = StageOutputScope::new(&ctx);
    assert!(matches!(
        output_scope.set_value("x", json!(1)),
        Err(PipelineError::ReadOnlyScope)
    ));

    // the failed writes left nothing behind
    assert!(input_scope.get_value("x").is_none());
    assert!(output_scope.get_value("x").is_none());
}

#[test]
fn test_telemetry_event_sequence() {
    let def = build_definition(
        r#"
        {
            "name": "observed",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "y", "type": "integer"}]
            },
            "stages": [
                { "ref": "echo", "input": { "in": "=$.value" },
                  "output": { "pipeline.y": "=$.out" } }
            ]
        }
        "#,
    );
    let telemetry = Arc::new(RecordingTelemetry::default());
    let inst = Instance::new(def, "t", true, None, Some(telemetry.clone()));

    inst.run("", inputs(json!(1))).unwrap();

    let events = telemetry.events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "pipeline-started".to_string(),
            "stage-started:0-echo".to_string(),
            "stage-finished:0-echo".to_string(),
            "pipeline-finished".to_string(),
        ]
    );
}
