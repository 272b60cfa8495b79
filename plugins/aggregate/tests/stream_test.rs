//! End-to-end pipelines driving the aggregate and filter activities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use pipeline::config::DefinitionConfig;
use pipeline::context::ExecutionStatus;
use pipeline::data::ValueMap;
use pipeline::error::PipelineError;
use pipeline::manager::Manager;
use pipeline::registry::ActivityRegistry;
use pipeline::resolve::Resolver;
use pipeline::stream::{Stream, StreamSettings};

fn manager() -> Manager {
    let mut registry = ActivityRegistry::new();
    aggregate_activity::register(&mut registry);
    filter_activity::register(&mut registry);
    Manager::new(Arc::new(registry), Arc::new(Resolver::new()))
}

fn stream(
    descriptor: &str,
    group_by: Option<&str>,
    sink: Option<flume::Sender<ValueMap>>,
) -> Stream {
    let m = manager();
    let config: DefinitionConfig = serde_json::from_str(descriptor).unwrap();
    m.register_resource("under-test", config);

    Stream::new(
        &m,
        StreamSettings {
            pipeline_uri: "res://under-test".to_string(),
            group_by: group_by.map(String::from),
        },
        sink,
        None,
    )
    .unwrap()
}

fn event(value: Value) -> ValueMap {
    HashMap::from([("value".to_string(), value)])
}

#[test]
fn test_tumbling_avg_gates_downstream_stage() {
    // aggregate stalls on non-emitting samples, so only closing samples
    // reach the filter stage
    let s = stream(
        r#"
        {
            "name": "rolling-avg",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "result", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "aggregate",
                    "settings": {
                        "function": "avg",
                        "windowType": "tumbling",
                        "windowSize": 2,
                        "proceedOnlyOnEmit": true
                    }
                },
                {
                    "ref": "filter",
                    "settings": { "type": "non-zero", "proceedOnlyOnEmit": false },
                    "input":  { "value": "=$.result" },
                    "output": { "pipeline.result": "=$.value" }
                }
            ]
        }
        "#,
        None,
        None,
    );

    let r = s.run(event(json!(2))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Stalled);
    assert!(r.outputs.is_none());

    let r = s.run(event(json!(4))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Completed);
    assert_eq!(r.outputs.unwrap()["result"], json!(3));

    let r = s.run(event(json!(10))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Stalled);

    let r = s.run(event(json!(20))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Completed);
    assert_eq!(r.outputs.unwrap()["result"], json!(15));
}

#[test]
fn test_non_zero_filter_reports_without_stalling() {
    let s = stream(
        r#"
        {
            "name": "flagging-filter",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [
                    {"name": "filtered", "type": "boolean"},
                    {"name": "value", "type": "integer"}
                ]
            },
            "stages": [
                {
                    "ref": "filter",
                    "settings": { "type": "non-zero", "proceedOnlyOnEmit": false },
                    "output": {
                        "pipeline.filtered": "=$.filtered",
                        "pipeline.value": "=$.value"
                    }
                }
            ]
        }
        "#,
        None,
        None,
    );

    let r = s.run(event(json!(2))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Completed);
    let outputs = r.outputs.unwrap();
    assert_eq!(outputs["filtered"], json!(false));
    assert_eq!(outputs["value"], json!(2));

    // the zero event is flagged but still completes
    let r = s.run(event(json!(0))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Completed);
    let outputs = r.outputs.unwrap();
    assert_eq!(outputs["filtered"], json!(true));
    assert_eq!(outputs["value"], json!(0));
}

#[test]
fn test_sliding_sum_emits_after_warmup() {
    let s = stream(
        r#"
        {
            "name": "sliding-sum",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "result", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "aggregate",
                    "settings": {
                        "function": "sum",
                        "windowType": "sliding",
                        "windowSize": 3,
                        "resolution": 1
                    },
                    "output": { "pipeline.result": "=$.result" }
                }
            ]
        }
        "#,
        None,
        None,
    );

    let mut results = Vec::new();
    for v in 1..=5 {
        let r = s.run(event(json!(v))).unwrap();
        results.push(r.outputs.map(|o| o["result"].clone()));
    }

    assert_eq!(
        results,
        vec![
            None,
            None,
            Some(json!(6)),
            Some(json!(9)),
            Some(json!(12))
        ]
    );
}

#[test]
fn test_keyed_tumbling_avg() {
    let s = stream(
        r#"
        {
            "name": "keyed-avg",
            "metadata": {
                "input":  [{"name": "sample", "type": "object"}],
                "output": [{"name": "result", "type": "object"}]
            },
            "stages": [
                {
                    "ref": "aggregate",
                    "settings": {
                        "function": "avg",
                        "windowType": "tumbling",
                        "windowSize": 2,
                        "additionalSettings": "nameKey=k,valueKey=v"
                    },
                    "input":  { "value": "=$.sample" },
                    "output": { "pipeline.result": "=$.result" }
                }
            ]
        }
        "#,
        None,
        None,
    );

    let samples = [
        json!({"k": "a", "v": 2}),
        json!({"k": "b", "v": 10}),
        json!({"k": "a", "v": 4}),
    ];
    for sample in samples {
        let r = s
            .run(HashMap::from([("sample".to_string(), sample)]))
            .unwrap();
        assert_eq!(r.status, ExecutionStatus::Stalled);
    }

    let r = s
        .run(HashMap::from([(
            "sample".to_string(),
            json!({"k": "b", "v": 20}),
        )]))
        .unwrap();
    assert_eq!(r.status, ExecutionStatus::Completed);
    assert_eq!(r.outputs.unwrap()["result"], json!({"a": 3, "b": 15}));
}

#[test]
fn test_groups_keep_independent_windows() {
    let s = stream(
        r#"
        {
            "name": "grouped-avg",
            "metadata": {
                "input": [
                    {"name": "group", "type": "string"},
                    {"name": "value", "type": "integer"}
                ],
                "output": [{"name": "result", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "aggregate",
                    "settings": {
                        "function": "avg",
                        "windowType": "tumbling",
                        "windowSize": 2
                    },
                    "output": { "pipeline.result": "=$.result" }
                }
            ]
        }
        "#,
        Some("group"),
        None,
    );

    let run = |group: &str, value: i64| {
        s.run(HashMap::from([
            ("group".to_string(), json!(group)),
            ("value".to_string(), json!(value)),
        ]))
        .unwrap()
    };

    assert_eq!(run("X", 2).status, ExecutionStatus::Stalled);
    assert_eq!(run("Y", 100).status, ExecutionStatus::Stalled);

    // X closes its window with X samples only
    let r = run("X", 4);
    assert_eq!(r.status, ExecutionStatus::Completed);
    assert_eq!(r.outputs.unwrap()["result"], json!(3));

    // Y never observed X's samples
    let r = run("Y", 200);
    assert_eq!(r.status, ExecutionStatus::Completed);
    assert_eq!(r.outputs.unwrap()["result"], json!(150));
}

#[test]
fn test_time_tumbling_count_with_engine_ticker() {
    let (tx, rx) = flume::unbounded();
    let s = stream(
        r#"
        {
            "name": "windowed-count",
            "metadata": {
                "input":  [{"name": "value", "type": "integer"}],
                "output": [{"name": "total", "type": "integer"}]
            },
            "stages": [
                {
                    "ref": "aggregate",
                    "settings": {
                        "function": "count",
                        "windowType": "timeTumbling",
                        "windowSize": 100,
                        "proceedOnlyOnEmit": true
                    },
                    "output": { "pipeline.total": "=$.result" }
                }
            ]
        }
        "#,
        None,
        Some(tx),
    );

    for v in [10, 20, 30] {
        let r = s.run(event(json!(v))).unwrap();
        assert_eq!(r.status, ExecutionStatus::Stalled);
    }

    // the engine ticker closes the window and resumes the stalled event
    let outputs = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outputs["total"], json!(3));

    // the window restarted from zero samples
    let r = s.run(event(json!(40))).unwrap();
    assert_eq!(r.status, ExecutionStatus::Stalled);
    let outputs = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outputs["total"], json!(1));

    s.shutdown();
}

#[test]
fn test_unknown_activity_fails_at_load() {
    let m = manager();
    let config: DefinitionConfig = serde_json::from_str(
        r#"
        {
            "name": "broken",
            "stages": [ { "ref": "does-not-exist" } ]
        }
        "#,
    )
    .unwrap();
    m.register_resource("broken", config);

    let err = m.get_pipeline("res://broken").unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedActivity { .. }));
}

#[test]
fn test_window_config_errors_fail_at_load() {
    let m = manager();
    let config: DefinitionConfig = serde_json::from_str(
        r#"
        {
            "name": "bad-window",
            "stages": [
                {
                    "ref": "aggregate",
                    "settings": {
                        "function": "avg",
                        "windowType": "sliding",
                        "windowSize": 3,
                        "additionalSettings": "nameKey=k,valueKey=v"
                    }
                }
            ]
        }
        "#,
    )
    .unwrap();
    m.register_resource("bad-window", config);

    let err = m.get_pipeline("res://bad-window").unwrap_err();
    assert!(matches!(err, PipelineError::Activity(_)));
}
