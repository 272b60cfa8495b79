//! Test harness for exercising activities outside a running instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::activity::{ActivityContext, SharedData};
use crate::data::ValueMap;
use crate::scope::SharedScope;

/// A standalone activity context without timer support.
///
/// Activities evaluated against it fall back to their self-ticking paths,
/// which keeps unit tests free of background threads.
pub struct TestActivityContext {
    settings: HashMap<String, Value>,
    inputs: ValueMap,
    outputs: ValueMap,
    shared: SharedData,
    scope: Arc<SharedScope>,
}

impl TestActivityContext {
    pub fn new(settings: HashMap<String, Value>) -> Self {
        Self {
            settings,
            inputs: ValueMap::new(),
            outputs: ValueMap::new(),
            shared: Arc::new(Mutex::new(HashMap::new())),
            scope: Arc::new(SharedScope::new()),
        }
    }

    pub fn set_input(&mut self, name: &str, value: Value) {
        self.inputs.insert(name.to_string(), value);
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

impl ActivityContext for TestActivityContext {
    fn pipeline_id(&self) -> &str {
        "test"
    }

    fn get_setting(&self, name: &str) -> Option<Value> {
        self.settings.get(name).cloned()
    }

    fn get_input(&self, name: &str) -> Option<Value> {
        self.inputs.get(name).cloned()
    }

    fn get_output(&self, name: &str) -> Option<Value> {
        self.outputs.get(name).cloned()
    }

    fn set_output(&mut self, name: &str, value: Value) {
        self.outputs.insert(name.to_string(), value);
    }

    fn shared_data(&self) -> SharedData {
        self.shared.clone()
    }

    fn pipeline_scope(&self) -> Arc<SharedScope> {
        self.scope.clone()
    }
}
