//! Core definitions for pipeline activities.
//!
//! An activity is one stage operator: it is evaluated once per event and may
//! report `done = false` to stall the pipeline until a timer resumes it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::data::IOMetadata;
use crate::error::{ActivityError, PipelineResult};
use crate::scope::SharedScope;

/// Per-activity mutable storage owned by a group state.
///
/// The engine hands the same map to every event of a group, letting an
/// activity persist state (e.g. an open window) across events. Locking the
/// map serialises that activity's work within the group.
pub type SharedData = Arc<Mutex<HashMap<String, Box<dyn Any + Send>>>>;

/// Callback invoked on a timer fire with the last stalled context.
/// Returns true when the pipeline should resume from the current stage.
pub type TimerCallback = Arc<dyn Fn(&mut dyn ActivityContext) -> bool + Send + Sync>;

/// The core trait for a stage operator.
pub trait Activity: Send + Sync {
    /// Declared inputs and outputs of this activity.
    fn metadata(&self) -> &IOMetadata;

    /// Processes the current event. Returning `Ok(false)` stalls the
    /// pipeline at this stage until a timer callback requests a resume.
    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError>;

    /// Called when a stalled event is resumed, before output mapping.
    /// The default implementation completes the stage.
    fn post_eval(&self, _ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        Ok(true)
    }

    /// Called when the owning definition is cleaned up.
    fn cleanup(&self) {}
}

impl std::fmt::Debug for dyn Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Activity")
            .field("metadata", self.metadata())
            .finish()
    }
}

/// Time-based advancement offered to activities by the execution context.
pub trait TimerSupport {
    /// Is a timer of the given kind registered for this activity?
    fn has_timer(&self, repeating: bool) -> bool;

    /// Creates and starts a timer. At most one timer and one ticker may
    /// exist per activity within a group state.
    fn create_timer(
        &mut self,
        interval: Duration,
        callback: TimerCallback,
        repeating: bool,
    ) -> PipelineResult<()>;

    /// Requests that, should the pipeline stall, the live timer be rebound
    /// to the current context so a later fire resumes the latest event.
    fn update_timer(&mut self, repeating: bool);

    /// Cancels and unregisters the timer. Idempotent.
    fn cancel_timer(&mut self, repeating: bool);
}

/// The view of the running pipeline an activity evaluates against.
pub trait ActivityContext {
    /// Id of the pipeline driving this evaluation.
    fn pipeline_id(&self) -> &str;

    /// A resolved setting of the current stage.
    fn get_setting(&self, name: &str) -> Option<Value>;

    /// An input value, falling back to the activity's declared default.
    fn get_input(&self, name: &str) -> Option<Value>;

    /// An output value produced so far in this evaluation.
    fn get_output(&self, name: &str) -> Option<Value>;

    /// Records an output value for this evaluation.
    fn set_output(&mut self, name: &str, value: Value);

    /// This activity's private storage within the current group state.
    fn shared_data(&self) -> SharedData;

    /// The mutable pipeline-level scope of the current group state.
    fn pipeline_scope(&self) -> Arc<SharedScope>;

    /// Returns the timer capability when the host supports it. Harness
    /// contexts without timers return `None` and activities fall back to
    /// self-ticking behavior.
    fn timer_support(&mut self) -> Option<&mut dyn TimerSupport> {
        None
    }
}

/// Construction-time context handed to activity factories.
pub struct InitContext<'a> {
    settings: &'a HashMap<String, Value>,
}

impl<'a> InitContext<'a> {
    pub fn new(settings: &'a HashMap<String, Value>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &HashMap<String, Value> {
        self.settings
    }

    pub fn get_setting(&self, name: &str) -> Option<&Value> {
        self.settings.get(name)
    }
}

/// A factory for stage-owned activity instances.
pub trait ActivityFactory: Send + Sync {
    fn create(&self, init_ctx: &InitContext) -> Result<Box<dyn Activity>, ActivityError>;
}
