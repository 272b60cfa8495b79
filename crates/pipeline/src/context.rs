//! Per-event execution context.
//!
//! An `ExecutionContext` is the cursor of one event moving through the
//! pipeline: the value buckets, the current stage, and the execution status.
//! It also implements the activity-facing context and timer capabilities.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error};

use crate::activity::{ActivityContext, SharedData, TimerCallback, TimerSupport};
use crate::data::ValueMap;
use crate::error::{PipelineError, PipelineResult};
use crate::instance::Instance;
use crate::scope::SharedScope;
use crate::stage::Stage;
use crate::state::{State, TickerHolder, TimerHolder};

/// Flag requesting that the one-shot timer be rebound on suspension.
pub const UPDATE_TIMER: u8 = 1;
/// Flag requesting that the repeating ticker be rebound on suspension.
pub const UPDATE_TICKER: u8 = 2;

/// Status of a single event's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Execution has not started.
    NotStarted,
    /// Execution is active.
    Active,
    /// Execution stalled at a stage and awaits a timer resume.
    Stalled,
    /// Execution completed.
    Completed,
    /// Execution was cancelled.
    Cancelled,
    /// Execution failed.
    Failed,
}

/// The cursor of one event through the pipeline, created per run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub(crate) inst: Arc<Instance>,
    pub(crate) discriminator: String,

    pub(crate) stage_id: usize,
    pub(crate) status: ExecutionStatus,

    /// The immutable input of the pipeline as a whole.
    pub(crate) pipeline_input: ValueMap,
    /// Accumulating outputs declared at the pipeline level.
    pub(crate) pipeline_output: ValueMap,
    /// Values carried forward by name across stages.
    pub(crate) pass_thru: ValueMap,
    /// The current stage's mapped input.
    pub(crate) current_input: ValueMap,
    /// The current stage's freshly produced output.
    pub(crate) current_output: ValueMap,

    /// Pending requests to rebind live timer holders on suspension.
    pub(crate) update_timers: u8,
}

impl ExecutionContext {
    pub(crate) fn new(inst: Arc<Instance>, discriminator: &str, inputs: ValueMap) -> Self {
        // the first stage's input mapper sees the pipeline input as the
        // "previous stage output"
        let current_output = inputs.clone();
        Self {
            inst,
            discriminator: discriminator.to_string(),
            stage_id: 0,
            status: ExecutionStatus::NotStarted,
            pipeline_input: inputs,
            pipeline_output: ValueMap::new(),
            pass_thru: ValueMap::new(),
            current_input: ValueMap::new(),
            current_output,
            update_timers: 0,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub(crate) fn current_stage(&self) -> &Stage {
        &self.inst.definition().stages()[self.stage_id]
    }

    pub(crate) fn state(&self) -> Arc<State> {
        self.inst.state_manager().get_state(&self.discriminator)
    }
}

impl ActivityContext for ExecutionContext {
    fn pipeline_id(&self) -> &str {
        self.inst.definition().id()
    }

    fn get_setting(&self, name: &str) -> Option<Value> {
        self.current_stage().settings().get(name).cloned()
    }

    fn get_input(&self, name: &str) -> Option<Value> {
        self.current_input.get(name).cloned().or_else(|| {
            self.current_stage()
                .activity()
                .metadata()
                .input
                .get(name)
                .and_then(|attr| attr.value.clone())
        })
    }

    fn get_output(&self, name: &str) -> Option<Value> {
        self.current_output.get(name).cloned().or_else(|| {
            self.current_stage()
                .activity()
                .metadata()
                .output
                .get(name)
                .and_then(|attr| attr.value.clone())
        })
    }

    fn set_output(&mut self, name: &str, value: Value) {
        self.current_output.insert(name.to_string(), value);
    }

    fn shared_data(&self) -> SharedData {
        self.state().shared_data(self.stage_id)
    }

    fn pipeline_scope(&self) -> Arc<SharedScope> {
        self.state().scope()
    }

    fn timer_support(&mut self) -> Option<&mut dyn TimerSupport> {
        Some(self)
    }
}

impl TimerSupport for ExecutionContext {
    fn has_timer(&self, repeating: bool) -> bool {
        let state = self.state();
        if repeating {
            state.get_ticker(self.stage_id).is_some()
        } else {
            state.get_timer(self.stage_id).is_some()
        }
    }

    fn create_timer(
        &mut self,
        interval: Duration,
        callback: TimerCallback,
        repeating: bool,
    ) -> PipelineResult<()> {
        let state = self.state();
        let stage_name = self.current_stage().name().to_string();
        let inst = Arc::downgrade(&self.inst);

        if repeating {
            let (holder, stop_rx) = state.new_ticker(self.stage_id, interval)?;
            if let Err(e) = spawn_ticker(inst, stage_name, holder, stop_rx, callback) {
                state.remove_ticker(self.stage_id);
                return Err(e);
            }
        } else {
            let (holder, stop_rx) = state.new_timer(self.stage_id, interval)?;
            if let Err(e) = spawn_timer(inst, stage_name, holder, stop_rx, callback) {
                state.remove_timer(self.stage_id);
                return Err(e);
            }
        }

        Ok(())
    }

    fn update_timer(&mut self, repeating: bool) {
        if repeating {
            self.update_timers |= UPDATE_TICKER;
        } else {
            self.update_timers |= UPDATE_TIMER;
        }
    }

    fn cancel_timer(&mut self, repeating: bool) {
        let state = self.state();
        if repeating {
            state.remove_ticker(self.stage_id);
        } else {
            state.remove_timer(self.stage_id);
        }
    }
}

/// Runs one timer fire: takes the bound context, invokes the activity
/// callback panic-safely, and resumes the pipeline when requested.
fn fire(
    inst: &Weak<Instance>,
    stage_name: &str,
    take_ctx: impl FnOnce() -> Option<ExecutionContext>,
    callback: &TimerCallback,
) -> bool {
    let Some(inst) = inst.upgrade() else {
        // instance is gone, tell the caller to shut the thread down
        return false;
    };

    let Some(mut ctx) = take_ctx() else {
        debug!(
            "timer fired for stage '{}' with no bound context, skipping",
            stage_name
        );
        return true;
    };

    ctx.status = ExecutionStatus::Active;
    debug!("timer fired for stage '{}'", stage_name);

    let callback = callback.clone();
    let result = catch_unwind(AssertUnwindSafe(move || {
        if callback(&mut ctx) {
            inst.resume(ctx);
        }
    }));

    if result.is_err() {
        error!("timer callback panicked for stage '{}'", stage_name);
    }
    true
}

fn spawn_ticker(
    inst: Weak<Instance>,
    stage_name: String,
    holder: Arc<TickerHolder>,
    stop_rx: flume::Receiver<()>,
    callback: TimerCallback,
) -> PipelineResult<()> {
    let interval = holder.interval();
    thread::Builder::new()
        .name(format!("ticker-{}", stage_name))
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(flume::RecvTimeoutError::Timeout) => {
                    if !fire(&inst, &stage_name, || holder.take(), &callback) {
                        break;
                    }
                }
                Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(PipelineError::Io)?;
    Ok(())
}

fn spawn_timer(
    inst: Weak<Instance>,
    stage_name: String,
    holder: Arc<TimerHolder>,
    stop_rx: flume::Receiver<()>,
    callback: TimerCallback,
) -> PipelineResult<()> {
    let interval = holder.interval();
    thread::Builder::new()
        .name(format!("timer-{}", stage_name))
        .spawn(move || {
            if let Err(flume::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                fire(&inst, &stage_name, || holder.take(), &callback);
            }
        })
        .map_err(PipelineError::Io)?;
    Ok(())
}
