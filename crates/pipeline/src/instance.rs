//! The pipeline execution engine.
//!
//! An `Instance` drives events through the definition's stages. A stage
//! reporting `done = false` stalls the event; a timer callback later resumes
//! it from the same stage via `resume`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::context::{ExecutionContext, ExecutionStatus, UPDATE_TICKER, UPDATE_TIMER};
use crate::data::{coerce, ValueMap};
use crate::definition::Definition;
use crate::error::{PipelineError, PipelineResult};
use crate::scope::{StageInputScope, StageOutputScope};
use crate::stage::Stage;
use crate::state::{MultiStateManager, SingleStateManager, StateManager};
use crate::telemetry::TelemetryService;

const PREFIX_PIPELINE: &str = "pipeline.";
const PREFIX_PASSTHRU: &str = "passthru.";

/// The result of driving one event synchronously.
#[derive(Debug)]
pub struct RunOutcome {
    /// Pipeline-level outputs, present only when the event completed.
    pub outputs: Option<ValueMap>,
    pub status: ExecutionStatus,
}

/// A runnable pipeline bound to its per-group states and output sink.
pub struct Instance {
    def: Arc<Definition>,
    id: String,
    state_manager: Box<dyn StateManager>,
    sink: Option<flume::Sender<ValueMap>>,
    telemetry: Option<Arc<dyn TelemetryService>>,
}

impl Instance {
    /// Creates an instance. With `single` set, every event shares one state
    /// regardless of discriminator.
    pub fn new(
        def: Arc<Definition>,
        id: impl Into<String>,
        single: bool,
        sink: Option<flume::Sender<ValueMap>>,
        telemetry: Option<Arc<dyn TelemetryService>>,
    ) -> Arc<Instance> {
        let state_manager: Box<dyn StateManager> = if single {
            Box::new(SingleStateManager::new())
        } else {
            Box::new(MultiStateManager::new())
        };

        Arc::new(Instance {
            def,
            id: id.into(),
            state_manager,
            sink,
            telemetry,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.def
    }

    pub(crate) fn state_manager(&self) -> &dyn StateManager {
        self.state_manager.as_ref()
    }

    /// Stops every timer registered across group states.
    pub fn teardown(&self) {
        self.state_manager.teardown();
    }

    /// Synchronously drives one event until it completes, fails or stalls.
    pub fn run(
        self: &Arc<Self>,
        discriminator: &str,
        inputs: ValueMap,
    ) -> PipelineResult<RunOutcome> {
        let inputs = self.prepare_inputs(inputs)?;

        let mut ctx = ExecutionContext::new(self.clone(), discriminator, inputs);
        ctx.status = ExecutionStatus::Active;

        if let Some(t) = &self.telemetry {
            t.pipeline_started(self.def.id(), &self.id, &ctx.pipeline_input);
        }

        loop {
            match self.do_step(&mut ctx) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    debug!(
                        "pipeline[{}] execution failed: {}",
                        self.def.name(),
                        e
                    );
                    ctx.status = ExecutionStatus::Failed;
                    return Err(e);
                }
            }
        }

        match ctx.status {
            ExecutionStatus::Completed => {
                if let Some(t) = &self.telemetry {
                    t.pipeline_finished(self.def.id(), &self.id, &ctx.pipeline_output);
                }
                Ok(RunOutcome {
                    outputs: Some(ctx.pipeline_output),
                    status: ExecutionStatus::Completed,
                })
            }
            ExecutionStatus::Stalled => {
                self.flush_timer_updates(&mut ctx);
                Ok(RunOutcome {
                    outputs: None,
                    status: ExecutionStatus::Stalled,
                })
            }
            status => Ok(RunOutcome {
                outputs: None,
                status,
            }),
        }
    }

    /// Continues a stalled event from a timer thread. Completion publishes
    /// the pipeline output to the sink; failures are logged.
    pub(crate) fn resume(self: &Arc<Self>, mut ctx: ExecutionContext) {
        debug!(
            "pipeline[{}] resuming stage {}",
            self.def.name(),
            ctx.stage_id
        );
        ctx.status = ExecutionStatus::Active;

        let done = match self.resume_stage(&mut ctx) {
            Ok(done) => done,
            Err(e) => {
                error!(
                    "pipeline[{}] resume of stage {} failed: {}",
                    self.def.name(),
                    ctx.stage_id,
                    e
                );
                return;
            }
        };

        if !done && ctx.status != ExecutionStatus::Failed {
            ctx.status = ExecutionStatus::Stalled;
        }

        if done && ctx.status != ExecutionStatus::Failed {
            ctx.stage_id += 1;
            if ctx.stage_id >= self.def.stages().len() {
                ctx.status = ExecutionStatus::Completed;
            } else {
                loop {
                    match self.do_step(&mut ctx) {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            error!(
                                "pipeline[{}] execution failed after resume: {}",
                                self.def.name(),
                                e
                            );
                            ctx.status = ExecutionStatus::Failed;
                            break;
                        }
                    }
                }
            }
        }

        match ctx.status {
            ExecutionStatus::Completed => {
                debug!("pipeline[{}] execution completed", self.def.name());
                if let Some(t) = &self.telemetry {
                    t.pipeline_finished(self.def.id(), &self.id, &ctx.pipeline_output);
                }
                if let Some(sink) = &self.sink {
                    if sink.send(ctx.pipeline_output).is_err() {
                        debug!("pipeline[{}] output sink disconnected", self.def.name());
                    }
                }
            }
            ExecutionStatus::Stalled => self.flush_timer_updates(&mut ctx),
            _ => {}
        }
    }

    /// Executes the current stage and advances the cursor. Returns whether
    /// more work remains for this event.
    fn do_step(&self, ctx: &mut ExecutionContext) -> PipelineResult<bool> {
        let num_stages = self.def.stages().len();
        if ctx.stage_id >= num_stages {
            return Ok(false);
        }

        let done = self.execute_stage(ctx)?;

        if !done {
            if ctx.status != ExecutionStatus::Failed {
                debug!("pipeline[{}] partial execution completed", self.def.name());
                ctx.status = ExecutionStatus::Stalled;
            }
            return Ok(false);
        }

        ctx.stage_id += 1;
        if ctx.stage_id < num_stages {
            Ok(true)
        } else {
            debug!("pipeline[{}] execution completed", self.def.name());
            ctx.status = ExecutionStatus::Completed;
            Ok(false)
        }
    }

    fn execute_stage(&self, ctx: &mut ExecutionContext) -> PipelineResult<bool> {
        let stage = &self.def.stages()[ctx.stage_id];
        debug!(
            "pipeline[{}] executing stage {}",
            self.def.name(),
            stage.name()
        );
        if let Some(t) = &self.telemetry {
            t.stage_started(self.def.id(), &self.id, stage.name(), &ctx.current_input);
        }

        if let Some(mapper) = stage.input_mapper() {
            debug!("pipeline[{}] applying input mapper", self.def.name());
            let mapped = {
                let scope = StageInputScope::new(ctx);
                mapper.apply(&scope)?
            };
            ctx.current_input = mapped;
        } else {
            // no mapping specified, the prior stage output flows through
            ctx.current_input = std::mem::take(&mut ctx.current_output);
        }
        ctx.current_output = ValueMap::new();

        let eval = catch_unwind(AssertUnwindSafe(|| {
            stage.activity().eval(ctx)
        }));

        let done = match eval {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(e.into()),
            Err(panic) => {
                error!(
                    "pipeline[{}] activity panicked in stage {}",
                    self.def.name(),
                    stage.name()
                );
                debug!("stage {} panic payload: {:?}", stage.name(), panic);
                ctx.status = ExecutionStatus::Failed;
                false
            }
        };

        if done {
            self.apply_output_mapper(ctx, stage)?;
            if let Some(t) = &self.telemetry {
                t.stage_finished(self.def.id(), &self.id, stage.name(), &ctx.current_output);
            }
        }

        Ok(done)
    }

    /// Post-evaluates the current stage after a timer resume and applies the
    /// output mapper on success.
    fn resume_stage(&self, ctx: &mut ExecutionContext) -> PipelineResult<bool> {
        let stage = &self.def.stages()[ctx.stage_id];

        let eval = catch_unwind(AssertUnwindSafe(|| {
            stage.activity().post_eval(ctx)
        }));

        let done = match eval {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(e.into()),
            Err(panic) => {
                error!(
                    "pipeline[{}] activity panicked in post-eval of stage {}",
                    self.def.name(),
                    stage.name()
                );
                debug!("stage {} panic payload: {:?}", stage.name(), panic);
                ctx.status = ExecutionStatus::Failed;
                false
            }
        };

        if done {
            self.apply_output_mapper(ctx, stage)?;
            if let Some(t) = &self.telemetry {
                t.stage_finished(self.def.id(), &self.id, stage.name(), &ctx.current_output);
            }
        }

        Ok(done)
    }

    /// Routes output-mapper results into the pipeline output, passthru and
    /// stage-local buckets by key prefix. Routing is transactional: a failed
    /// key leaves every bucket untouched.
    fn apply_output_mapper(
        &self,
        ctx: &mut ExecutionContext,
        stage: &Stage,
    ) -> PipelineResult<()> {
        let Some(mapper) = stage.output_mapper() else {
            return Ok(());
        };

        debug!("pipeline[{}] applying output mapper", self.def.name());
        let results = {
            let scope = StageOutputScope::new(ctx);
            mapper.apply(&scope)?
        };

        let mut to_pipeline = Vec::new();
        let mut to_passthru = Vec::new();
        let mut to_stage = Vec::new();

        for (key, value) in results {
            if let Some(name) = key.strip_prefix(PREFIX_PIPELINE) {
                let attr = self.def.metadata().output.get(name).ok_or_else(|| {
                    PipelineError::UnknownPipelineOutput {
                        name: name.to_string(),
                    }
                })?;
                to_pipeline.push((name.to_string(), coerce::to_type(value, attr.value_type)?));
            } else if let Some(name) = key.strip_prefix(PREFIX_PASSTHRU) {
                to_passthru.push((name.to_string(), value));
            } else {
                to_stage.push((key, value));
            }
        }

        ctx.pipeline_output.extend(to_pipeline);
        ctx.pass_thru.extend(to_passthru);
        ctx.current_output.extend(to_stage);

        Ok(())
    }

    /// Rebinds live timer holders to the stalled context when the stage
    /// requested it during evaluation.
    fn flush_timer_updates(&self, ctx: &mut ExecutionContext) {
        let flags = std::mem::take(&mut ctx.update_timers);
        if flags == 0 {
            return;
        }

        let state = self.state_manager.get_state(&ctx.discriminator);

        if flags & UPDATE_TICKER != 0 {
            if let Some(holder) = state.get_ticker(ctx.stage_id) {
                holder.bind(ctx.clone());
            }
        }
        if flags & UPDATE_TIMER != 0 {
            if let Some(holder) = state.get_timer(ctx.stage_id) {
                holder.bind(ctx.clone());
            }
        }
    }

    /// Validates inputs against declared pipeline metadata, fills declared
    /// defaults and coerces values to their declared types.
    fn prepare_inputs(&self, inputs: ValueMap) -> PipelineResult<ValueMap> {
        let metadata = self.def.metadata();

        let mut prepared = ValueMap::with_capacity(metadata.input.len());
        for attr in metadata.input.values() {
            if let Some(default) = &attr.value {
                prepared.insert(attr.name.clone(), default.clone());
            }
        }

        for (name, value) in inputs {
            let attr = metadata
                .input
                .get(&name)
                .ok_or_else(|| PipelineError::UnknownInput { name: name.clone() })?;
            prepared.insert(name, coerce::to_type(value, attr.value_type)?);
        }

        Ok(prepared)
    }
}
