//! Entry point binding a pipeline to a grouped event stream.
//!
//! A `Stream` resolves its pipeline through the manager, derives the group
//! discriminator from a configured input name, and publishes completed
//! outputs to an optional sink.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::context::ExecutionStatus;
use crate::data::{coerce, ValueMap};
use crate::definition::Definition;
use crate::error::{PipelineError, PipelineResult};
use crate::instance::{Instance, RunOutcome};
use crate::manager::Manager;
use crate::telemetry::TelemetryService;

/// Configuration of one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    /// URI of the pipeline to run (`res://`, `file://` or `http(s)://`).
    pub pipeline_uri: String,
    /// Name of the input whose value selects the group state. Absent means
    /// a single shared state.
    pub group_by: Option<String>,
}

/// A pipeline bound to a grouped input stream.
pub struct Stream {
    definition: Arc<Definition>,
    instance: Arc<Instance>,
    group_by: Option<String>,
    sink: Option<flume::Sender<ValueMap>>,
}

impl Stream {
    pub fn new(
        manager: &Manager,
        settings: StreamSettings,
        sink: Option<flume::Sender<ValueMap>>,
        telemetry: Option<Arc<dyn TelemetryService>>,
    ) -> PipelineResult<Stream> {
        if settings.pipeline_uri.is_empty() {
            return Err(PipelineError::InvalidConfig {
                message: "pipeline URI not specified".to_string(),
            });
        }

        let definition = manager.get_pipeline(&settings.pipeline_uri)?;

        let instance = Instance::new(
            definition.clone(),
            Uuid::new_v4().to_string(),
            settings.group_by.is_none(),
            sink.clone(),
            telemetry,
        );

        Ok(Stream {
            definition,
            instance,
            group_by: settings.group_by,
            sink,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    /// Runs one event, grouping it by the configured discriminator input.
    pub fn run(&self, inputs: ValueMap) -> PipelineResult<RunOutcome> {
        let discriminator = match &self.group_by {
            Some(key) => inputs
                .get(key)
                .map(coerce::to_string)
                .unwrap_or_default(),
            None => String::new(),
        };

        debug!(
            "running pipeline '{}' for group '{}'",
            self.definition.name(),
            discriminator
        );

        let outcome = self.instance.run(&discriminator, inputs)?;

        if outcome.status == ExecutionStatus::Completed {
            if let (Some(sink), Some(outputs)) = (&self.sink, &outcome.outputs) {
                if sink.send(outputs.clone()).is_err() {
                    debug!(
                        "output sink for pipeline '{}' disconnected",
                        self.definition.name()
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Stops per-group timers and cleans up stage-owned activities.
    pub fn shutdown(&self) {
        self.instance.teardown();
        self.definition.cleanup();
    }
}
