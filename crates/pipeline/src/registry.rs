//! Activity registry for resolving stage activity refs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::activity::{Activity, ActivityFactory, InitContext};
use crate::error::{PipelineError, PipelineResult};

enum Registration {
    /// Built per stage by a factory; the stage owns the instance.
    Factory(Box<dyn ActivityFactory>),
    /// A single shared instance reused across stages.
    Singleton(Arc<dyn Activity>),
}

/// Registry mapping activity ref strings to factories or shared instances.
///
/// Passed explicitly to the manager at construction; there is no
/// process-global registry.
#[derive(Default)]
pub struct ActivityRegistry {
    entries: HashMap<String, Registration>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory producing a stage-owned activity per stage.
    pub fn register(&mut self, activity_ref: &str, factory: Box<dyn ActivityFactory>) {
        self.entries
            .insert(activity_ref.to_string(), Registration::Factory(factory));
    }

    /// Registers a singleton activity shared by every referencing stage.
    pub fn register_singleton(&mut self, activity_ref: &str, activity: Arc<dyn Activity>) {
        self.entries
            .insert(activity_ref.to_string(), Registration::Singleton(activity));
    }

    /// Resolves `activity_ref`, returning the activity and whether the
    /// requesting stage owns it.
    pub fn create(
        &self,
        activity_ref: &str,
        init_ctx: &InitContext,
    ) -> PipelineResult<(Arc<dyn Activity>, bool)> {
        match self.entries.get(activity_ref) {
            Some(Registration::Factory(factory)) => {
                let activity = factory.create(init_ctx)?;
                Ok((Arc::from(activity), true))
            }
            Some(Registration::Singleton(activity)) => Ok((activity.clone(), false)),
            None => Err(PipelineError::UnsupportedActivity {
                name: activity_ref.to_string(),
            }),
        }
    }
}
