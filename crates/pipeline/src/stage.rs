//! A stage binds an activity with its settings and mappers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::{Activity, InitContext};
use crate::config::StageConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::mapper::{Mapper, MapperFactory};
use crate::registry::ActivityRegistry;
use crate::resolve::Resolver;

/// One unit of pipeline work, immutable after load.
pub struct Stage {
    name: String,
    activity: Arc<dyn Activity>,
    owned: bool,
    settings: HashMap<String, Value>,
    input_mapper: Option<Mapper>,
    output_mapper: Option<Mapper>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("owned", &self.owned)
            .field("settings", &self.settings)
            .field("input_mapper", &self.input_mapper)
            .field("output_mapper", &self.output_mapper)
            .finish()
    }
}

impl Stage {
    pub(crate) fn new(
        index: usize,
        config: &StageConfig,
        registry: &ActivityRegistry,
        mapper_factory: &MapperFactory,
        resolver: &Resolver,
    ) -> PipelineResult<Stage> {
        if config.activity_ref.is_empty() {
            return Err(PipelineError::InvalidConfig {
                message: "activity not specified for stage".to_string(),
            });
        }

        // settings resolve before the activity is constructed so factories
        // see final values
        let settings: HashMap<String, Value> = config
            .settings
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    resolver.resolve_setting(name, value.clone()),
                )
            })
            .collect();

        let init_ctx = InitContext::new(&settings);
        let (activity, owned) = registry.create(&config.activity_ref, &init_ctx)?;

        let input_mapper = mapper_factory.new_mapper(&config.input)?;
        let output_mapper = mapper_factory.new_mapper(&config.output)?;

        Ok(Stage {
            name: format!("{}-{}", index, config.activity_ref),
            activity,
            owned,
            settings,
            input_mapper,
            output_mapper,
        })
    }

    /// Stage identifier used in logs and telemetry.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activity(&self) -> &Arc<dyn Activity> {
        &self.activity
    }

    pub(crate) fn settings(&self) -> &HashMap<String, Value> {
        &self.settings
    }

    pub(crate) fn input_mapper(&self) -> Option<&Mapper> {
        self.input_mapper.as_ref()
    }

    pub(crate) fn output_mapper(&self) -> Option<&Mapper> {
        self.output_mapper.as_ref()
    }

    pub(crate) fn cleanup(&self) {
        if self.owned {
            self.activity.cleanup();
        }
    }
}
