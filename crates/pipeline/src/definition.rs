//! Pipeline definitions built from descriptors.

use tracing::debug;

use crate::config::DefinitionConfig;
use crate::data::IOMetadata;
use crate::error::PipelineResult;
use crate::mapper::MapperFactory;
use crate::registry::ActivityRegistry;
use crate::resolve::Resolver;
use crate::stage::Stage;

/// An ordered sequence of stages with declared pipeline inputs and outputs.
/// Immutable after load.
pub struct Definition {
    name: String,
    id: String,
    stages: Vec<Stage>,
    metadata: IOMetadata,
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("stages", &self.stages)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Definition {
    pub fn new(
        config: &DefinitionConfig,
        registry: &ActivityRegistry,
        mapper_factory: &MapperFactory,
        resolver: &Resolver,
    ) -> PipelineResult<Definition> {
        let mut stages = Vec::with_capacity(config.stages.len());
        for (index, stage_config) in config.stages.iter().enumerate() {
            stages.push(Stage::new(
                index,
                stage_config,
                registry,
                mapper_factory,
                resolver,
            )?);
        }

        let metadata = IOMetadata::new(
            config.metadata.input.clone(),
            config.metadata.output.clone(),
        );

        debug!(
            "pipeline definition '{}' built with {} stages",
            config.name,
            stages.len()
        );

        Ok(Definition {
            name: config.name.clone(),
            id: config.id.clone().unwrap_or_else(|| config.name.clone()),
            stages,
            metadata,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Invokes `cleanup` on every stage-owned activity.
    pub fn cleanup(&self) {
        for stage in &self.stages {
            stage.cleanup();
        }
    }
}
