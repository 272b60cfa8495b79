//! Pluggable telemetry for pipeline and stage lifecycle events.

use crate::data::ValueMap;

/// Receives engine lifecycle events. Implementations decide transport; the
/// engine only requires that callbacks return quickly and never panic.
pub trait TelemetryService: Send + Sync {
    fn pipeline_started(&self, pipeline_id: &str, instance_id: &str, data: &ValueMap);

    fn stage_started(&self, pipeline_id: &str, instance_id: &str, stage_id: &str, data: &ValueMap);

    fn stage_finished(&self, pipeline_id: &str, instance_id: &str, stage_id: &str, data: &ValueMap);

    fn pipeline_finished(&self, pipeline_id: &str, instance_id: &str, data: &ValueMap);
}
