//! Filter activity.
//!
//! Flags events whose value fails the configured predicate. With
//! `proceedOnlyOnEmit` the pipeline stalls on filtered events instead of
//! passing them through flagged.

pub mod filters;

use serde::Deserialize;
use serde_json::Value;

use pipeline::activity::{Activity, ActivityContext, ActivityFactory, InitContext};
use pipeline::data::{Attribute, IOMetadata, Type};
use pipeline::error::ActivityError;
use pipeline::registry::ActivityRegistry;

use crate::filters::is_non_zero;

/// Registry ref of the filter activity.
pub const ACTIVITY_REF: &str = "filter";

const IV_VALUE: &str = "value";
const OV_FILTERED: &str = "filtered";
const OV_VALUE: &str = "value";

const FILTER_NON_ZERO: &str = "non-zero";

/// Stage settings of the filter activity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub proceed_only_on_emit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            filter_type: FILTER_NON_ZERO.to_string(),
            proceed_only_on_emit: true,
        }
    }
}

/// Registers the filter activity with `registry`.
pub fn register(registry: &mut ActivityRegistry) {
    registry.register(ACTIVITY_REF, Box::new(FilterFactory));
}

pub struct FilterFactory;

impl ActivityFactory for FilterFactory {
    fn create(&self, init_ctx: &InitContext) -> Result<Box<dyn Activity>, ActivityError> {
        let raw = Value::Object(
            init_ctx
                .settings()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let settings: Settings = serde_json::from_value(raw)
            .map_err(|e| ActivityError::InvalidSetting {
                name: "settings".to_string(),
                message: e.to_string(),
            })?;

        FilterActivity::new(&settings).map(|a| Box::new(a) as Box<dyn Activity>)
    }
}

pub struct FilterActivity {
    proceed_only_on_emit: bool,
    metadata: IOMetadata,
}

impl FilterActivity {
    pub fn new(settings: &Settings) -> Result<FilterActivity, ActivityError> {
        if settings.filter_type != FILTER_NON_ZERO {
            return Err(ActivityError::UnsupportedFilter {
                filter_type: settings.filter_type.clone(),
            });
        }

        Ok(FilterActivity {
            proceed_only_on_emit: settings.proceed_only_on_emit,
            metadata: IOMetadata::new(
                vec![Attribute::new(IV_VALUE, Type::Any)],
                vec![
                    Attribute::new(OV_FILTERED, Type::Boolean),
                    Attribute::new(OV_VALUE, Type::Any),
                ],
            ),
        })
    }
}

impl Activity for FilterActivity {
    fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let value = ctx.get_input(IV_VALUE).unwrap_or(Value::Null);
        let filtered = !is_non_zero(&value);

        ctx.set_output(OV_FILTERED, Value::Bool(filtered));
        ctx.set_output(OV_VALUE, value);

        Ok(!(self.proceed_only_on_emit && filtered))
    }
}
