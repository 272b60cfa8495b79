//! Windowed aggregation activity.
//!
//! Collects event values into a per-group window and emits the aggregate
//! when the window closes. Count windows close on sample arrival; time
//! windows register a ticker with the engine and close on its ticks,
//! falling back to self-ticking when the host has no timer support.

pub mod functions;
pub mod keyed;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use pipeline::activity::{
    Activity, ActivityContext, ActivityFactory, InitContext, TimerCallback,
};
use pipeline::data::{Attribute, IOMetadata, Type};
use pipeline::error::ActivityError;
use pipeline::registry::ActivityRegistry;

use crate::functions::Function;
use crate::window::{
    new_sliding_time_window, new_sliding_window, new_tumbling_time_window, new_tumbling_window,
    Settings as WindowSettings, Window,
};

/// Registry ref of the aggregate activity.
pub const ACTIVITY_REF: &str = "aggregate";

const IV_VALUE: &str = "value";
const OV_RESULT: &str = "result";
const OV_REPORT: &str = "report";

const WINDOW_KEY: &str = "window";

/// Stage settings of the aggregate activity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub function: String,
    pub window_type: String,
    pub window_size: usize,
    pub resolution: usize,
    pub proceed_only_on_emit: bool,
    pub additional_settings: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            function: String::new(),
            window_type: String::new(),
            window_size: 0,
            resolution: 1,
            proceed_only_on_emit: true,
            additional_settings: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowType {
    Tumbling,
    Sliding,
    TimeTumbling,
    TimeSliding,
}

impl WindowType {
    fn parse(name: &str) -> Result<WindowType, ActivityError> {
        match name.to_ascii_lowercase().as_str() {
            "tumbling" => Ok(WindowType::Tumbling),
            "sliding" => Ok(WindowType::Sliding),
            "timetumbling" => Ok(WindowType::TimeTumbling),
            "timesliding" => Ok(WindowType::TimeSliding),
            _ => Err(ActivityError::UnsupportedWindowType {
                window_type: name.to_string(),
            }),
        }
    }
}

/// Registers the aggregate activity with `registry`.
pub fn register(registry: &mut ActivityRegistry) {
    registry.register(ACTIVITY_REF, Box::new(AggregateFactory));
}

pub struct AggregateFactory;

impl ActivityFactory for AggregateFactory {
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

        AggregateActivity::new(&settings).map(|a| Box::new(a) as Box<dyn Activity>)
    }
}

pub struct AggregateActivity {
    function: Function,
    window_type: WindowType,
    window_size: usize,
    resolution: usize,
    proceed_only_on_emit: bool,
    additional: HashMap<String, String>,

    metadata: IOMetadata,
}

impl AggregateActivity {
    pub fn new(settings: &Settings) -> Result<AggregateActivity, ActivityError> {
        let function = Function::parse(&settings.function)?;
        let window_type = WindowType::parse(&settings.window_type)?;
        let additional = parse_params(&settings.additional_settings)?;

        let activity = AggregateActivity {
            function,
            window_type,
            window_size: settings.window_size,
            resolution: settings.resolution,
            proceed_only_on_emit: settings.proceed_only_on_emit,
            additional,
            metadata: IOMetadata::new(
                vec![Attribute::new(IV_VALUE, Type::Any)],
                vec![
                    Attribute::new(OV_REPORT, Type::Boolean),
                    Attribute::new(OV_RESULT, Type::Any),
                ],
            ),
        };

        // window configuration errors surface here, not on the first event
        activity.build_window(false)?;

        Ok(activity)
    }

    fn window_settings(&self, external_timer: bool) -> WindowSettings {
        let mut settings =
            WindowSettings::new(self.window_size, self.resolution, external_timer);
        settings.apply_additional(&self.additional);
        settings
    }

    fn build_window(&self, external_timer: bool) -> Result<Box<dyn Window>, ActivityError> {
        let settings = self.window_settings(external_timer);
        match self.window_type {
            WindowType::Tumbling => new_tumbling_window(self.function, settings),
            WindowType::Sliding => new_sliding_window(self.function, settings),
            WindowType::TimeTumbling => new_tumbling_time_window(self.function, settings),
            WindowType::TimeSliding => new_sliding_time_window(self.function, settings),
        }
    }

    fn ticker_interval(&self) -> Option<Duration> {
        match self.window_type {
            WindowType::TimeTumbling => Some(Duration::from_millis(self.window_size as u64)),
            WindowType::TimeSliding => Some(Duration::from_millis(self.resolution as u64)),
            _ => None,
        }
    }
}

impl Activity for AggregateActivity {
    fn metadata(&self) -> &IOMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let timer_supported = ctx.timer_support().is_some();

        let shared = ctx.shared_data();
        let mut guard = shared.lock().unwrap();

        let created = !guard.contains_key(WINDOW_KEY);
        if created {
            let window = self.build_window(timer_supported)?;
            guard.insert(WINDOW_KEY.to_string(), Box::new(window));
        }

        let window = guard
            .get_mut(WINDOW_KEY)
            .and_then(|w| w.downcast_mut::<Box<dyn Window>>())
            .ok_or_else(|| ActivityError::Other("window storage corrupted".to_string()))?;

        let value = ctx.get_input(IV_VALUE).unwrap_or(Value::Null);
        let (emit, result) = window.add_sample(&value);
        drop(guard);

        if created {
            if let Some(interval) = self.ticker_interval() {
                let proceed_only_on_emit = self.proceed_only_on_emit;
                let callback: TimerCallback =
                    Arc::new(move |cb_ctx| move_window(cb_ctx, proceed_only_on_emit));

                if let Some(ts) = ctx.timer_support() {
                    if !ts.has_timer(true) {
                        ts.create_timer(interval, callback, true)
                            .map_err(|e| ActivityError::Other(e.to_string()))?;
                    }
                }
            }
        }

        if let Some(ts) = ctx.timer_support() {
            ts.update_timer(true);
        }

        ctx.set_output(OV_RESULT, result);
        ctx.set_output(OV_REPORT, Value::Bool(emit));

        Ok(!(self.proceed_only_on_emit && !emit))
    }

    fn post_eval(&self, _ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        Ok(true)
    }
}

/// Ticker callback: advances the group's time window and reports whether the
/// stalled pipeline should resume.
fn move_window(ctx: &mut dyn ActivityContext, proceed_only_on_emit: bool) -> bool {
    let shared = ctx.shared_data();
    let mut guard = shared.lock().unwrap();

    let Some(window) = guard
        .get_mut(WINDOW_KEY)
        .and_then(|w| w.downcast_mut::<Box<dyn Window>>())
    else {
        return false;
    };
    let Some(time_window) = window.as_time_window() else {
        return false;
    };

    let (emit, result) = time_window.next_block();
    drop(guard);

    ctx.set_output(OV_RESULT, result);
    ctx.set_output(OV_REPORT, Value::Bool(emit));

    !(proceed_only_on_emit && !emit)
}

/// Parses the `k=v,k=v` additional-settings string.
fn parse_params(values: &str) -> Result<HashMap<String, String>, ActivityError> {
    let mut params = HashMap::new();
    if values.is_empty() {
        return Ok(params);
    }

    for pair in values.split(',') {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(ActivityError::InvalidSetting {
                name: "additionalSettings".to_string(),
                message: format!("invalid entry '{}'", pair),
            });
        };
        params.insert(name.trim().to_string(), value.trim().to_string());
    }

    Ok(params)
}
