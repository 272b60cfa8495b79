//! Count and time windows over event samples.
//!
//! Count windows close on sample arrival; time windows close on wall-clock
//! advancement, driven either by an external timer calling `next_block` or
//! inline on `add_sample` when no timer is available. Callers serialise
//! access per group, so the windows themselves take `&mut self`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use pipeline::error::ActivityError;

use crate::functions::{preprocess, Acc, Function};
use crate::keyed::{BlockMapData, MapData};

/// Window construction settings. For time windows `size` and `resolution`
/// are durations in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub size: usize,
    pub resolution: usize,
    /// An external entity advances the window by calling `next_block`.
    pub external_timer: bool,

    pub total_count_modifier: usize,

    pub name_key: Option<String>,
    pub value_key: Option<String>,
}

impl Settings {
    pub fn new(size: usize, resolution: usize, external_timer: bool) -> Self {
        Self {
            size,
            resolution,
            external_timer,
            ..Default::default()
        }
    }

    /// Applies the `k=v` additional settings, matching keys
    /// case-insensitively.
    pub fn apply_additional(&mut self, additional: &HashMap<String, String>) {
        for (key, value) in additional {
            match key.to_ascii_lowercase().as_str() {
                "totalcountmodifier" => {
                    self.total_count_modifier = value.parse().unwrap_or(0);
                }
                "namekey" => self.name_key = Some(value.clone()),
                "valuekey" => self.value_key = Some(value.clone()),
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ActivityError> {
        if self.size == 0 {
            return Err(ActivityError::InvalidSetting {
                name: "windowSize".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.resolution == 0 {
            return Err(ActivityError::InvalidSetting {
                name: "resolution".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.name_key.is_some() && self.value_key.is_none() {
            return Err(ActivityError::InvalidSetting {
                name: "additionalSettings".to_string(),
                message: "nameKey requires valueKey".to_string(),
            });
        }
        Ok(())
    }

    fn keyed(&self, function: Function) -> Option<MapData> {
        self.name_key.as_ref().map(|name_key| {
            MapData::new(
                name_key.clone(),
                self.value_key.clone().unwrap_or_default(),
                function,
            )
        })
    }
}

/// A counting or time-bounded accumulator with close-and-emit semantics.
pub trait Window: Send {
    /// Ingests a sample, emitting when this sample closes a window.
    fn add_sample(&mut self, sample: &Value) -> (bool, Value);

    /// Returns this window as a time window when it supports external
    /// advancement.
    fn as_time_window(&mut self) -> Option<&mut dyn TimeWindow> {
        None
    }
}

/// A window advanced externally on a timer tick.
pub trait TimeWindow: Window {
    fn next_block(&mut self) -> (bool, Value);
}

/// Accumulates `size` samples, then finalises and resets.
pub struct TumblingWindow {
    function: Function,
    settings: Settings,

    acc: Acc,
    num_samples: usize,

    keyed: Option<MapData>,
}

pub fn new_tumbling_window(
    function: Function,
    settings: Settings,
) -> Result<Box<dyn Window>, ActivityError> {
    settings.validate()?;
    let keyed = settings.keyed(function);
    Ok(Box::new(TumblingWindow {
        function,
        settings,
        acc: Acc::Empty,
        num_samples: 0,
        keyed,
    }))
}

impl Window for TumblingWindow {
    fn add_sample(&mut self, sample: &Value) -> (bool, Value) {
        if let Some(keyed) = &mut self.keyed {
            keyed.add_sample(sample);
            self.num_samples += 1;

            // every key collects `size` samples before the window closes;
            // totalCountModifier overrides the key-count scaling
            let scale = match self.settings.total_count_modifier {
                0 => keyed.active_keys().max(1),
                modifier => modifier,
            };
            if self.num_samples >= self.settings.size * scale {
                self.num_samples = 0;
                return (true, keyed.extract());
            }
            return (false, Value::Null);
        }

        let sample = preprocess(sample);
        self.acc = self.function.add(std::mem::take(&mut self.acc), &sample);
        self.num_samples += 1;

        if self.num_samples == self.settings.size {
            let value = self.function.aggregate_single(&self.acc, self.settings.size);
            self.acc.zero();
            self.num_samples = 0;
            return (true, value);
        }

        (false, Value::Null)
    }
}

/// Accumulates like a tumbling window but closes on wall-clock time.
pub struct TumblingTimeWindow {
    function: Function,
    settings: Settings,

    acc: Acc,
    num_samples: usize,
    max_samples: usize,

    next_emit: Option<Instant>,

    keyed: Option<MapData>,
}

pub fn new_tumbling_time_window(
    function: Function,
    settings: Settings,
) -> Result<Box<dyn Window>, ActivityError> {
    settings.validate()?;
    let keyed = settings.keyed(function);
    Ok(Box::new(TumblingTimeWindow {
        function,
        settings,
        acc: Acc::Empty,
        num_samples: 0,
        max_samples: 0,
        next_emit: None,
        keyed,
    }))
}

impl TumblingTimeWindow {
    fn close(&mut self) -> (bool, Value) {
        let value = match &mut self.keyed {
            Some(keyed) => keyed.extract(),
            None => {
                let v = self
                    .function
                    .aggregate_single(&self.acc, self.max_samples.max(1));
                self.acc.zero();
                v
            }
        };

        self.num_samples = 0;
        if self.settings.total_count_modifier > 0 {
            self.max_samples = 0;
        }

        (true, value)
    }
}

impl Window for TumblingTimeWindow {
    fn add_sample(&mut self, sample: &Value) -> (bool, Value) {
        match &mut self.keyed {
            Some(keyed) => keyed.add_sample(sample),
            None => {
                let sample = preprocess(sample);
                self.acc = self.function.add(std::mem::take(&mut self.acc), &sample);
            }
        }

        self.num_samples += 1;
        if self.num_samples > self.max_samples {
            self.max_samples = self.num_samples;
        }

        if !self.settings.external_timer {
            let now = Instant::now();
            let size = Duration::from_millis(self.settings.size as u64);
            match self.next_emit {
                None => self.next_emit = Some(now + size),
                Some(at) if now >= at => {
                    self.next_emit = Some(now + size);
                    return self.close();
                }
                Some(_) => {}
            }
        }

        (false, Value::Null)
    }

    fn as_time_window(&mut self) -> Option<&mut dyn TimeWindow> {
        Some(self)
    }
}

impl TimeWindow for TumblingTimeWindow {
    fn next_block(&mut self) -> (bool, Value) {
        self.close()
    }
}

/// Keeps the last `size` raw samples in a ring, re-aggregating every
/// `resolution`-th sample once the ring has filled.
pub struct SlidingWindow {
    function: Function,
    settings: Settings,

    blocks: Vec<Acc>,
    num_samples: usize,
    current_block: usize,
    can_emit: bool,
}

pub fn new_sliding_window(
    function: Function,
    settings: Settings,
) -> Result<Box<dyn Window>, ActivityError> {
    settings.validate()?;
    if settings.name_key.is_some() {
        return Err(ActivityError::InvalidSetting {
            name: "additionalSettings".to_string(),
            message: "keyed sliding windows are not supported".to_string(),
        });
    }
    if settings.resolution > settings.size {
        return Err(ActivityError::InvalidSetting {
            name: "resolution".to_string(),
            message: "must not exceed windowSize".to_string(),
        });
    }
    Ok(Box::new(SlidingWindow {
        function,
        blocks: vec![Acc::Empty; settings.size],
        settings,
        num_samples: 0,
        current_block: 0,
        can_emit: false,
    }))
}

impl Window for SlidingWindow {
    fn add_sample(&mut self, sample: &Value) -> (bool, Value) {
        let sample = preprocess(sample);
        self.blocks[self.current_block] = Acc::from_sample(&sample);

        if !self.can_emit && self.current_block == self.settings.size - 1 {
            self.can_emit = true;
        }

        self.num_samples += 1;

        if self.can_emit && self.num_samples >= self.settings.resolution {
            let value = self
                .function
                .aggregate_blocks(&self.blocks, self.current_block, 1);
            self.num_samples = 0;
            self.current_block = (self.current_block + 1) % self.settings.size;
            return (true, value);
        }

        self.current_block = (self.current_block + 1) % self.settings.size;
        (false, Value::Null)
    }
}

/// A ring of `size / resolution` blocks, each accumulating one resolution
/// period. Ticks advance the ring; once it has filled, every tick emits an
/// aggregate over all blocks.
pub struct SlidingTimeWindow {
    function: Function,
    settings: Settings,

    num_blocks: usize,
    blocks: Vec<Acc>,
    num_samples: usize,
    max_samples: usize,
    current_block: usize,
    can_emit: bool,

    next_block_time: Option<Instant>,

    keyed: Option<BlockMapData>,
}

pub fn new_sliding_time_window(
    function: Function,
    settings: Settings,
) -> Result<Box<dyn Window>, ActivityError> {
    settings.validate()?;
    let num_blocks = settings.size / settings.resolution;
    if num_blocks == 0 {
        return Err(ActivityError::InvalidSetting {
            name: "resolution".to_string(),
            message: "must not exceed windowSize".to_string(),
        });
    }

    let keyed = settings.name_key.as_ref().map(|name_key| {
        BlockMapData::new(
            name_key.clone(),
            settings.value_key.clone().unwrap_or_default(),
            num_blocks,
            function,
        )
    });

    Ok(Box::new(SlidingTimeWindow {
        function,
        blocks: vec![Acc::Empty; num_blocks],
        settings,
        num_blocks,
        num_samples: 0,
        max_samples: 0,
        current_block: 0,
        can_emit: false,
        next_block_time: None,
        keyed,
    }))
}

impl SlidingTimeWindow {
    fn advance(&mut self) -> (bool, Value) {
        if !self.can_emit && self.current_block == self.num_blocks - 1 {
            self.can_emit = true;
        }

        self.num_samples = 0;
        self.current_block = (self.current_block + 1) % self.num_blocks;

        if self.can_emit {
            // the slot being reused still holds the oldest in-window block;
            // aggregate before zeroing it
            let value = match &mut self.keyed {
                Some(keyed) => keyed.extract(self.current_block),
                None => {
                    let v = self.function.aggregate_blocks(
                        &self.blocks,
                        self.current_block,
                        self.max_samples.max(1),
                    );
                    self.blocks[self.current_block].zero();
                    v
                }
            };
            return (true, value);
        }

        (false, Value::Null)
    }
}

impl Window for SlidingTimeWindow {
    fn add_sample(&mut self, sample: &Value) -> (bool, Value) {
        match &mut self.keyed {
            Some(keyed) => keyed.add_block_sample(self.current_block, sample),
            None => {
                let sample = preprocess(sample);
                self.blocks[self.current_block] = self
                    .function
                    .add(std::mem::take(&mut self.blocks[self.current_block]), &sample);
            }
        }

        self.num_samples += 1;
        if self.num_samples > self.max_samples {
            self.max_samples = self.num_samples;
        }

        if !self.settings.external_timer {
            let now = Instant::now();
            let resolution = Duration::from_millis(self.settings.resolution as u64);
            match self.next_block_time {
                None => self.next_block_time = Some(now + resolution),
                Some(at) if now >= at => {
                    self.next_block_time = Some(now + resolution);
                    return self.advance();
                }
                Some(_) => {}
            }
        }

        (false, Value::Null)
    }

    fn as_time_window(&mut self) -> Option<&mut dyn TimeWindow> {
        Some(self)
    }
}

impl TimeWindow for SlidingTimeWindow {
    fn next_block(&mut self) -> (bool, Value) {
        self.advance()
    }
}
