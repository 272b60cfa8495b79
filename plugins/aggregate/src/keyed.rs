//! Per-key partitioning for windows configured with a name key.
//!
//! Samples are expected to be objects; the value under the name key selects
//! the partition and the value under the value key feeds its accumulator.
//! Emission yields a `{key -> aggregated value}` object.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use pipeline::data::coerce;

use crate::functions::{preprocess, Acc, Function};

#[derive(Debug, Default, Clone)]
struct DataInfo {
    count: usize,
    value: Acc,
}

/// Single-accumulator partitions, used by tumbling windows.
#[derive(Debug)]
pub struct MapData {
    name_key: String,
    value_key: String,
    function: Function,
    data: HashMap<String, DataInfo>,
}

impl MapData {
    pub fn new(name_key: String, value_key: String, function: Function) -> Self {
        Self {
            name_key,
            value_key,
            function,
            data: HashMap::new(),
        }
    }

    pub fn add_sample(&mut self, sample: &Value) {
        let Some(obj) = sample.as_object() else {
            warn!("keyed window sample is not an object, dropping");
            return;
        };

        let key = obj
            .get(&self.name_key)
            .map(coerce::to_string)
            .unwrap_or_default();
        let raw = obj.get(&self.value_key).cloned().unwrap_or(Value::Null);
        let sample = preprocess(&raw);

        let info = self.data.entry(key).or_default();
        info.count += 1;
        info.value = self.function.add(std::mem::take(&mut info.value), &sample);
    }

    /// Number of keys seen in the open window.
    pub fn active_keys(&self) -> usize {
        self.data.len()
    }

    /// Aggregates every partition and resets the window.
    pub fn extract(&mut self) -> Value {
        let mut out = serde_json::Map::with_capacity(self.data.len());
        for (key, info) in &self.data {
            out.insert(
                key.clone(),
                self.function.aggregate_single(&info.value, info.count),
            );
        }
        self.data.clear();
        Value::Object(out)
    }
}

/// Per-block partitions, used by time-sliding windows.
#[derive(Debug)]
pub struct BlockMapData {
    name_key: String,
    value_key: String,
    num_blocks: usize,
    function: Function,
    data: HashMap<String, Vec<Option<DataInfo>>>,
}

impl BlockMapData {
    pub fn new(
        name_key: String,
        value_key: String,
        num_blocks: usize,
        function: Function,
    ) -> Self {
        Self {
            name_key,
            value_key,
            num_blocks,
            function,
            data: HashMap::new(),
        }
    }

    pub fn add_block_sample(&mut self, block_id: usize, sample: &Value) {
        let Some(obj) = sample.as_object() else {
            warn!("keyed window sample is not an object, dropping");
            return;
        };

        let key = obj
            .get(&self.name_key)
            .map(coerce::to_string)
            .unwrap_or_default();
        let raw = obj.get(&self.value_key).cloned().unwrap_or(Value::Null);
        let sample = preprocess(&raw);

        let blocks = self
            .data
            .entry(key)
            .or_insert_with(|| vec![None; self.num_blocks]);
        let info = blocks[block_id].get_or_insert_with(DataInfo::default);
        info.count += 1;
        info.value = self.function.add(std::mem::take(&mut info.value), &sample);
    }

    /// Aggregates every partition's ring and zeroes the block that is about
    /// to be overwritten.
    pub fn extract(&mut self, block_id: usize) -> Value {
        let mut out = serde_json::Map::with_capacity(self.data.len());

        for (key, blocks) in &self.data {
            let ring: Vec<Acc> = blocks
                .iter()
                .map(|b| b.as_ref().map(|i| i.value.clone()).unwrap_or_default())
                .collect();
            let count = blocks[block_id]
                .as_ref()
                .map(|i| i.count)
                .unwrap_or(1)
                .max(1);
            out.insert(
                key.clone(),
                self.function.aggregate_blocks(&ring, block_id, count),
            );
        }

        for blocks in self.data.values_mut() {
            blocks[block_id] = None;
        }

        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_data_partitions_by_key() {
        let mut md = MapData::new("k".into(), "v".into(), Function::Avg);
        md.add_sample(&json!({"k": "a", "v": 2}));
        md.add_sample(&json!({"k": "b", "v": 10}));
        md.add_sample(&json!({"k": "a", "v": 4}));
        md.add_sample(&json!({"k": "b", "v": 20}));

        assert_eq!(md.active_keys(), 2);
        let out = md.extract();
        assert_eq!(out, json!({"a": 3, "b": 15}));
        // the window reset with the emission
        assert_eq!(md.active_keys(), 0);
    }

    #[test]
    fn test_map_data_ignores_non_objects() {
        let mut md = MapData::new("k".into(), "v".into(), Function::Sum);
        md.add_sample(&json!(5));
        assert_eq!(md.active_keys(), 0);
    }

    #[test]
    fn test_block_map_data_rolls_blocks() {
        let mut md = BlockMapData::new("k".into(), "v".into(), 2, Function::Sum);
        md.add_block_sample(0, &json!({"k": "a", "v": 1}));
        md.add_block_sample(1, &json!({"k": "a", "v": 2}));

        let out = md.extract(0);
        assert_eq!(out, json!({"a": 3}));

        // block 0 was zeroed for reuse, block 1 still carries its value
        md.add_block_sample(0, &json!({"k": "a", "v": 10}));
        let out = md.extract(1);
        assert_eq!(out, json!({"a": 12}));
    }
}
