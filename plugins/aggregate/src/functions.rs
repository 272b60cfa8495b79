//! Aggregation functions over window accumulators.
//!
//! Each function is a fold step plus two finalisers: one for windows that
//! keep a single running accumulator and one for windows that re-aggregate a
//! ring of blocks. Samples are preprocessed into a tagged variant once, so
//! numeric-string coercion stays out of the accumulator path.

use pipeline::error::ActivityError;
use serde_json::{json, Value};

/// A named aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    Accumulate,
}

impl Function {
    pub fn parse(name: &str) -> Result<Function, ActivityError> {
        match name.to_ascii_lowercase().as_str() {
            "avg" => Ok(Function::Avg),
            "sum" => Ok(Function::Sum),
            "min" => Ok(Function::Min),
            "max" => Ok(Function::Max),
            "count" => Ok(Function::Count),
            "accumulate" => Ok(Function::Accumulate),
            _ => Err(ActivityError::UnsupportedFunction {
                function: name.to_string(),
            }),
        }
    }
}

/// A sample after type dispatch and numeric-string coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Int(i64),
    Float(f64),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
    Other(Value),
}

impl Sample {
    pub fn to_value(&self) -> Value {
        match self {
            Sample::Int(n) => json!(n),
            Sample::Float(f) => json!(f),
            Sample::IntVec(v) => json!(v),
            Sample::FloatVec(v) => json!(v),
            Sample::Other(v) => v.clone(),
        }
    }
}

/// Classifies a raw value, parsing numeric strings into floats.
pub fn preprocess(value: &Value) -> Sample {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sample::Int(i),
            None => Sample::Float(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => match s.parse::<f64>() {
            Ok(f) => Sample::Float(f),
            Err(_) => Sample::Other(value.clone()),
        },
        Value::Array(items) => {
            if items.iter().all(|v| v.as_i64().is_some()) {
                Sample::IntVec(items.iter().filter_map(Value::as_i64).collect())
            } else if items.iter().all(|v| v.as_f64().is_some()) {
                Sample::FloatVec(items.iter().filter_map(Value::as_f64).collect())
            } else {
                Sample::Other(value.clone())
            }
        }
        _ => Sample::Other(value.clone()),
    }
}

/// A running accumulator with a zero value per variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Acc {
    #[default]
    Empty,
    Int(i64),
    Float(f64),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
    List(Vec<Value>),
}

impl Acc {
    pub fn from_sample(sample: &Sample) -> Acc {
        match sample {
            Sample::Int(n) => Acc::Int(*n),
            Sample::Float(f) => Acc::Float(*f),
            Sample::IntVec(v) => Acc::IntVec(v.clone()),
            Sample::FloatVec(v) => Acc::FloatVec(v.clone()),
            Sample::Other(v) => Acc::List(vec![v.clone()]),
        }
    }

    /// Resets to the zero of the current variant.
    pub fn zero(&mut self) {
        match self {
            Acc::Empty => {}
            Acc::Int(n) => *n = 0,
            Acc::Float(f) => *f = 0.0,
            Acc::IntVec(v) => v.iter_mut().for_each(|x| *x = 0),
            Acc::FloatVec(v) => v.iter_mut().for_each(|x| *x = 0.0),
            Acc::List(l) => l.clear(),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Acc::Empty => Value::Null,
            Acc::Int(n) => json!(n),
            Acc::Float(f) => json!(f),
            Acc::IntVec(v) => json!(v),
            Acc::FloatVec(v) => json!(v),
            Acc::List(l) => Value::Array(l),
        }
    }
}

impl Function {
    /// The fold step: absorbs one sample into the accumulator. Samples the
    /// function cannot handle leave the accumulator unchanged.
    pub fn add(&self, acc: Acc, sample: &Sample) -> Acc {
        match self {
            Function::Sum | Function::Avg => add_sum(acc, sample),
            Function::Min => add_cmp(acc, sample, true),
            Function::Max => add_cmp(acc, sample, false),
            Function::Count => match acc {
                Acc::Empty => Acc::Int(1),
                Acc::Int(n) => Acc::Int(n + 1),
                other => other,
            },
            Function::Accumulate => {
                let mut list = match acc {
                    Acc::List(l) => l,
                    Acc::Empty => Vec::new(),
                    other => vec![other.into_value()],
                };
                list.push(sample.to_value());
                Acc::List(list)
            }
        }
    }

    /// Finalises a running accumulator holding `count` samples.
    pub fn aggregate_single(&self, acc: &Acc, count: usize) -> Value {
        match self {
            Function::Sum | Function::Min | Function::Max | Function::Accumulate => {
                acc.clone().into_value()
            }
            Function::Count => match acc {
                Acc::Int(n) => json!(n),
                Acc::Empty => json!(0),
                other => other.clone().into_value(),
            },
            Function::Avg => {
                let count = count.max(1);
                match acc {
                    Acc::Empty => Value::Null,
                    Acc::Int(n) => json!(n / count as i64),
                    Acc::Float(f) => json!(f / count as f64),
                    Acc::IntVec(v) => {
                        json!(v.iter().map(|x| x / count as i64).collect::<Vec<_>>())
                    }
                    Acc::FloatVec(v) => {
                        json!(v.iter().map(|x| x / count as f64).collect::<Vec<_>>())
                    }
                    Acc::List(l) => Value::Array(l.clone()),
                }
            }
        }
    }

    /// Finalises a ring of blocks. For count-based sliding windows each
    /// block holds one raw sample and `count` is 1; for time-based sliding
    /// windows each block holds one resolution period's accumulation and
    /// `count` is the per-block sample high-water mark.
    pub fn aggregate_blocks(&self, blocks: &[Acc], _current: usize, count: usize) -> Value {
        match self {
            Function::Sum => merge_all(blocks, add_sum).into_value(),
            Function::Min => merge_all(blocks, |a, s| add_cmp(a, s, true)).into_value(),
            Function::Max => merge_all(blocks, |a, s| add_cmp(a, s, false)).into_value(),
            Function::Count => json!((blocks.len() * count.max(1)) as i64),
            Function::Avg => {
                let total = blocks.len().max(1) * count.max(1);
                match merge_all(blocks, add_sum) {
                    Acc::Empty => Value::Null,
                    Acc::Int(n) => json!(n / total as i64),
                    Acc::Float(f) => json!(f / total as f64),
                    Acc::IntVec(v) => {
                        json!(v.iter().map(|x| x / total as i64).collect::<Vec<_>>())
                    }
                    Acc::FloatVec(v) => {
                        json!(v.iter().map(|x| x / total as f64).collect::<Vec<_>>())
                    }
                    Acc::List(l) => Value::Array(l),
                }
            }
            Function::Accumulate => {
                let mut out = Vec::new();
                for block in blocks {
                    match block {
                        Acc::Empty => {}
                        Acc::List(l) => out.extend(l.iter().cloned()),
                        other => out.push(other.clone().into_value()),
                    }
                }
                Value::Array(out)
            }
        }
    }
}

fn merge_all(blocks: &[Acc], step: impl Fn(Acc, &Sample) -> Acc) -> Acc {
    let mut merged = Acc::Empty;
    for block in blocks {
        merged = match block {
            Acc::Empty => merged,
            Acc::Int(n) => step(merged, &Sample::Int(*n)),
            Acc::Float(f) => step(merged, &Sample::Float(*f)),
            Acc::IntVec(v) => step(merged, &Sample::IntVec(v.clone())),
            Acc::FloatVec(v) => step(merged, &Sample::FloatVec(v.clone())),
            Acc::List(l) => step(merged, &Sample::Other(Value::Array(l.clone()))),
        };
    }
    merged
}

fn add_sum(acc: Acc, sample: &Sample) -> Acc {
    match (acc, sample) {
        (Acc::Empty, s) => Acc::from_sample(s),
        (Acc::Int(a), Sample::Int(b)) => Acc::Int(a + b),
        (Acc::Int(a), Sample::Float(b)) => Acc::Float(a as f64 + b),
        (Acc::Float(a), Sample::Int(b)) => Acc::Float(a + *b as f64),
        (Acc::Float(a), Sample::Float(b)) => Acc::Float(a + b),
        (Acc::IntVec(mut v), Sample::IntVec(s)) => {
            for (x, y) in v.iter_mut().zip(s) {
                *x += y;
            }
            Acc::IntVec(v)
        }
        (Acc::IntVec(v), Sample::FloatVec(s)) => {
            let mut promoted: Vec<f64> = v.iter().map(|&x| x as f64).collect();
            for (x, y) in promoted.iter_mut().zip(s) {
                *x += y;
            }
            Acc::FloatVec(promoted)
        }
        (Acc::FloatVec(mut v), Sample::FloatVec(s)) => {
            for (x, y) in v.iter_mut().zip(s) {
                *x += y;
            }
            Acc::FloatVec(v)
        }
        (Acc::FloatVec(mut v), Sample::IntVec(s)) => {
            for (x, y) in v.iter_mut().zip(s) {
                *x += *y as f64;
            }
            Acc::FloatVec(v)
        }
        (acc, _) => acc,
    }
}

fn add_cmp(acc: Acc, sample: &Sample, min: bool) -> Acc {
    fn pick_i(a: i64, b: i64, min: bool) -> i64 {
        if min {
            a.min(b)
        } else {
            a.max(b)
        }
    }
    fn pick_f(a: f64, b: f64, min: bool) -> f64 {
        if min {
            a.min(b)
        } else {
            a.max(b)
        }
    }

    match (acc, sample) {
        (Acc::Empty, s) => Acc::from_sample(s),
        (Acc::Int(a), Sample::Int(b)) => Acc::Int(pick_i(a, *b, min)),
        (Acc::Int(a), Sample::Float(b)) => Acc::Float(pick_f(a as f64, *b, min)),
        (Acc::Float(a), Sample::Int(b)) => Acc::Float(pick_f(a, *b as f64, min)),
        (Acc::Float(a), Sample::Float(b)) => Acc::Float(pick_f(a, *b, min)),
        (Acc::IntVec(mut v), Sample::IntVec(s)) => {
            for (x, y) in v.iter_mut().zip(s) {
                *x = pick_i(*x, *y, min);
            }
            Acc::IntVec(v)
        }
        (Acc::FloatVec(mut v), Sample::FloatVec(s)) => {
            for (x, y) in v.iter_mut().zip(s) {
                *x = pick_f(*x, *y, min);
            }
            Acc::FloatVec(v)
        }
        (acc, _) => acc,
    }
}
