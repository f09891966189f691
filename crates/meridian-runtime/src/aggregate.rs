//! Streaming aggregation accumulators for windowed processing.
//!
//! Accumulators fold one value at a time so a window never buffers raw
//! events. Percentile is the exception to exactness: it keeps a bounded
//! reservoir sample and reports the percentile of the sample.

use meridian_core::{PipelineError, Result, Value};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Reservoir size for percentile estimation.
const RESERVOIR_CAP: usize = 1024;

/// Supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Percentile in (0, 100], e.g. `{"percentile": 95.0}`.
    Percentile(f64),
}

impl AggFunc {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "count" => Ok(AggFunc::Count),
            "sum" => Ok(AggFunc::Sum),
            "avg" => Ok(AggFunc::Avg),
            "min" => Ok(AggFunc::Min),
            "max" => Ok(AggFunc::Max),
            other => {
                if let Some(p) = other.strip_prefix('p').and_then(|s| s.parse::<f64>().ok()) {
                    if p > 0.0 && p <= 100.0 {
                        return Ok(AggFunc::Percentile(p));
                    }
                }
                Err(PipelineError::Validation(format!(
                    "unknown aggregate function: {other}"
                )))
            }
        }
    }

    pub fn name(&self) -> String {
        match self {
            AggFunc::Count => "count".into(),
            AggFunc::Sum => "sum".into(),
            AggFunc::Avg => "avg".into(),
            AggFunc::Min => "min".into(),
            AggFunc::Max => "max".into(),
            AggFunc::Percentile(p) => format!("p{p}"),
        }
    }
}

/// One aggregate requested of a window: function plus the event field it
/// reads. Count ignores the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggSpec {
    pub func: AggFunc,
    #[serde(default)]
    pub field: Option<String>,
}

/// Incremental state for one aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Accumulator {
    Count {
        n: u64,
    },
    Sum {
        total: f64,
    },
    Avg {
        total: f64,
        n: u64,
    },
    Min {
        min: Option<f64>,
    },
    Max {
        max: Option<f64>,
    },
    Percentile {
        p: f64,
        sample: Vec<f64>,
        seen: u64,
        #[serde(skip, default = "seeded_rng")]
        rng: SmallRng,
    },
}

fn seeded_rng() -> SmallRng {
    SmallRng::seed_from_u64(0x6d6572696469616e)
}

impl Accumulator {
    pub fn for_func(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => Accumulator::Count { n: 0 },
            AggFunc::Sum => Accumulator::Sum { total: 0.0 },
            AggFunc::Avg => Accumulator::Avg { total: 0.0, n: 0 },
            AggFunc::Min => Accumulator::Min { min: None },
            AggFunc::Max => Accumulator::Max { max: None },
            AggFunc::Percentile(p) => Accumulator::Percentile {
                p,
                sample: Vec::new(),
                seen: 0,
                rng: seeded_rng(),
            },
        }
    }

    /// Fold one observation. Count accepts `None`; the numeric functions
    /// skip events missing the field.
    pub fn observe(&mut self, value: Option<f64>) {
        match self {
            Accumulator::Count { n } => *n += 1,
            Accumulator::Sum { total } => {
                if let Some(v) = value {
                    *total += v;
                }
            }
            Accumulator::Avg { total, n } => {
                if let Some(v) = value {
                    *total += v;
                    *n += 1;
                }
            }
            Accumulator::Min { min } => {
                if let Some(v) = value {
                    *min = Some(min.map_or(v, |m: f64| m.min(v)));
                }
            }
            Accumulator::Max { max } => {
                if let Some(v) = value {
                    *max = Some(max.map_or(v, |m: f64| m.max(v)));
                }
            }
            Accumulator::Percentile {
                sample, seen, rng, ..
            } => {
                if let Some(v) = value {
                    *seen += 1;
                    if sample.len() < RESERVOIR_CAP {
                        sample.push(v);
                    } else {
                        // Algorithm R: element i replaces a slot with
                        // probability cap/i.
                        let slot = rng.gen_range(0..*seen);
                        if (slot as usize) < RESERVOIR_CAP {
                            sample[slot as usize] = v;
                        }
                    }
                }
            }
        }
    }

    /// Final value of the accumulator. Empty numeric accumulators yield
    /// Null, an empty count yields 0.
    pub fn finish(&self) -> Value {
        match self {
            Accumulator::Count { n } => Value::Int(*n as i64),
            Accumulator::Sum { total } => Value::Float(*total),
            Accumulator::Avg { total, n } => {
                if *n == 0 {
                    Value::Null
                } else {
                    Value::Float(total / *n as f64)
                }
            }
            Accumulator::Min { min } => min.map_or(Value::Null, Value::Float),
            Accumulator::Max { max } => max.map_or(Value::Null, Value::Float),
            Accumulator::Percentile { p, sample, .. } => {
                if sample.is_empty() {
                    return Value::Null;
                }
                let mut sorted = sample.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
                Value::Float(sorted[rank.clamp(1, sorted.len()) - 1])
            }
        }
    }
}
