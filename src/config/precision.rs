//! Output tolerance policy
//!
//! Tolerances grow with `calc_times` (roughly `head_dim * context_len`).
//! The breakpoints are tuned constants, so they are carried as data: each
//! dtype owns an ascending list of `(from_calc_times, max_rel_err)` pairs
//! and the last pair whose threshold is reached applies.

use crate::error::{Error, Result};
use crate::inference::StorageDType;
use serde::{Deserialize, Serialize};

/// Tolerance from `from_calc_times` upward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionBreakpoint {
    pub from_calc_times: usize,
    pub max_rel_err: f32,
}

impl PrecisionBreakpoint {
    pub const fn new(from_calc_times: usize, max_rel_err: f32) -> Self {
        Self {
            from_calc_times,
            max_rel_err,
        }
    }
}

/// Per-dtype tolerance tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionPolicy {
    #[serde(default = "default_float16")]
    pub float16: Vec<PrecisionBreakpoint>,
    #[serde(default = "default_bfloat16")]
    pub bfloat16: Vec<PrecisionBreakpoint>,
    #[serde(default = "default_float32")]
    pub float32: Vec<PrecisionBreakpoint>,
}

fn default_float16() -> Vec<PrecisionBreakpoint> {
    vec![
        PrecisionBreakpoint::new(0, 1.0 / 256.0),
        PrecisionBreakpoint::new(2048, 1.0 / 128.0),
        PrecisionBreakpoint::new(16384, 1.0 / 64.0),
    ]
}

fn default_bfloat16() -> Vec<PrecisionBreakpoint> {
    vec![
        PrecisionBreakpoint::new(0, 1.0 / 128.0),
        PrecisionBreakpoint::new(2048, 1.0 / 64.0),
        PrecisionBreakpoint::new(16384, 1.0 / 32.0),
    ]
}

fn default_float32() -> Vec<PrecisionBreakpoint> {
    vec![PrecisionBreakpoint::new(0, 1.0 / 2048.0)]
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self {
            float16: default_float16(),
            bfloat16: default_bfloat16(),
            float32: default_float32(),
        }
    }
}

/// Outcome of [`PrecisionPolicy::compare`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionReport {
    pub limit: f32,
    pub max_rel_err: f32,
    pub mean_rel_err: f32,
    /// Elements above `limit` (NaN counts as above)
    pub num_over: usize,
    pub num_elements: usize,
}

impl PrecisionReport {
    pub fn passed(&self) -> bool {
        self.num_over == 0
    }
}

impl PrecisionPolicy {
    pub fn validate(&self) -> Result<()> {
        for (name, table) in [
            ("float16", &self.float16),
            ("bfloat16", &self.bfloat16),
            ("float32", &self.float32),
        ] {
            if table.first().map(|b| b.from_calc_times) != Some(0) {
                return Err(Error::Config {
                    reason: format!("{name} tolerance table must start at calc_times 0"),
                });
            }
            if table
                .windows(2)
                .any(|w| w[0].from_calc_times >= w[1].from_calc_times)
            {
                return Err(Error::Config {
                    reason: format!("{name} breakpoints must be strictly ascending"),
                });
            }
            if table
                .iter()
                .any(|b| !(b.max_rel_err.is_finite() && b.max_rel_err > 0.0))
            {
                return Err(Error::Config {
                    reason: format!("{name} tolerances must be finite and positive"),
                });
            }
        }
        Ok(())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(content).map_err(|e| Error::Config {
            reason: format!("JSON parse error: {e}"),
        })?;
        policy.validate()?;
        Ok(policy)
    }

    fn table(&self, dtype: StorageDType) -> Result<&[PrecisionBreakpoint]> {
        match dtype {
            StorageDType::F16 => Ok(&self.float16),
            StorageDType::BF16 => Ok(&self.bfloat16),
            StorageDType::F32 => Ok(&self.float32),
            StorageDType::Int8 => Err(Error::InvalidArgument {
                arg: "dtype",
                reason: "int8 is a cache format, compare outputs as f32/f16/bf16".into(),
            }),
        }
    }

    /// Maximum relative error allowed for `dtype` at `calc_times`.
    pub fn limit(&self, dtype: StorageDType, calc_times: usize) -> Result<f32> {
        self.table(dtype)?
            .iter()
            .take_while(|b| b.from_calc_times <= calc_times)
            .last()
            .map(|b| b.max_rel_err)
            .ok_or(Error::Config {
                reason: "empty tolerance table".into(),
            })
    }

    /// Relative error of `actual` against `golden`, with magnitudes below 1.0
    /// treated as 1.0.
    pub fn compare(
        &self,
        dtype: StorageDType,
        actual: &[f32],
        golden: &[f32],
        calc_times: usize,
    ) -> Result<PrecisionReport> {
        if actual.len() != golden.len() {
            return Err(Error::shape("actual", &[golden.len()], &[actual.len()]));
        }
        let limit = self.limit(dtype, calc_times)?;

        let mut max_rel_err = 0.0f32;
        let mut sum = 0.0f64;
        let mut num_over = 0;
        for (&a, &g) in actual.iter().zip(golden) {
            let err = if a == g {
                0.0
            } else {
                (a - g).abs() / g.abs().max(1.0)
            };
            if err.is_nan() || err > limit {
                num_over += 1;
            }
            if err.is_nan() || err > max_rel_err {
                max_rel_err = err;
            }
            sum += err as f64;
        }

        Ok(PrecisionReport {
            limit,
            max_rel_err,
            mean_rel_err: if actual.is_empty() {
                0.0
            } else {
                (sum / actual.len() as f64) as f32
            },
            num_over,
            num_elements: actual.len(),
        })
    }
}
