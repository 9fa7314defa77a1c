//! Online softmax accumulator (flash-attention recurrence)
//!
//! One [`AttentionState`] per `(token, head)`. Tiles may arrive in any order
//! and with any width; the finalized result matches a single-pass softmax up
//! to rounding. All accumulation is `f32`.

use super::simd::{accumulate_weighted, scale_in_place};
use crate::error::{Error, Result};

/// Lifecycle of an [`AttentionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No unmasked score seen yet.
    Empty,
    Accumulating,
    Finalized,
}

/// Running max, running sum and running weighted-value accumulator.
#[derive(Debug, Clone)]
pub struct AttentionState {
    running_max: f32,
    running_sum: f32,
    running_output: Vec<f32>,
    phase: Phase,
}

impl AttentionState {
    pub fn new(head_dim_v: usize) -> Self {
        Self {
            running_max: f32::NEG_INFINITY,
            running_sum: 0.0,
            running_output: vec![0.0; head_dim_v],
            phase: Phase::Empty,
        }
    }

    pub fn reset(&mut self) {
        self.running_max = f32::NEG_INFINITY;
        self.running_sum = 0.0;
        self.running_output.fill(0.0);
        self.phase = Phase::Empty;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn running_max(&self) -> f32 {
        self.running_max
    }

    pub fn running_sum(&self) -> f32 {
        self.running_sum
    }

    pub fn head_dim_v(&self) -> usize {
        self.running_output.len()
    }

    /// Fold one tile: `scores[j]` weights value row `values[j]`.
    pub fn update(&mut self, scores: &[f32], values: &[f32]) -> Result<()> {
        let dv = self.running_output.len();
        if self.phase == Phase::Finalized {
            return Err(Error::InvalidArgument {
                arg: "state",
                reason: "attention state already finalized".into(),
            });
        }
        if values.len() != scores.len() * dv {
            return Err(Error::shape("value tile", &[scores.len(), dv], &[values.len()]));
        }

        // NaN wins so bad input propagates instead of being dropped.
        let tile_max = scores.iter().fold(f32::NEG_INFINITY, |m, &s| {
            if m.is_nan() || s.is_nan() { f32::NAN } else { m.max(s) }
        });
        if tile_max == f32::NEG_INFINITY {
            return Ok(());
        }

        let new_max = match self.phase {
            Phase::Empty => tile_max,
            _ => {
                if tile_max.is_nan() || self.running_max.is_nan() {
                    f32::NAN
                } else {
                    self.running_max.max(tile_max)
                }
            }
        };

        if self.phase == Phase::Accumulating {
            let alpha = (self.running_max - new_max).exp();
            self.running_sum *= alpha;
            scale_in_place(&mut self.running_output, alpha);
        }

        for (j, &s) in scores.iter().enumerate() {
            let w = (s - new_max).exp();
            if w == 0.0 {
                continue;
            }
            self.running_sum += w;
            accumulate_weighted(&mut self.running_output, &values[j * dv..(j + 1) * dv], w);
        }

        self.running_max = new_max;
        self.phase = Phase::Accumulating;
        Ok(())
    }

    /// Write `running_output / running_sum` into `out` and return the LSE.
    ///
    /// A state that never saw an unmasked score yields zeros and `-inf`.
    pub fn finalize(&mut self, out: &mut [f32]) -> Result<f32> {
        let dv = self.running_output.len();
        if out.len() != dv {
            return Err(Error::shape("output row", &[dv], &[out.len()]));
        }
        if self.phase == Phase::Finalized {
            return Err(Error::InvalidArgument {
                arg: "state",
                reason: "attention state already finalized".into(),
            });
        }
        self.phase = Phase::Finalized;

        if self.running_sum == 0.0 {
            out.fill(0.0);
            return Ok(f32::NEG_INFINITY);
        }
        let inv = 1.0 / self.running_sum;
        for (o, &acc) in out.iter_mut().zip(&self.running_output) {
            *o = acc * inv;
        }
        Ok(self.running_max + self.running_sum.ln())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_pass(scores: &[f32], values: &[f32], dv: usize) -> (Vec<f32>, f32) {
        let m = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let w: Vec<f64> = scores.iter().map(|&s| ((s - m) as f64).exp()).collect();
        let sum: f64 = w.iter().sum();
        let mut out = vec![0.0f64; dv];
        for (j, &wj) in w.iter().enumerate() {
            for d in 0..dv {
                out[d] += wj * values[j * dv + d] as f64;
            }
        }
        (
            out.iter().map(|o| (o / sum) as f32).collect(),
            m + (sum.ln() as f32),
        )
    }

    #[test]
    fn test_tiled_matches_single_pass() {
        let dv = 4;
        let n = 37;
        let scores: Vec<f32> = (0..n).map(|i| ((i as f32) * 0.7).sin() * 5.0).collect();
        let values: Vec<f32> = (0..n * dv).map(|i| ((i as f32) * 0.3).cos()).collect();
        let (expect, expect_lse) = single_pass(&scores, &values, dv);

        for tile in [1, 5, 16, 37] {
            let mut st = AttentionState::new(dv);
            for start in (0..n).step_by(tile) {
                let end = (start + tile).min(n);
                st.update(&scores[start..end], &values[start * dv..end * dv])
                    .unwrap();
            }
            let mut out = vec![0.0; dv];
            let lse = st.finalize(&mut out).unwrap();
            assert!((lse - expect_lse).abs() < 1e-5, "tile {tile}");
            for (a, b) in out.iter().zip(&expect) {
                assert!((a - b).abs() < 1e-5, "tile {tile}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_order_independent() {
        let dv = 2;
        let scores = [3.0f32, -1.0, 7.0, 0.5];
        let values = [1.0f32, 0.0, 0.0, 1.0, 2.0, 2.0, -1.0, 3.0];

        let mut fwd = AttentionState::new(dv);
        fwd.update(&scores[..2], &values[..4]).unwrap();
        fwd.update(&scores[2..], &values[4..]).unwrap();
        let mut rev = AttentionState::new(dv);
        rev.update(&scores[2..], &values[4..]).unwrap();
        rev.update(&scores[..2], &values[..4]).unwrap();

        let (mut a, mut b) = (vec![0.0; 2], vec![0.0; 2]);
        let la = fwd.finalize(&mut a).unwrap();
        let lb = rev.finalize(&mut b).unwrap();
        assert!((la - lb).abs() < 1e-6);
        assert!((a[0] - b[0]).abs() < 1e-6 && (a[1] - b[1]).abs() < 1e-6);
    }

    #[test]
    fn test_fully_masked_finalizes_to_zero() {
        let mut st = AttentionState::new(3);
        st.update(&[f32::NEG_INFINITY; 2], &[1.0; 6]).unwrap();
        assert_eq!(st.phase(), Phase::Empty);

        let mut out = vec![9.0; 3];
        let lse = st.finalize(&mut out).unwrap();
        assert_eq!(lse, f32::NEG_INFINITY);
        assert_eq!(out, vec![0.0; 3]);
        assert_eq!(st.phase(), Phase::Finalized);
        assert!(st.update(&[0.0], &[0.0; 3]).is_err());
    }

    #[test]
    fn test_large_scores_do_not_overflow() {
        let mut st = AttentionState::new(1);
        st.update(&[1000.0, 1000.0], &[1.0, 3.0]).unwrap();
        st.update(&[2000.0], &[5.0]).unwrap();
        let mut out = [0.0];
        let lse = st.finalize(&mut out).unwrap();
        assert!((out[0] - 5.0).abs() < 1e-6);
        assert!((lse - 2000.0).abs() < 1e-3);
    }

    #[test]
    fn test_nan_propagates() {
        let mut st = AttentionState::new(1);
        st.update(&[0.0, f32::NAN], &[1.0, 1.0]).unwrap();
        let mut out = [0.0];
        let lse = st.finalize(&mut out).unwrap();
        assert!(lse.is_nan());
        assert!(out[0].is_nan());
    }

    #[test]
    fn test_value_shape_checked() {
        let mut st = AttentionState::new(2);
        assert!(matches!(
            st.update(&[0.0, 1.0], &[0.0; 3]),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
