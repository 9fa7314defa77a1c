//! Ring merge of partial attention results
//!
//! Two partial results over disjoint KV shards combine through the
//! log-sum-exp identity:
//!
//! ```text
//! lse = log(exp(lse_a) + exp(lse_b))
//! out = (out_a * exp(lse_a) + out_b * exp(lse_b)) / (exp(lse_a) + exp(lse_b))
//! ```
//!
//! evaluated relative to `max(lse_a, lse_b)`. A row with `lse = -inf` (no
//! tokens) is the identity. The merge is commutative and associative up to
//! rounding, so participants can be folded in any order.

use super::AttentionOutput;
use crate::error::{Error, Result};
use std::sync::mpsc;
use std::thread;
use tracing::trace;

/// Merge one row pair into `out`, returning the combined LSE.
pub(crate) fn merge_row(
    out_a: &[f32],
    lse_a: f32,
    out_b: &[f32],
    lse_b: f32,
    out: &mut [f32],
) -> f32 {
    if lse_a == f32::NEG_INFINITY {
        out.copy_from_slice(out_b);
        return lse_b;
    }
    if lse_b == f32::NEG_INFINITY {
        out.copy_from_slice(out_a);
        return lse_a;
    }

    let m = lse_a.max(lse_b);
    let wa = (lse_a - m).exp();
    let wb = (lse_b - m).exp();
    let total = wa + wb;
    for ((o, &a), &b) in out.iter_mut().zip(out_a).zip(out_b) {
        *o = (a * wa + b * wb) / total;
    }
    m + total.ln()
}

/// Merge the locally computed `current` pair with the `carried` pair.
pub fn merge(current: &AttentionOutput, carried: &AttentionOutput) -> Result<AttentionOutput> {
    current.check_same_shape(carried, "carried")?;

    let dv = current.head_dim_v;
    let mut merged = AttentionOutput::empty(current.num_tokens, current.num_heads, dv);
    for r in 0..current.num_rows() {
        let span = r * dv..(r + 1) * dv;
        merged.lse[r] = merge_row(
            &current.output[span.clone()],
            current.lse[r],
            &carried.output[span.clone()],
            carried.lse[r],
            &mut merged.output[span],
        );
    }
    Ok(merged)
}

/// Merge `carried` into `current` in place.
pub fn merge_into(current: &mut AttentionOutput, carried: &AttentionOutput) -> Result<()> {
    current.check_same_shape(carried, "carried")?;

    let dv = current.head_dim_v;
    let mut row = vec![0.0f32; dv];
    for r in 0..current.num_rows() {
        let span = r * dv..(r + 1) * dv;
        current.lse[r] = merge_row(
            &current.output[span.clone()],
            current.lse[r],
            &carried.output[span.clone()],
            carried.lse[r],
            &mut row,
        );
        current.output[span].copy_from_slice(&row);
    }
    Ok(())
}

/// Fold every partial result, left to right.
pub fn merge_all(parts: &[AttentionOutput]) -> Result<AttentionOutput> {
    let (first, rest) = parts.split_first().ok_or(Error::InvalidArgument {
        arg: "parts",
        reason: "nothing to merge".into(),
    })?;
    let mut acc = first.clone();
    for part in rest {
        merge_into(&mut acc, part)?;
    }
    Ok(acc)
}

/// Message-passing ring of `num_ranks` participants.
///
/// Each rank runs on its own thread. Rank 0 starts with no carried pair;
/// every rank computes its local result given the pair handed to it by the
/// previous rank and forwards the outcome. The last rank's result is the
/// global one. Errors travel down the ring and abort the remaining ranks.
#[derive(Debug, Clone, Copy)]
pub struct RingExchange {
    num_ranks: usize,
}

impl RingExchange {
    pub fn new(num_ranks: usize) -> Result<Self> {
        if num_ranks == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_ranks",
                reason: "ring needs at least one participant".into(),
            });
        }
        Ok(Self { num_ranks })
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Run the ring. `step(rank, carried)` must return the rank's result
    /// with `carried` already merged in (for example a paged attention
    /// forward given `carried`).
    pub fn run<F>(&self, step: F) -> Result<AttentionOutput>
    where
        F: Fn(usize, Option<&AttentionOutput>) -> Result<AttentionOutput> + Sync,
    {
        let n = self.num_ranks;
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::sync_channel::<Result<AttentionOutput>>(1);
            senders.push(tx);
            receivers.push(rx);
        }

        // rank r reads from channel r and writes to channel r + 1;
        // channel n is the result of the ring.
        let (done_tx, done_rx) = mpsc::sync_channel::<Result<AttentionOutput>>(1);
        let mut outbound: Vec<_> = senders.drain(1..).collect();
        outbound.push(done_tx);
        let first = senders.pop();

        let step = &step;
        thread::scope(|s| {
            for (rank, (rx, tx)) in receivers.into_iter().zip(outbound).enumerate() {
                s.spawn(move || {
                    let carried = if rank == 0 {
                        None
                    } else {
                        match rx.recv() {
                            Ok(Ok(pair)) => Some(pair),
                            Ok(Err(e)) => {
                                let _ = tx.send(Err(e));
                                return;
                            }
                            Err(_) => return,
                        }
                    };
                    trace!(rank, carried = carried.is_some(), "ring hop");
                    let result = step(rank, carried.as_ref());
                    let _ = tx.send(result);
                });
            }
            drop(first);
        });

        done_rx.recv().map_err(|_| Error::InvalidArgument {
            arg: "ring",
            reason: "ring terminated without a result".into(),
        })?
    }
}
