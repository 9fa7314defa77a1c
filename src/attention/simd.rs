//! SIMD helpers for the host attention kernels
//!
//! The dot product keeps eight independent lanes where lane `i` only ever
//! sees channels `c` with `c % 8 == i`, and the lanes are reduced in a fixed
//! order. A contraction fed in several segments (non-rope, then rope)
//! therefore performs exactly the same floating-point operations as one
//! contraction over the concatenated row. The AVX2 path uses separate
//! multiply and add (no FMA) so it matches the scalar lanes bit for bit.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

pub(crate) const LANES: usize = 8;

/// Add `a[i] * b[i]` into `lanes[(channel_base + i) % LANES]`.
#[inline]
pub(crate) fn dot_lanes(lanes: &mut [f32; LANES], a: &[f32], b: &[f32], channel_base: usize) {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if channel_base % LANES == 0 && a.len() >= LANES && is_x86_feature_detected!("avx2") {
            let head = a.len() - a.len() % LANES;
            unsafe { dot_lanes_avx2(lanes, a.as_ptr(), b.as_ptr(), head) };
            dot_lanes_scalar(lanes, &a[head..], &b[head..], channel_base + head);
            return;
        }
    }

    dot_lanes_scalar(lanes, a, b, channel_base);
}

#[inline]
fn dot_lanes_scalar(lanes: &mut [f32; LANES], a: &[f32], b: &[f32], channel_base: usize) {
    for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
        let lane = (channel_base + i) % LANES;
        lanes[lane] += x * y;
    }
}

/// Lane-wise `lanes += a * b` over `len` elements (`len % LANES == 0`).
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_lanes_avx2(lanes: &mut [f32; LANES], a: *const f32, b: *const f32, len: usize) {
    unsafe {
        let mut acc = _mm256_loadu_ps(lanes.as_ptr());
        for i in 0..len / LANES {
            let offset = i * LANES;
            let va = _mm256_loadu_ps(a.add(offset));
            let vb = _mm256_loadu_ps(b.add(offset));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        }
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    }
}

/// Reduce the lanes in a fixed pairwise order.
#[inline]
pub(crate) fn reduce_lanes(lanes: &[f32; LANES]) -> f32 {
    let s0 = lanes[0] + lanes[4];
    let s1 = lanes[1] + lanes[5];
    let s2 = lanes[2] + lanes[6];
    let s3 = lanes[3] + lanes[7];
    (s0 + s2) + (s1 + s3)
}

/// Accumulate: out[i] += weight * v[i] using SIMD
#[inline]
pub(crate) fn accumulate_weighted(out: &mut [f32], v: &[f32], weight: f32) {
    debug_assert_eq!(out.len(), v.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            unsafe {
                accumulate_weighted_avx2(out.as_mut_ptr(), v.as_ptr(), weight, out.len());
            }
            return;
        }
    }

    for (o, &vi) in out.iter_mut().zip(v.iter()) {
        *o += weight * vi;
    }
}

/// AVX2+FMA weighted accumulation: out += weight * v
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn accumulate_weighted_avx2(out: *mut f32, v: *const f32, weight: f32, len: usize) {
    unsafe {
        let chunks = len / LANES;
        let w_vec = _mm256_set1_ps(weight);

        for i in 0..chunks {
            let offset = i * LANES;
            let vo = _mm256_loadu_ps(out.add(offset));
            let vv = _mm256_loadu_ps(v.add(offset));
            _mm256_storeu_ps(out.add(offset), _mm256_fmadd_ps(w_vec, vv, vo));
        }

        for offset in chunks * LANES..len {
            *out.add(offset) += weight * *v.add(offset);
        }
    }
}

/// out[i] *= factor
#[inline]
pub(crate) fn scale_in_place(out: &mut [f32], factor: f32) {
    if factor == 1.0 {
        return;
    }
    out.iter_mut().for_each(|o| *o *= factor);
}
