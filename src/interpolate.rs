//! Bilinear resizing of `[B, C, H, W]` score tensors on the CPU.
//!
//! Matches the usual `align_corners = false` convention: sample centers sit
//! at half-integer positions and border samples are clamped. With
//! `antialias` the triangle filter support widens to the scale factor, which
//! is what mask downsampling expects.

use candle_core::{DType, Tensor};
use ndarray::Array4;

use crate::error::{Error, Result};

pub fn resize_bilinear(input: &Tensor, out_h: usize, out_w: usize, antialias: bool) -> Result<Tensor> {
    let dims = input.dims();
    if dims.len() != 4 {
        return Err(Error::InvalidArgument(format!(
            "resize expects a [B, C, H, W] tensor, got shape {dims:?}"
        )));
    }
    let (b, c, in_h, in_w) = (dims[0], dims[1], dims[2], dims[3]);
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(input.clone());
    }
    if out_h == 0 || out_w == 0 {
        return Err(Error::InvalidArgument(format!(
            "resize target must be non-empty, got {out_h}x{out_w}"
        )));
    }

    let device = input.device().clone();
    let data = input
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let array = Array4::from_shape_vec((b, c, in_h, in_w), data)
        .map_err(|e| Error::ConsistencyViolation(format!("resize buffer mismatch: {e}")))?;

    let resized = resize_array(&array, out_h, out_w, antialias);
    let (flat, _) = resized.into_raw_vec_and_offset();
    Ok(Tensor::from_vec(flat, (b, c, out_h, out_w), &device)?)
}

/// Per-output-position taps along one axis: first source index plus
/// normalized triangle weights.
fn axis_weights(in_len: usize, out_len: usize, antialias: bool) -> Vec<(usize, Vec<f32>)> {
    let scale = in_len as f32 / out_len as f32;
    let support = if antialias && scale > 1.0 { scale } else { 1.0 };
    let mut taps = Vec::with_capacity(out_len);
    for o in 0..out_len {
        let center = (o as f32 + 0.5) * scale - 0.5;
        let lo = (center - support).ceil().max(0.0) as usize;
        let hi = (((center + support).floor()) as i64).min(in_len as i64 - 1).max(0) as usize;
        let mut weights = Vec::with_capacity(hi - lo + 1);
        let mut total = 0f32;
        for i in lo..=hi {
            let d = (i as f32 - center).abs() / support;
            let w = (1.0 - d).max(0.0);
            total += w;
            weights.push(w);
        }
        if total > 0.0 {
            for w in &mut weights {
                *w /= total;
            }
        }
        taps.push((lo, weights));
    }
    taps
}

fn resize_array(input: &Array4<f32>, out_h: usize, out_w: usize, antialias: bool) -> Array4<f32> {
    let (b, c, in_h, in_w) = input.dim();
    let h_taps = axis_weights(in_h, out_h, antialias);
    let w_taps = axis_weights(in_w, out_w, antialias);

    // rows first, then columns
    let mut rows = Array4::<f32>::zeros((b, c, out_h, in_w));
    for bi in 0..b {
        for ci in 0..c {
            for (oy, (lo, weights)) in h_taps.iter().enumerate() {
                for x in 0..in_w {
                    let mut acc = 0f32;
                    for (k, w) in weights.iter().enumerate() {
                        acc += w * input[[bi, ci, lo + k, x]];
                    }
                    rows[[bi, ci, oy, x]] = acc;
                }
            }
        }
    }

    let mut out = Array4::<f32>::zeros((b, c, out_h, out_w));
    for bi in 0..b {
        for ci in 0..c {
            for y in 0..out_h {
                for (ox, (lo, weights)) in w_taps.iter().enumerate() {
                    let mut acc = 0f32;
                    for (k, w) in weights.iter().enumerate() {
                        acc += w * rows[[bi, ci, y, lo + k]];
                    }
                    out[[bi, ci, y, ox]] = acc;
                }
            }
        }
    }
    out
}
