//! Mask score post-processing.

use std::collections::VecDeque;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Keep each pixel's winning object and push every other object's score to
/// at most -10 there, so at most one mask claims any pixel after
/// thresholding at 0. Scores already below -10 are left alone.
pub fn apply_non_overlapping_constraints(pred_masks: &Tensor) -> Result<Tensor> {
    let batch_size = pred_masks.dim(0)?;
    if batch_size == 1 {
        return Ok(pred_masks.clone());
    }
    let device = pred_masks.device();
    let max_obj_inds = pred_masks.argmax_keepdim(0)?;
    let batch_obj_inds =
        Tensor::arange(0u32, batch_size as u32, device)?.reshape((batch_size, 1, 1, 1))?;
    let keep = max_obj_inds.broadcast_eq(&batch_obj_inds)?;
    let suppressed = pred_masks.clamp(f32::NEG_INFINITY, -10.0f32)?;
    Ok(keep.where_cond(pred_masks, &suppressed)?)
}

/// Flip small background pockets of a `[B, 1, H, W]` score map to a weakly
/// positive 0.1 so they read as foreground. A pocket is a 4-connected
/// component of non-positive scores with area at most `max_area`; this
/// includes components touching the border, which the surrounding
/// background normally keeps far above `max_area`.
///
/// Non-finite scores make connectivity meaningless; that case is reported
/// as [`Error::NumericDegradation`] so callers can keep the raw scores.
pub fn fill_holes_in_mask_scores(mask: &Tensor, max_area: usize) -> Result<Tensor> {
    if max_area == 0 {
        return Ok(mask.clone());
    }
    let dims = mask.dims().to_vec();
    if dims.len() != 4 {
        return Err(Error::InvalidArgument(format!(
            "hole filling expects [B, 1, H, W] scores, got shape {dims:?}"
        )));
    }
    let (b, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let mut data = mask
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    if data.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericDegradation {
            stage: "hole filling",
            reason: "mask scores contain non-finite values".into(),
        });
    }
    for plane in 0..b * c {
        let offset = plane * h * w;
        fill_plane(&mut data[offset..offset + h * w], h, w, max_area);
    }
    Ok(Tensor::from_vec(data, (b, c, h, w), mask.device())?)
}

fn fill_plane(scores: &mut [f32], h: usize, w: usize, max_area: usize) {
    let mut labels = vec![0u32; h * w];
    let mut areas: Vec<usize> = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..h * w {
        if scores[start] > 0.0 || labels[start] != 0 {
            continue;
        }
        let component = areas.len() as u32 + 1;
        labels[start] = component;
        queue.push_back(start);
        let mut area = 0usize;
        while let Some(p) = queue.pop_front() {
            area += 1;
            let (y, x) = (p / w, p % w);
            let mut visit = |q: usize| {
                if scores[q] <= 0.0 && labels[q] == 0 {
                    labels[q] = component;
                    queue.push_back(q);
                }
            };
            if y > 0 {
                visit(p - w);
            }
            if y + 1 < h {
                visit(p + w);
            }
            if x > 0 {
                visit(p - 1);
            }
            if x + 1 < w {
                visit(p + 1);
            }
        }
        areas.push(area);
    }

    for p in 0..h * w {
        if labels[p] != 0 && areas[(labels[p] - 1) as usize] <= max_area {
            scores[p] = 0.1;
        }
    }
}
