//! Per-object prompt storage.
//!
//! Each object keeps at most one prompt record per frame: either an
//! accumulated set of clicks (with an optional box folded in as two corner
//! points) or a mask. Adding one kind replaces the other, so a frame can
//! never carry both.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};
use crate::model::PointPrompts;

/// Click semantics, encoded the way the prompt encoder expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointLabel {
    Negative,
    Positive,
    BoxTopLeft,
    BoxBottomRight,
}

impl PointLabel {
    pub fn as_f32(self) -> f32 {
        match self {
            PointLabel::Negative => 0.0,
            PointLabel::Positive => 1.0,
            PointLabel::BoxTopLeft => 2.0,
            PointLabel::BoxBottomRight => 3.0,
        }
    }
}

/// A box prompt in (x, y) pixel or normalized coordinates, matching
/// whatever the accompanying points use.
#[derive(Debug, Clone, Copy)]
pub struct BoxPrompt {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// The single prompt an object carries on one frame.
#[derive(Debug, Clone)]
pub enum PromptRecord {
    Points(PointPrompts),
    /// `[1, 1, S, S]` binary mask at model input resolution.
    Mask(Tensor),
}

#[derive(Debug, Default)]
pub struct ObjectInputs {
    records: BTreeMap<usize, PromptRecord>,
}

impl ObjectInputs {
    /// Store points for `frame_idx` and return the effective prompt. Unless
    /// `clear_old` is set, new clicks are appended after any clicks already
    /// on the frame; a mask record is always displaced whole.
    pub fn set_points(
        &mut self,
        frame_idx: usize,
        coords: Tensor,
        labels: Tensor,
        clear_old: bool,
    ) -> Result<PointPrompts> {
        let merged = match self.records.remove(&frame_idx) {
            Some(PromptRecord::Points(prev)) if !clear_old => PointPrompts {
                coords: Tensor::cat(&[&prev.coords, &coords], 1)?,
                labels: Tensor::cat(&[&prev.labels, &labels], 1)?,
            },
            _ => PointPrompts { coords, labels },
        };
        self.records
            .insert(frame_idx, PromptRecord::Points(merged.clone()));
        Ok(merged)
    }

    pub fn set_mask(&mut self, frame_idx: usize, mask: Tensor) {
        self.records.insert(frame_idx, PromptRecord::Mask(mask));
    }

    pub fn points_at(&self, frame_idx: usize) -> Option<&PointPrompts> {
        match self.records.get(&frame_idx) {
            Some(PromptRecord::Points(p)) => Some(p),
            _ => None,
        }
    }

    pub fn mask_at(&self, frame_idx: usize) -> Option<&Tensor> {
        match self.records.get(&frame_idx) {
            Some(PromptRecord::Mask(m)) => Some(m),
            _ => None,
        }
    }

    pub fn prompted_frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.records.keys().copied()
    }
}

/// Turn caller clicks and an optional box into `[1, P, 2]` coordinates and
/// `[1, P]` labels in model input space. Box corners come first so the
/// decoder sees them as the leading pair. With `normalize` the inputs are
/// pixel positions in the native video and get divided by its size first;
/// without it they must already be in [0, 1].
pub fn build_point_prompts(
    points: &[(f32, f32)],
    labels: &[PointLabel],
    box_prompt: Option<BoxPrompt>,
    video_size: (usize, usize),
    image_size: usize,
    normalize: bool,
    device: &Device,
) -> Result<PointPrompts> {
    if points.len() != labels.len() {
        return Err(Error::InvalidArgument(format!(
            "got {} points but {} labels",
            points.len(),
            labels.len()
        )));
    }
    let total = points.len() + if box_prompt.is_some() { 2 } else { 0 };
    if total == 0 {
        return Err(Error::InvalidArgument(
            "at least one point or a box is required".into(),
        ));
    }

    let (video_w, video_h) = (video_size.0 as f32, video_size.1 as f32);
    let scale = |x: f32, y: f32| -> (f32, f32) {
        let (nx, ny) = if normalize {
            (x / video_w, y / video_h)
        } else {
            (x, y)
        };
        (nx * image_size as f32, ny * image_size as f32)
    };

    let mut coord_values = Vec::with_capacity(total * 2);
    let mut label_values = Vec::with_capacity(total);
    if let Some(b) = box_prompt {
        for ((x, y), label) in [
            ((b.x0, b.y0), PointLabel::BoxTopLeft),
            ((b.x1, b.y1), PointLabel::BoxBottomRight),
        ] {
            let (sx, sy) = scale(x, y);
            coord_values.push(sx);
            coord_values.push(sy);
            label_values.push(label.as_f32());
        }
    }
    for (&(x, y), &label) in points.iter().zip(labels) {
        let (sx, sy) = scale(x, y);
        coord_values.push(sx);
        coord_values.push(sy);
        label_values.push(label.as_f32());
    }

    Ok(PointPrompts {
        coords: Tensor::from_vec(coord_values, (1, total, 2), device)?,
        labels: Tensor::from_vec(label_values, (1, total), device)?,
    })
}
