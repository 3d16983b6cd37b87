//! Backbone feature caching and reshaping.
//!
//! Interactive editing hits the same frame repeatedly, so the session keeps
//! the most recent frame's backbone output around. One slot is enough:
//! propagation visits each frame once and corrections cluster on a single
//! frame at a time.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::model::BackboneFeatures;

#[derive(Debug, Default)]
pub struct FeatureCache {
    slot: Option<(usize, BackboneFeatures)>,
}

impl FeatureCache {
    pub fn lookup(&self, frame_idx: usize) -> Option<BackboneFeatures> {
        match &self.slot {
            Some((idx, feats)) if *idx == frame_idx => Some(feats.clone()),
            _ => None,
        }
    }

    /// Cache `frame_idx`'s output, evicting whatever was held before.
    pub fn put(&mut self, frame_idx: usize, features: BackboneFeatures) {
        self.slot = Some((frame_idx, features));
    }

    pub fn cached_frame(&self) -> Option<usize> {
        self.slot.as_ref().map(|(idx, _)| *idx)
    }
}

/// Features of one frame ready for memory fusion and decoding: per level a
/// `[H*W, B, C]` token tensor, its positional encoding, and the (H, W) it
/// was flattened from.
#[derive(Debug, Clone)]
pub struct FrameFeatures {
    pub vision_feats: Vec<Tensor>,
    pub vision_pos_embeds: Vec<Tensor>,
    pub feat_sizes: Vec<(usize, usize)>,
}

/// Replicate single-frame backbone output across `batch` object slots.
///
/// The backbone runs once per frame; every object attends over the same
/// replicated features, so rows of downstream batched tensors line up with
/// registry slots. Replication is a broadcast view, not a copy.
pub fn expand_features(features: &BackboneFeatures, batch: usize) -> Result<BackboneFeatures> {
    let expand = |tensors: &[Tensor]| -> Result<Vec<Tensor>> {
        tensors
            .iter()
            .map(|t| {
                let (b, c, h, w) = t.dims4()?;
                if b != 1 {
                    return Err(Error::ConsistencyViolation(format!(
                        "cached backbone features must be single-frame, got batch {b}"
                    )));
                }
                Ok(t.expand((batch, c, h, w))?)
            })
            .collect()
    };
    Ok(BackboneFeatures {
        feature_maps: expand(&features.feature_maps)?,
        position_encodings: expand(&features.position_encodings)?,
    })
}

/// Flatten `[B, C, H, W]` levels into `[H*W, B, C]` token form, keeping the
/// final `num_levels` levels.
pub fn prepare_backbone_features(
    features: &BackboneFeatures,
    num_levels: usize,
) -> Result<FrameFeatures> {
    if features.feature_maps.len() != features.position_encodings.len() {
        return Err(Error::ConsistencyViolation(format!(
            "feature/position level mismatch: {} vs {}",
            features.feature_maps.len(),
            features.position_encodings.len()
        )));
    }
    if features.feature_maps.len() < num_levels {
        return Err(Error::ConsistencyViolation(format!(
            "backbone produced {} levels, expected at least {num_levels}",
            features.feature_maps.len()
        )));
    }
    let skip = features.feature_maps.len() - num_levels;

    let mut vision_feats = Vec::with_capacity(num_levels);
    let mut vision_pos_embeds = Vec::with_capacity(num_levels);
    let mut feat_sizes = Vec::with_capacity(num_levels);
    for (map, pos) in features.feature_maps[skip..]
        .iter()
        .zip(&features.position_encodings[skip..])
    {
        let (b, c, h, w) = map.dims4()?;
        vision_feats.push(map.reshape((b, c, h * w))?.permute((2, 0, 1))?);
        vision_pos_embeds.push(pos.reshape((b, pos.dims4()?.1, h * w))?.permute((2, 0, 1))?);
        feat_sizes.push((h, w));
    }
    Ok(FrameFeatures {
        vision_feats,
        vision_pos_embeds,
        feat_sizes,
    })
}
