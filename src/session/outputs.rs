//! The output memory bank.
//!
//! Tracking results live in two tiers. Each object keeps its own maps of
//! conditioning and non-conditioning frame outputs, plus temporary maps
//! holding freshly prompted results that have not been consolidated yet.
//! The session additionally keeps one consolidated bank whose rows stack
//! all objects in slot order; propagation reads and writes only that bank,
//! and per-object rows are zero-copy views into it.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::Result;

/// Mask-logit sentinel for "this object has no output here". Low enough
/// that sigmoid rounds to exactly zero.
pub const NO_OBJ_SCORE: f32 = -1024.0;

/// Everything the session retains about one object batch on one frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    /// `[B, 1, h, w]` mask logits, kept on the storage device.
    pub pred_masks: Tensor,
    /// `[B, C]` object pointers, kept on the compute device.
    pub obj_ptr: Tensor,
    /// `[B, 1]` object-presence logits.
    pub object_score_logits: Tensor,
    /// Encoded spatial memory and its positional encoding, both
    /// `[B, mem_dim, H, W]`. Absent until the frame's memory is encoded.
    pub maskmem: Option<(Tensor, Tensor)>,
}

impl FrameOutput {
    /// Row `slot` as a batch-of-one view sharing this output's storage.
    pub fn slice(&self, slot: usize) -> Result<FrameOutput> {
        let maskmem = match &self.maskmem {
            Some((feats, pos)) => Some((feats.narrow(0, slot, 1)?, pos.narrow(0, slot, 1)?)),
            None => None,
        };
        Ok(FrameOutput {
            pred_masks: self.pred_masks.narrow(0, slot, 1)?,
            obj_ptr: self.obj_ptr.narrow(0, slot, 1)?,
            object_score_logits: self.object_score_logits.narrow(0, slot, 1)?,
            maskmem,
        })
    }
}

/// One object's share of the bank.
#[derive(Debug, Default)]
pub struct ObjectOutputs {
    pub cond: BTreeMap<usize, FrameOutput>,
    pub non_cond: BTreeMap<usize, FrameOutput>,
    pub temp_cond: BTreeMap<usize, FrameOutput>,
    pub temp_non_cond: BTreeMap<usize, FrameOutput>,
}

impl ObjectOutputs {
    pub fn temp(&self, is_cond: bool) -> &BTreeMap<usize, FrameOutput> {
        if is_cond {
            &self.temp_cond
        } else {
            &self.temp_non_cond
        }
    }

    pub fn temp_mut(&mut self, is_cond: bool) -> &mut BTreeMap<usize, FrameOutput> {
        if is_cond {
            &mut self.temp_cond
        } else {
            &mut self.temp_non_cond
        }
    }

    pub fn committed_mut(&mut self, is_cond: bool) -> &mut BTreeMap<usize, FrameOutput> {
        if is_cond {
            &mut self.cond
        } else {
            &mut self.non_cond
        }
    }

    /// Most recent output for `frame_idx`: the temporary map for the given
    /// partition first, then committed conditioning, then committed
    /// non-conditioning.
    pub fn lookup(&self, frame_idx: usize, is_cond: bool) -> Option<&FrameOutput> {
        self.temp(is_cond)
            .get(&frame_idx)
            .or_else(|| self.cond.get(&frame_idx))
            .or_else(|| self.non_cond.get(&frame_idx))
    }

}

/// The consolidated, all-object bank plus the record of which frames were
/// consolidated from prompts. The index sets are what the preflight
/// invariant is checked against; they survive purges of the maps.
#[derive(Debug, Default)]
pub struct OutputBank {
    pub cond: BTreeMap<usize, FrameOutput>,
    pub non_cond: BTreeMap<usize, FrameOutput>,
    pub cond_frame_inds: std::collections::BTreeSet<usize>,
    pub non_cond_frame_inds: std::collections::BTreeSet<usize>,
}

impl OutputBank {
    pub fn partition_mut(&mut self, is_cond: bool) -> &mut BTreeMap<usize, FrameOutput> {
        if is_cond {
            &mut self.cond
        } else {
            &mut self.non_cond
        }
    }

    /// Drop non-conditioning outputs in `frame_idx - radius ..= frame_idx +
    /// radius`. Conditioning outputs always survive.
    pub fn purge_non_cond_around(&mut self, frame_idx: usize, radius: usize) {
        let begin = frame_idx.saturating_sub(radius);
        let end = frame_idx + radius;
        self.non_cond.retain(|t, _| *t < begin || *t > end);
    }

    pub fn clear(&mut self) {
        self.cond.clear();
        self.non_cond.clear();
        self.cond_frame_inds.clear();
        self.non_cond_frame_inds.clear();
    }
}
