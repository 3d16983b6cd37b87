use crate::error::{Error, Result};

/// Behavior switches for the tracking engine.
///
/// The defaults mirror the common deployment configuration: a seven-slot
/// temporal memory at stride 1, single-mask decoding, and no optional
/// post-processing. Geometry (image size, feature dims) comes from the
/// model, not from here.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Number of temporal memory slots, counting the conditioning slot.
    pub num_maskmem: usize,
    /// Stride between non-conditioning frames pulled into the memory window.
    pub memory_temporal_stride: usize,
    /// Cap on conditioning frames attended per step (`None` = all of them).
    /// When set, it must be at least 2 so both temporal directions stay
    /// represented.
    pub max_cond_frames_in_attn: Option<usize>,
    /// On frames without memory, add the learned no-memory embedding to the
    /// backbone features directly instead of feeding a placeholder token
    /// through memory fusion.
    pub directly_add_no_mem_embed: bool,

    // mask decoding
    pub multimask_output_in_sam: bool,
    pub multimask_min_pt_num: usize,
    pub multimask_max_pt_num: usize,
    pub multimask_output_for_tracking: bool,
    /// Bypass the decoder entirely when a mask prompt is given and treat the
    /// prompt itself as the frame's output.
    pub use_mask_input_as_output_without_sam: bool,
    pub pred_obj_scores: bool,
    pub soft_no_obj_ptr: bool,
    pub fixed_no_obj_ptr: bool,

    // memory encoding
    pub sigmoid_scale_for_mem_enc: f32,
    pub sigmoid_bias_for_mem_enc: f32,
    pub binarize_mask_from_pts_for_mem_enc: bool,
    pub non_overlap_masks_for_mem_enc: bool,

    // object pointers in memory fusion
    pub use_obj_ptrs_in_encoder: bool,
    pub max_obj_ptrs_in_encoder: usize,
    pub add_tpos_enc_to_obj_ptrs: bool,
    pub proj_tpos_enc_in_obj_ptrs: bool,
    pub use_signed_tpos_enc_to_obj_ptrs: bool,
    pub only_obj_ptrs_in_the_past_for_eval: bool,

    // output post-processing
    /// Background connected components up to this area are flipped to a
    /// small positive score. 0 disables hole filling.
    pub fill_hole_area: usize,
    /// Suppress overlaps in the final video-resolution masks.
    pub non_overlap_masks: bool,

    // session behavior
    /// Drop non-conditioning memory within the memory-window radius of every
    /// prompted frame, so corrections take effect on their neighborhood.
    pub clear_non_cond_mem_around_input: bool,
    /// Apply the purge above even when tracking several objects.
    pub clear_non_cond_mem_for_multi_obj: bool,
    /// Treat correction prompts on already-tracked frames as conditioning
    /// inputs rather than non-conditioning ones.
    pub add_all_frames_to_correct_as_cond: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            num_maskmem: 7,
            memory_temporal_stride: 1,
            max_cond_frames_in_attn: None,
            directly_add_no_mem_embed: false,
            multimask_output_in_sam: false,
            multimask_min_pt_num: 1,
            multimask_max_pt_num: 1,
            multimask_output_for_tracking: false,
            use_mask_input_as_output_without_sam: false,
            pred_obj_scores: false,
            soft_no_obj_ptr: false,
            fixed_no_obj_ptr: false,
            sigmoid_scale_for_mem_enc: 1.0,
            sigmoid_bias_for_mem_enc: 0.0,
            binarize_mask_from_pts_for_mem_enc: false,
            non_overlap_masks_for_mem_enc: false,
            use_obj_ptrs_in_encoder: false,
            max_obj_ptrs_in_encoder: 16,
            add_tpos_enc_to_obj_ptrs: true,
            proj_tpos_enc_in_obj_ptrs: false,
            use_signed_tpos_enc_to_obj_ptrs: false,
            only_obj_ptrs_in_the_past_for_eval: false,
            fill_hole_area: 0,
            non_overlap_masks: false,
            clear_non_cond_mem_around_input: false,
            clear_non_cond_mem_for_multi_obj: false,
            add_all_frames_to_correct_as_cond: false,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_maskmem == 0 && self.clear_non_cond_mem_around_input {
            return Err(Error::InvalidArgument(
                "clear_non_cond_mem_around_input requires num_maskmem > 0".into(),
            ));
        }
        if self.memory_temporal_stride == 0 {
            return Err(Error::InvalidArgument(
                "memory_temporal_stride must be at least 1".into(),
            ));
        }
        if let Some(n) = self.max_cond_frames_in_attn {
            if n < 2 {
                return Err(Error::InvalidArgument(format!(
                    "max_cond_frames_in_attn must be at least 2, got {n}"
                )));
            }
        }
        if self.multimask_min_pt_num > self.multimask_max_pt_num {
            return Err(Error::InvalidArgument(format!(
                "multimask point range is empty: {}..={}",
                self.multimask_min_pt_num, self.multimask_max_pt_num
            )));
        }
        Ok(())
    }

    /// Radius (in frames) of the non-conditioning purge around a prompt.
    pub(crate) fn purge_radius(&self) -> usize {
        self.memory_temporal_stride * self.num_maskmem
    }
}
