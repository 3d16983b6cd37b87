use candle_core::{Device, Tensor};

use crate::error::Result;

/// Raw multi-level backbone output for a batch of frames.
///
/// Levels run from the highest spatial resolution to the lowest; the last
/// level is the one memory fusion and the decoder operate on. Each entry is
/// `[B, C_l, H_l, W_l]` with its matching positional encoding.
#[derive(Debug, Clone)]
pub struct BackboneFeatures {
    pub feature_maps: Vec<Tensor>,
    pub position_encodings: Vec<Tensor>,
}

/// Point prompts for one frame, already scaled to model input coordinates.
///
/// `coords` is `[B, P, 2]` in (x, y) order and `labels` is `[B, P]` with
/// 1/0 for positive/negative clicks, 2/3 for the two box corners and -1 for
/// padding.
#[derive(Debug, Clone)]
pub struct PointPrompts {
    pub coords: Tensor,
    pub labels: Tensor,
}

/// Sparse and dense prompt embeddings produced by the prompt encoder.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    pub sparse: Tensor,
    pub dense: Tensor,
}

/// What the mask decoder returns for one conditioned frame.
///
/// `mask_logits` is `[B, M, H/4, W/4]` where M is 1 or the multimask count,
/// `iou_scores` is `[B, M]`, `mask_tokens` is `[B, M, C]` and
/// `object_score_logits` is `[B, 1]` (fixed +10 when the decoder does not
/// predict object presence).
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub mask_logits: Tensor,
    pub iou_scores: Tensor,
    pub mask_tokens: Tensor,
    pub object_score_logits: Tensor,
}

/// The neural pieces a tracking session is built around: a frame feature
/// extractor, a prompt encoder, a prompt-conditioned mask decoder, a memory
/// encoder and a memory-fusion transformer. The session engine owns all
/// temporal bookkeeping; implementations of this trait stay stateless
/// across frames.
pub trait TrackerModel {
    fn device(&self) -> &Device;

    /// Side length of the square model input, in pixels.
    fn image_size(&self) -> usize;

    /// Channel width of the backbone's lowest-resolution level, and of
    /// object pointers.
    fn hidden_dim(&self) -> usize;

    /// Channel width of encoded memory tokens.
    fn mem_dim(&self) -> usize;

    fn num_feature_levels(&self) -> usize {
        3
    }

    /// Run the image encoder on `[B, 3, S, S]` preprocessed frames.
    fn extract_features(&self, frames: &Tensor) -> Result<BackboneFeatures>;

    /// Embed point and/or dense mask prompts. The mask, when given, is
    /// already at the decoder's expected resolution (`S/4`).
    fn encode_prompts(
        &self,
        points: Option<&PointPrompts>,
        mask: Option<&Tensor>,
    ) -> Result<PromptEmbeddings>;

    /// Positional encoding of the decoder's image embedding grid,
    /// `[1, C, H, W]` at the lowest feature level.
    fn dense_positional_encoding(&self) -> Result<Tensor>;

    /// Decode masks from memory-conditioned image embeddings and prompt
    /// embeddings. `high_res_features` carries the two higher-resolution
    /// backbone levels when the backbone produces them.
    fn decode_masks(
        &self,
        image_embeddings: &Tensor,
        image_pe: &Tensor,
        prompts: &PromptEmbeddings,
        multimask_output: bool,
        high_res_features: Option<&(Tensor, Tensor)>,
    ) -> Result<DecoderOutput>;

    /// Fuse a frame's mask prediction into spatial memory. Takes the
    /// lowest-level pixel features `[B, C, H, W]` and mask scores already
    /// mapped to [0, 1]; returns memory features and their positional
    /// encoding, both `[B, mem_dim, H, W]`.
    fn encode_memory(&self, pixel_features: &Tensor, mask_for_mem: &Tensor)
        -> Result<(Tensor, Tensor)>;

    /// Cross-attend current-frame tokens `[HW, B, C]` over concatenated
    /// memory tokens `[T, B, mem_dim]`. The trailing `num_obj_ptr_tokens`
    /// memory entries are object pointers rather than spatial memory.
    fn fuse_memory(
        &self,
        current: &Tensor,
        current_pos: &Tensor,
        memory: &Tensor,
        memory_pos: &Tensor,
        num_obj_ptr_tokens: usize,
    ) -> Result<Tensor>;

    /// Learned `[1, 1, C]` embedding standing in for memory on frames that
    /// have none yet.
    fn no_memory_embedding(&self) -> Result<Tensor>;

    /// Positional encoding companion of [`Self::no_memory_embedding`].
    fn no_memory_pos_enc(&self) -> Result<Tensor>;

    /// Learned temporal encoding `[1, 1, mem_dim]` for one memory slot.
    /// Slot 0 is the most distant position, the highest slot the
    /// conditioning position.
    fn temporal_pos_enc(&self, slot: usize) -> Result<Tensor>;

    /// Pointer `[1, C]` substituted when an object is judged absent.
    fn no_object_pointer(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Spatial embedding `[mem_dim]` mixed into encoded memory of frames
    /// where the object is judged absent.
    fn no_object_spatial_embedding(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Project a decoded mask token `[B, C]` into an object pointer.
    fn project_object_pointer(&self, token: &Tensor) -> Result<Tensor> {
        Ok(token.clone())
    }

    /// Project a pointer temporal encoding down to `mem_dim` when the model
    /// carries a dedicated projection; identity otherwise.
    fn project_pointer_tpos(&self, pe: &Tensor) -> Result<Tensor> {
        Ok(pe.clone())
    }
}
