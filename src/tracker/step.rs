//! Single-frame inference: memory-conditioned decoding plus memory
//! encoding of the result.

use std::collections::BTreeMap;

use candle_core::{DType, IndexOp, Tensor};

use crate::error::{Error, Result};
use crate::interpolate::resize_bilinear;
use crate::model::{PointPrompts, TrackerModel};
use crate::session::features::FrameFeatures;
use crate::session::outputs::{FrameOutput, NO_OBJ_SCORE};

use super::window::{build_memory_window, gather_object_pointers, sine_position_encoding};
use super::VideoTracker;

const TPOS_TEMPERATURE: f32 = 10000.0;

/// What one track step hands back for storage.
#[derive(Debug)]
pub(crate) struct StepOutput {
    pub low_res_masks: Tensor,
    pub obj_ptr: Tensor,
    pub object_score_logits: Tensor,
    pub maskmem: Option<(Tensor, Tensor)>,
}

/// Decoder-side results before memory encoding.
struct HeadOutputs {
    low_res_masks: Tensor,
    high_res_masks: Tensor,
    obj_ptr: Tensor,
    object_score_logits: Tensor,
}

fn last_level(features: &FrameFeatures) -> Result<(&Tensor, &Tensor, (usize, usize))> {
    match (
        features.vision_feats.last(),
        features.vision_pos_embeds.last(),
        features.feat_sizes.last(),
    ) {
        (Some(feats), Some(pos), Some(&size)) => Ok((feats, pos, size)),
        _ => Err(Error::ConsistencyViolation(
            "frame features carry no levels".into(),
        )),
    }
}

impl<M: TrackerModel> VideoTracker<M> {
    /// Run the model on one frame: condition the backbone features on the
    /// memory maps, decode a mask under the given prompts, and optionally
    /// encode the prediction into new spatial memory.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn track_step(
        &self,
        frame_idx: usize,
        is_init_cond_frame: bool,
        features: &FrameFeatures,
        point_inputs: Option<&PointPrompts>,
        mask_inputs: Option<&Tensor>,
        cond: &BTreeMap<usize, FrameOutput>,
        non_cond: &BTreeMap<usize, FrameOutput>,
        num_frames: usize,
        run_mem_encoder: bool,
        prev_mask_hint: Option<&Tensor>,
        reverse: bool,
    ) -> Result<StepOutput> {
        let high_res_features = self.high_res_features(features)?;
        let heads = match mask_inputs {
            Some(mask) if self.config.use_mask_input_as_output_without_sam => {
                let (feats, _, (h, w)) = last_level(features)?;
                let (_, b, c) = feats.dims3()?;
                let pix_feat = feats.permute((1, 2, 0))?.reshape((b, c, h, w))?;
                self.mask_as_output(&pix_feat, high_res_features.as_ref(), mask)?
            }
            _ => {
                let fused = self.memory_conditioned_features(
                    frame_idx,
                    is_init_cond_frame,
                    features,
                    cond,
                    non_cond,
                    num_frames,
                    reverse,
                )?;
                // an earlier prediction on this frame can seed the decoder
                // instead of a dense mask prompt
                let mask_hint = prev_mask_hint.or(mask_inputs);
                let multimask = self.use_multimask(is_init_cond_frame, point_inputs);
                self.sam_heads(
                    &fused,
                    high_res_features.as_ref(),
                    point_inputs,
                    mask_hint,
                    multimask,
                )?
            }
        };

        let maskmem = if run_mem_encoder && self.config.num_maskmem > 0 {
            Some(self.encode_new_memory(
                features,
                &heads.high_res_masks,
                &heads.object_score_logits,
                point_inputs.is_some(),
            )?)
        } else {
            None
        };
        Ok(StepOutput {
            low_res_masks: heads.low_res_masks,
            obj_ptr: heads.obj_ptr,
            object_score_logits: heads.object_score_logits,
            maskmem,
        })
    }

    /// Cross-attend the current frame's lowest-level tokens over the
    /// memory window and return them as a `[B, C, H, W]` map. Frames with
    /// no usable memory fall back to the learned no-memory embedding.
    fn memory_conditioned_features(
        &self,
        frame_idx: usize,
        is_init_cond_frame: bool,
        features: &FrameFeatures,
        cond: &BTreeMap<usize, FrameOutput>,
        non_cond: &BTreeMap<usize, FrameOutput>,
        num_frames: usize,
        reverse: bool,
    ) -> Result<Tensor> {
        let device = self.model.device();
        let (feats, pos, (h, w)) = last_level(features)?;
        let (_, b, c) = feats.dims3()?;

        if self.config.num_maskmem == 0 {
            return Ok(feats.permute((1, 2, 0))?.reshape((b, c, h, w))?);
        }

        let mut to_cat_memory: Vec<Tensor> = Vec::new();
        let mut to_cat_pos: Vec<Tensor> = Vec::new();
        let mut num_obj_ptr_tokens = 0usize;

        if is_init_cond_frame {
            if self.config.directly_add_no_mem_embed {
                return Ok(feats
                    .broadcast_add(&self.model.no_memory_embedding()?)?
                    .permute((1, 2, 0))?
                    .reshape((b, c, h, w))?);
            }
            // a single placeholder token keeps memory fusion non-empty
            let mem_dim = self.model.mem_dim();
            to_cat_memory.push(
                self.model
                    .no_memory_embedding()?
                    .broadcast_as((1, b, mem_dim))?,
            );
            to_cat_pos.push(
                self.model
                    .no_memory_pos_enc()?
                    .broadcast_as((1, b, mem_dim))?,
            );
        } else {
            let window = build_memory_window(
                frame_idx,
                cond,
                non_cond,
                self.config.num_maskmem,
                self.config.memory_temporal_stride,
                self.config.max_cond_frames_in_attn,
                reverse,
            );
            for &(t_pos, prev) in &window.entries {
                let Some((mem_feats, mem_pos)) = &prev.maskmem else {
                    continue;
                };
                let mem = mem_feats
                    .to_dtype(DType::F32)?
                    .flatten(2, 3)?
                    .permute((2, 0, 1))?
                    .to_device(device)?;
                to_cat_memory.push(mem);

                let slot = self.config.num_maskmem - t_pos - 1;
                let tpos = self.model.temporal_pos_enc(slot)?;
                let pos_mem = mem_pos
                    .flatten(2, 3)?
                    .permute((2, 0, 1))?
                    .to_device(device)?
                    .broadcast_add(&tpos)?;
                to_cat_pos.push(pos_mem);
            }

            if self.config.use_obj_ptrs_in_encoder {
                let (offsets, pointers) = gather_object_pointers(
                    frame_idx,
                    &window.selected_cond,
                    &window.unselected_cond,
                    non_cond,
                    num_frames,
                    self.config.max_obj_ptrs_in_encoder,
                    self.config.only_obj_ptrs_in_the_past_for_eval,
                    self.config.use_signed_tpos_enc_to_obj_ptrs,
                    reverse,
                );
                if !pointers.is_empty() {
                    let pointer_list: Vec<Tensor> = pointers.into_iter().cloned().collect();
                    let obj_ptrs = Tensor::stack(&pointer_list, 0)?;
                    let p = obj_ptrs.dim(0)?;
                    let mem_dim = self.model.mem_dim();

                    let mut obj_pos = if self.config.add_tpos_enc_to_obj_ptrs {
                        let max_ptrs = num_frames.min(self.config.max_obj_ptrs_in_encoder);
                        let denom = max_ptrs.saturating_sub(1).max(1) as f32;
                        let values: Vec<f32> =
                            offsets.iter().map(|&d| d as f32 / denom).collect();
                        let positions = Tensor::from_vec(values, p, device)?;
                        let tpos_dim = if self.config.proj_tpos_enc_in_obj_ptrs {
                            self.model.hidden_dim()
                        } else {
                            mem_dim
                        };
                        let pe = sine_position_encoding(&positions, tpos_dim, TPOS_TEMPERATURE)?;
                        let pe = self.model.project_pointer_tpos(&pe)?;
                        pe.unsqueeze(1)?.expand((p, b, mem_dim))?
                    } else {
                        Tensor::zeros((p, b, mem_dim), DType::F32, device)?
                    };

                    let obj_ptrs = if mem_dim < c {
                        // break each pointer into mem_dim-wide tokens
                        let split = c / mem_dim;
                        let tokens = obj_ptrs
                            .reshape((p, b, split, mem_dim))?
                            .permute((0, 2, 1, 3))?
                            .flatten(0, 1)?;
                        obj_pos = obj_pos
                            .unsqueeze(1)?
                            .expand((p, split, b, mem_dim))?
                            .flatten(0, 1)?;
                        tokens
                    } else {
                        obj_ptrs
                    };
                    num_obj_ptr_tokens = obj_ptrs.dim(0)?;
                    to_cat_memory.push(obj_ptrs);
                    to_cat_pos.push(obj_pos);
                }
            }
        }

        let memory = Tensor::cat(&to_cat_memory, 0)?;
        let memory_pos = Tensor::cat(&to_cat_pos, 0)?;
        let fused = self
            .model
            .fuse_memory(feats, pos, &memory, &memory_pos, num_obj_ptr_tokens)?;
        Ok(fused.permute((1, 2, 0))?.reshape((b, c, h, w))?)
    }

    /// Prompt-conditioned decoding with presence gating and pointer
    /// projection.
    fn sam_heads(
        &self,
        backbone_features: &Tensor,
        high_res_features: Option<&(Tensor, Tensor)>,
        point_inputs: Option<&PointPrompts>,
        mask_inputs: Option<&Tensor>,
        multimask_output: bool,
    ) -> Result<HeadOutputs> {
        let b = backbone_features.dim(0)?;
        let device = backbone_features.device();
        let image_size = self.model.image_size();

        // the decoder always sees points; a padding click stands in when
        // the caller gave none
        let padding_points;
        let points = match point_inputs {
            Some(p) => p,
            None => {
                padding_points = PointPrompts {
                    coords: Tensor::zeros((b, 1, 2), DType::F32, device)?,
                    labels: Tensor::full(-1.0f32, (b, 1), device)?,
                };
                &padding_points
            }
        };

        let mask_prompt = match mask_inputs {
            Some(mask) => {
                let target = image_size / 4;
                let mask = mask.to_dtype(DType::F32)?;
                if mask.dim(2)? != target || mask.dim(3)? != target {
                    Some(resize_bilinear(&mask, target, target, true)?)
                } else {
                    Some(mask)
                }
            }
            None => None,
        };

        let embeddings = self.model.encode_prompts(Some(points), mask_prompt.as_ref())?;
        let image_pe = self.model.dense_positional_encoding()?;
        let decoded = self.model.decode_masks(
            backbone_features,
            &image_pe,
            &embeddings,
            multimask_output,
            high_res_features,
        )?;

        let mut low_res_multimasks = decoded.mask_logits.to_dtype(DType::F32)?;
        if self.config.pred_obj_scores {
            // spatial memory wants a hard present/absent choice
            let is_obj_appearing = decoded.object_score_logits.gt(0.0)?;
            low_res_multimasks = is_obj_appearing
                .unsqueeze(2)?
                .unsqueeze(3)?
                .broadcast_as(low_res_multimasks.shape())?
                .where_cond(
                    &low_res_multimasks,
                    &Tensor::full(NO_OBJ_SCORE, low_res_multimasks.shape(), device)?,
                )?;
        }
        let high_res_multimasks =
            resize_bilinear(&low_res_multimasks, image_size, image_size, false)?;

        let (low_res_masks, high_res_masks, token) = if multimask_output {
            let best = decoded.iou_scores.argmax(1)?;
            let (_, _, h, w) = low_res_multimasks.dims4()?;
            let idx = best.reshape((b, 1, 1, 1))?.expand((b, 1, h, w))?.contiguous()?;
            let low = low_res_multimasks.gather(&idx, 1)?;
            let idx = best
                .reshape((b, 1, 1, 1))?
                .expand((b, 1, image_size, image_size))?
                .contiguous()?;
            let high = high_res_multimasks.gather(&idx, 1)?;
            let token = if decoded.mask_tokens.dim(1)? > 1 {
                let c = decoded.mask_tokens.dim(2)?;
                let idx = best.reshape((b, 1, 1))?.expand((b, 1, c))?.contiguous()?;
                decoded.mask_tokens.gather(&idx, 1)?.squeeze(1)?
            } else {
                decoded.mask_tokens.i((.., 0))?
            };
            (low, high, token)
        } else {
            (
                low_res_multimasks,
                high_res_multimasks,
                decoded.mask_tokens.i((.., 0))?,
            )
        };

        let mut obj_ptr = self.model.project_object_pointer(&token)?;
        if self.config.pred_obj_scores {
            let lambda = if self.config.soft_no_obj_ptr {
                candle_nn::ops::sigmoid(&decoded.object_score_logits)?
            } else {
                decoded.object_score_logits.gt(0.0)?.to_dtype(DType::F32)?
            };
            if let Some(no_ptr) = self.model.no_object_pointer()? {
                if self.config.fixed_no_obj_ptr {
                    obj_ptr = obj_ptr.broadcast_mul(&lambda)?;
                }
                let complement = lambda.affine(-1.0, 1.0)?;
                obj_ptr = obj_ptr.broadcast_add(&complement.broadcast_mul(&no_ptr)?)?;
            }
        }

        Ok(HeadOutputs {
            low_res_masks,
            high_res_masks,
            obj_ptr,
            object_score_logits: decoded.object_score_logits,
        })
    }

    /// Treat a mask prompt as the frame's prediction without decoding.
    /// Scores are scaled so thresholding and sigmoid both reproduce the
    /// input mask.
    fn mask_as_output(
        &self,
        pix_feat: &Tensor,
        high_res_features: Option<&(Tensor, Tensor)>,
        mask_inputs: &Tensor,
    ) -> Result<HeadOutputs> {
        const OUT_SCALE: f64 = 20.0;
        const OUT_BIAS: f64 = -10.0;

        let mask_f = mask_inputs.to_dtype(DType::F32)?;
        let high_res_masks = mask_f.affine(OUT_SCALE, OUT_BIAS)?;
        let (b, _, h, w) = high_res_masks.dims4()?;
        let low_res_masks = resize_bilinear(&high_res_masks, h / 4, w / 4, true)?;

        let obj_ptr = if self.config.use_obj_ptrs_in_encoder {
            // derive a pointer by decoding the mask prompt
            let target = self.model.image_size() / 4;
            let down = resize_bilinear(&mask_f, target, target, true)?;
            self.sam_heads(pix_feat, high_res_features, None, Some(&down), false)?
                .obj_ptr
        } else {
            Tensor::zeros((b, self.model.hidden_dim()), DType::F32, mask_f.device())?
        };

        // presence comes from the mask itself, consistent with using the
        // mask as the prediction
        let lambda = mask_f
            .flatten(1, 3)?
            .gt(0.0)?
            .to_dtype(DType::F32)?
            .max_keepdim(1)?;
        let object_score_logits = lambda.affine(OUT_SCALE, OUT_BIAS)?;

        let mut obj_ptr = obj_ptr;
        if self.config.pred_obj_scores {
            if let Some(no_ptr) = self.model.no_object_pointer()? {
                if self.config.fixed_no_obj_ptr {
                    obj_ptr = obj_ptr.broadcast_mul(&lambda)?;
                }
                let complement = lambda.affine(-1.0, 1.0)?;
                obj_ptr = obj_ptr.broadcast_add(&complement.broadcast_mul(&no_ptr)?)?;
            }
        }

        Ok(HeadOutputs {
            low_res_masks,
            high_res_masks,
            obj_ptr,
            object_score_logits,
        })
    }

    /// Encode a frame's final masks into spatial memory.
    pub(crate) fn encode_new_memory(
        &self,
        features: &FrameFeatures,
        high_res_masks: &Tensor,
        object_score_logits: &Tensor,
        is_mask_from_pts: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (feats, _, (h, w)) = last_level(features)?;
        let (_, b, c) = feats.dims3()?;
        let pix_feat = feats.permute((1, 2, 0))?.reshape((b, c, h, w))?;

        let masks = if self.config.non_overlap_masks_for_mem_enc {
            super::postprocess::apply_non_overlapping_constraints(high_res_masks)?
        } else {
            high_res_masks.clone()
        };
        // click-derived masks can be stored as hard binary maps
        let binarize = self.config.binarize_mask_from_pts_for_mem_enc && is_mask_from_pts;
        let mask_for_mem = if binarize {
            masks.gt(0.0)?.to_dtype(DType::F32)?
        } else {
            candle_nn::ops::sigmoid(&masks)?
        };
        let scale = self.config.sigmoid_scale_for_mem_enc;
        let bias = self.config.sigmoid_bias_for_mem_enc;
        let mask_for_mem = if scale != 1.0 || bias != 0.0 {
            mask_for_mem.affine(scale as f64, bias as f64)?
        } else {
            mask_for_mem
        };

        let (mut mem_features, mem_pos) = self.model.encode_memory(&pix_feat, &mask_for_mem)?;
        if let Some(spatial_embed) = self.model.no_object_spatial_embedding()? {
            let is_obj_appearing = object_score_logits.gt(0.0)?.to_dtype(DType::F32)?;
            let factor = is_obj_appearing
                .affine(-1.0, 1.0)?
                .reshape((b, 1, 1, 1))?;
            let embed = spatial_embed.reshape((1, self.model.mem_dim(), 1, 1))?;
            mem_features = mem_features.broadcast_add(&embed.broadcast_mul(&factor)?)?;
        }
        Ok((mem_features, mem_pos))
    }

    /// The two higher-resolution levels as `[B, C, H, W]` maps for the
    /// decoder's upsampling path.
    fn high_res_features(&self, features: &FrameFeatures) -> Result<Option<(Tensor, Tensor)>> {
        if features.vision_feats.len() < 3 {
            return Ok(None);
        }
        let to_map = |level: usize| -> Result<Tensor> {
            let (_, b, c) = features.vision_feats[level].dims3()?;
            let (h, w) = features.feat_sizes[level];
            Ok(features.vision_feats[level]
                .permute((1, 2, 0))?
                .reshape((b, c, h, w))?)
        };
        Ok(Some((to_map(0)?, to_map(1)?)))
    }

    fn use_multimask(&self, is_init_cond_frame: bool, point_inputs: Option<&PointPrompts>) -> bool {
        let num_pts = point_inputs
            .and_then(|p| p.labels.dim(1).ok())
            .unwrap_or(0);
        self.config.multimask_output_in_sam
            && (is_init_cond_frame || self.config.multimask_output_for_tracking)
            && (self.config.multimask_min_pt_num..=self.config.multimask_max_pt_num)
                .contains(&num_pts)
    }
}
