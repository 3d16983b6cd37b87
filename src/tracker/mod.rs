//! The tracking engine.
//!
//! [`VideoTracker`] wraps a [`TrackerModel`] and drives [`Session`]s
//! through the interactive loop: prompt one or more objects on any frame,
//! preview the result, then propagate through the video. All temporal
//! state lives in the session; the tracker itself is immutable and can
//! serve several sessions.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::frames::{FrameSource, FrameStore};
use crate::interpolate::resize_bilinear;
use crate::model::{PointPrompts, TrackerModel};
use crate::session::features::{expand_features, prepare_backbone_features, FrameFeatures};
use crate::session::inputs::{build_point_prompts, BoxPrompt, PointLabel};
use crate::session::outputs::{FrameOutput, NO_OBJ_SCORE};
use crate::session::Session;

mod postprocess;
mod step;
mod window;

use postprocess::fill_holes_in_mask_scores;

/// One object's mask on one frame, at native video resolution.
#[derive(Debug)]
pub struct ObjectMask {
    pub object_id: usize,
    /// `[H, W]` mask logits; a pixel belongs to the object where the value
    /// is positive.
    pub mask: Tensor,
}

/// All objects' masks on one frame, in registration order.
#[derive(Debug)]
pub struct FrameMasks {
    pub frame_idx: usize,
    pub masks: Vec<ObjectMask>,
}

/// Which output maps a single inference step conditions on.
enum InferenceScope {
    /// One object's own committed maps.
    Object(usize),
    /// The consolidated all-object bank.
    Consolidated,
    /// No memory at all.
    Detached,
}

pub struct VideoTracker<M> {
    model: M,
    config: TrackerConfig,
}

impl<M: TrackerModel> VideoTracker<M> {
    pub fn new(model: M, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Open a tracking session over `source`.
    ///
    /// With `offload_state_to_cpu`, per-frame outputs are stored on the CPU
    /// and moved back to the compute device as the memory window needs
    /// them. The first frame's features are computed eagerly so the first
    /// prompt responds without paying for the backbone.
    pub fn init_session(
        &self,
        source: Box<dyn FrameSource>,
        offload_state_to_cpu: bool,
    ) -> Result<Session> {
        let frames = FrameStore::new(source)?;
        let device = self.model.device().clone();
        let storage_device = if offload_state_to_cpu {
            Device::Cpu
        } else {
            device.clone()
        };
        let mut session = Session::new(frames, device, storage_device);
        let (video_w, video_h) = session.video_size();
        info!(
            "session opened: {} frames at {video_w}x{video_h}",
            session.num_frames()
        );
        self.frame_features(&mut session, 0, 1)?;
        Ok(session)
    }

    /// Drop all objects, prompts and outputs so the session can restart
    /// from scratch on the same video.
    pub fn reset_session(&self, session: &mut Session) {
        session.reset();
    }

    /// Add clicks and/or a box for one object on one frame and return
    /// refreshed masks for every object on that frame.
    ///
    /// Clicks accumulate across calls on the same frame unless
    /// `clear_old_points` is set. With `normalize_coords` the inputs are
    /// pixel positions in the native video; without it they must already
    /// be normalized to [0, 1]. A box can only start a fresh prompt.
    #[allow(clippy::too_many_arguments)]
    pub fn add_points_or_box(
        &self,
        session: &mut Session,
        frame_idx: usize,
        object_id: usize,
        points: &[(f32, f32)],
        labels: &[PointLabel],
        box_prompt: Option<BoxPrompt>,
        clear_old_points: bool,
        normalize_coords: bool,
    ) -> Result<FrameMasks> {
        session.check_frame(frame_idx)?;
        if box_prompt.is_some() {
            if !clear_old_points {
                return Err(Error::InvalidArgument(
                    "a box prompt replaces earlier clicks; pass clear_old_points".into(),
                ));
            }
            if session.tracking_started {
                warn!(
                    "box prompt on frame {frame_idx} after tracking started; boxes are \
                     intended as initial prompts and may not refine an existing mask well"
                );
            }
        }
        let slot = session.slot_for_prompt(object_id)?;
        let prompts = build_point_prompts(
            points,
            labels,
            box_prompt,
            session.video_size(),
            self.model.image_size(),
            normalize_coords,
            &session.device,
        )?;
        let merged = session.objects[slot].inputs.set_points(
            frame_idx,
            prompts.coords,
            prompts.labels,
            clear_old_points,
        )?;

        // A prompt on an untracked frame opens a new conditioning frame; on
        // a tracked frame it corrects the existing prediction in the
        // direction the frame was tracked in.
        let is_init_cond_frame = !session.is_tracked(frame_idx);
        let reverse = session
            .frames_tracked
            .get(&frame_idx)
            .copied()
            .unwrap_or(false);
        let is_cond = is_init_cond_frame || self.config.add_all_frames_to_correct_as_cond;

        // Seed the decoder with the object's previous mask on this frame,
        // clamped so stale extremes cannot drown out fresh clicks.
        let prev_hint = match session.objects[slot].outputs.lookup(frame_idx, is_cond) {
            Some(prev) => Some(
                prev.pred_masks
                    .to_device(&session.device)?
                    .clamp(-32.0, 32.0)?,
            ),
            None => None,
        };

        let output = self.run_single_frame_inference(
            session,
            InferenceScope::Object(slot),
            frame_idx,
            1,
            is_init_cond_frame,
            Some(&merged),
            None,
            reverse,
            false,
            prev_hint.as_ref(),
        )?;
        session.objects[slot]
            .outputs
            .temp_mut(is_cond)
            .insert(frame_idx, output);
        self.interactive_preview(session, frame_idx, is_cond)
    }

    /// Add a dense `[H, W]` mask prompt for one object on one frame and
    /// return refreshed masks for every object on that frame. Nonzero
    /// pixels mark the object; the mask is resized and binarized to the
    /// model input size if needed.
    pub fn add_mask(
        &self,
        session: &mut Session,
        frame_idx: usize,
        object_id: usize,
        mask: &Tensor,
    ) -> Result<FrameMasks> {
        session.check_frame(frame_idx)?;
        if mask.dims().len() != 2 {
            return Err(Error::InvalidArgument(format!(
                "mask prompt must be [H, W], got shape {:?}",
                mask.dims()
            )));
        }
        let slot = session.slot_for_prompt(object_id)?;
        let image_size = self.model.image_size();
        let mask = mask.to_dtype(DType::F32)?.unsqueeze(0)?.unsqueeze(0)?;
        let mask = if mask.dim(2)? != image_size || mask.dim(3)? != image_size {
            resize_bilinear(&mask, image_size, image_size, true)?
                .ge(0.5)?
                .to_dtype(DType::F32)?
        } else {
            mask
        };
        let mask = mask.to_device(&session.device)?;
        session.objects[slot].inputs.set_mask(frame_idx, mask.clone());

        let is_init_cond_frame = !session.is_tracked(frame_idx);
        let reverse = session
            .frames_tracked
            .get(&frame_idx)
            .copied()
            .unwrap_or(false);
        let is_cond = is_init_cond_frame || self.config.add_all_frames_to_correct_as_cond;

        let output = self.run_single_frame_inference(
            session,
            InferenceScope::Object(slot),
            frame_idx,
            1,
            is_init_cond_frame,
            None,
            Some(&mask),
            reverse,
            false,
            None,
        )?;
        session.objects[slot]
            .outputs
            .temp_mut(is_cond)
            .insert(frame_idx, output);
        self.interactive_preview(session, frame_idx, is_cond)
    }

    /// Consolidate all pending prompts and return an iterator that tracks
    /// through the video one frame at a time.
    ///
    /// Tracking runs forward from `start_frame` (or the earliest prompted
    /// frame) over at most `max_frames` further frames; with `reverse` it
    /// runs backward instead, yielding nothing when starting at frame 0.
    /// Frames the bank already holds are returned as-is, so propagating
    /// twice does not recompute anything.
    pub fn propagate<'s>(
        &'s self,
        session: &'s mut Session,
        start_frame: Option<usize>,
        max_frames: Option<usize>,
        reverse: bool,
    ) -> Result<Propagation<'s, M>> {
        self.preflight(session)?;
        let first_cond = session.bank.cond.keys().next().copied().ok_or_else(|| {
            Error::InvalidState("no prompts to propagate; add points or masks first".into())
        })?;
        let start = match start_frame {
            Some(t) => {
                session.check_frame(t)?;
                t
            }
            None => first_cond,
        };
        let num_frames = session.num_frames();
        let max_track = max_frames.unwrap_or(num_frames);
        let order: Vec<usize> = if reverse {
            if start == 0 {
                Vec::new()
            } else {
                let end = start.saturating_sub(max_track);
                (end..=start).rev().collect()
            }
        } else {
            let end = start.saturating_add(max_track).min(num_frames - 1);
            (start..=end).collect()
        };
        debug!(
            "propagating {} frames {} from frame {start}",
            order.len(),
            if reverse { "backward" } else { "forward" },
        );
        let clear_non_cond_mem = self.config.clear_non_cond_mem_around_input
            && (self.config.clear_non_cond_mem_for_multi_obj || session.objects.len() <= 1);
        Ok(Propagation {
            tracker: self,
            session,
            order: order.into_iter(),
            reverse,
            clear_non_cond_mem,
        })
    }

    /// Move every temporary output into the committed maps, consolidating
    /// across objects and encoding memory, so propagation sees a coherent
    /// bank. Registration is locked from here on.
    fn preflight(&self, session: &mut Session) -> Result<()> {
        session.tracking_started = true;
        let batch = session.objects.len();
        let clear_non_cond_mem = self.config.clear_non_cond_mem_around_input
            && (self.config.clear_non_cond_mem_for_multi_obj || batch <= 1);

        for is_cond in [false, true] {
            let mut temp_frames = BTreeSet::new();
            for record in &session.objects {
                temp_frames.extend(record.outputs.temp(is_cond).keys().copied());
            }
            if is_cond {
                session
                    .bank
                    .cond_frame_inds
                    .extend(temp_frames.iter().copied());
            } else {
                session
                    .bank
                    .non_cond_frame_inds
                    .extend(temp_frames.iter().copied());
            }
            for &frame_idx in &temp_frames {
                let consolidated =
                    self.consolidate_temp_outputs(session, frame_idx, is_cond, true, false)?;
                session.commit_consolidated(frame_idx, is_cond, consolidated)?;
                if clear_non_cond_mem {
                    session.purge_non_cond_around(frame_idx, self.config.purge_radius());
                }
            }
            for record in &mut session.objects {
                record.outputs.temp_mut(is_cond).clear();
            }
        }

        // a conditioning output displaces any non-conditioning one on the
        // same frame
        let cond_frames: Vec<usize> = session.bank.cond.keys().copied().collect();
        for frame_idx in &cond_frames {
            session.bank.non_cond.remove(frame_idx);
        }
        for record in &mut session.objects {
            let cond_keys: Vec<usize> = record.outputs.cond.keys().copied().collect();
            for frame_idx in cond_keys {
                record.outputs.non_cond.remove(&frame_idx);
            }
        }
        let cond_inds: Vec<usize> = session.bank.cond_frame_inds.iter().copied().collect();
        for frame_idx in cond_inds {
            if !session.bank.cond.contains_key(&frame_idx) {
                return Err(Error::ConsistencyViolation(format!(
                    "frame {frame_idx} was consolidated as conditioning but holds no output"
                )));
            }
            session.bank.non_cond_frame_inds.remove(&frame_idx);
        }

        // every prompted frame must now be consolidated, and nothing else
        let mut consolidated: BTreeSet<usize> =
            session.bank.cond_frame_inds.iter().copied().collect();
        consolidated.extend(session.bank.non_cond_frame_inds.iter().copied());
        let prompted = session.prompted_frames();
        if consolidated != prompted {
            return Err(Error::ConsistencyViolation(format!(
                "consolidated frames {consolidated:?} do not match prompted frames {prompted:?}"
            )));
        }
        Ok(())
    }

    /// Consolidate the frame's outputs across objects without touching
    /// memory and return them at video resolution.
    fn interactive_preview(
        &self,
        session: &mut Session,
        frame_idx: usize,
        is_cond: bool,
    ) -> Result<FrameMasks> {
        let consolidated = self.consolidate_temp_outputs(session, frame_idx, is_cond, false, true)?;
        self.video_res_masks(session, &consolidated, frame_idx)
    }

    /// Stack every object's latest output on `frame_idx` into one batched
    /// [`FrameOutput`], slot by slot.
    ///
    /// Objects without an output on this frame contribute sentinel mask
    /// rows and, when memory is being encoded, a pointer decoded from an
    /// empty mask so memory fusion never sees an uninitialized pointer.
    fn consolidate_temp_outputs(
        &self,
        session: &mut Session,
        frame_idx: usize,
        is_cond: bool,
        run_mem_encoder: bool,
        at_video_res: bool,
    ) -> Result<FrameOutput> {
        let batch = session.objects.len();
        let image_size = self.model.image_size();
        let hidden_dim = self.model.hidden_dim();
        let (video_w, video_h) = session.video_size();
        let (mask_h, mask_w) = if at_video_res {
            (video_h, video_w)
        } else {
            (image_size / 4, image_size / 4)
        };

        let mut pred_masks = Tensor::full(
            NO_OBJ_SCORE,
            (batch, 1, mask_h, mask_w),
            &session.storage_device,
        )?;
        let mut obj_ptr = Tensor::full(NO_OBJ_SCORE, (batch, hidden_dim), &session.device)?;
        let mut object_score_logits = Tensor::full(10.0f32, (batch, 1), &session.device)?;

        let mut empty_mask_ptr: Option<Tensor> = None;
        for slot in 0..batch {
            let Some(out) = session.objects[slot]
                .outputs
                .lookup(frame_idx, is_cond)
                .cloned()
            else {
                if run_mem_encoder {
                    if empty_mask_ptr.is_none() {
                        empty_mask_ptr = Some(self.empty_mask_pointer(session, frame_idx)?);
                    }
                    if let Some(ptr) = &empty_mask_ptr {
                        obj_ptr = obj_ptr.slice_assign(&[slot..slot + 1, 0..hidden_dim], ptr)?;
                    }
                }
                continue;
            };
            let obj_mask = if out.pred_masks.dim(2)? == mask_h && out.pred_masks.dim(3)? == mask_w
            {
                out.pred_masks
            } else {
                resize_bilinear(&out.pred_masks, mask_h, mask_w, false)?
            };
            pred_masks = pred_masks.slice_assign(
                &[slot..slot + 1, 0..1, 0..mask_h, 0..mask_w],
                &obj_mask.to_device(&session.storage_device)?,
            )?;
            obj_ptr = obj_ptr.slice_assign(&[slot..slot + 1, 0..hidden_dim], &out.obj_ptr)?;
            object_score_logits = object_score_logits
                .slice_assign(&[slot..slot + 1, 0..1], &out.object_score_logits)?;
        }

        let maskmem = if run_mem_encoder {
            let high_res = resize_bilinear(
                &pred_masks.to_device(&session.device)?,
                image_size,
                image_size,
                false,
            )?;
            Some(self.run_memory_encoder(
                session,
                frame_idx,
                batch,
                &high_res,
                &object_score_logits,
            )?)
        } else {
            None
        };

        Ok(FrameOutput {
            pred_masks,
            obj_ptr,
            object_score_logits,
            maskmem,
        })
    }

    /// Encode consolidated masks into spatial memory with the frame's
    /// batched backbone features.
    fn run_memory_encoder(
        &self,
        session: &mut Session,
        frame_idx: usize,
        batch: usize,
        high_res_masks: &Tensor,
        object_score_logits: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let features = self.frame_features(session, frame_idx, batch)?;
        let (mem_features, mem_pos) =
            self.encode_new_memory(&features, high_res_masks, object_score_logits, true)?;
        let mem_features = mem_features
            .to_dtype(DType::BF16)?
            .to_device(&session.storage_device)?;
        let mem_pos = session.dedup_maskmem_pos_enc(&mem_pos)?;
        Ok((mem_features, mem_pos))
    }

    /// Pointer produced by decoding a blank mask on `frame_idx`, standing
    /// in for objects that have no output on a consolidated frame.
    fn empty_mask_pointer(&self, session: &mut Session, frame_idx: usize) -> Result<Tensor> {
        let size = self.model.image_size();
        let mask = Tensor::zeros((1, 1, size, size), DType::F32, &session.device)?;
        let output = self.run_single_frame_inference(
            session,
            InferenceScope::Detached,
            frame_idx,
            1,
            true,
            None,
            Some(&mask),
            false,
            false,
            None,
        )?;
        Ok(output.obj_ptr)
    }

    /// One model pass on one frame under the given scope, with the result
    /// readied for storage.
    #[allow(clippy::too_many_arguments)]
    fn run_single_frame_inference(
        &self,
        session: &mut Session,
        scope: InferenceScope,
        frame_idx: usize,
        batch: usize,
        is_init_cond_frame: bool,
        point_inputs: Option<&PointPrompts>,
        mask_inputs: Option<&Tensor>,
        reverse: bool,
        run_mem_encoder: bool,
        prev_mask_hint: Option<&Tensor>,
    ) -> Result<FrameOutput> {
        let features = self.frame_features(session, frame_idx, batch)?;
        let empty = BTreeMap::new();
        let (cond, non_cond) = match &scope {
            InferenceScope::Object(slot) => {
                let outputs = &session.objects[*slot].outputs;
                (&outputs.cond, &outputs.non_cond)
            }
            InferenceScope::Consolidated => (&session.bank.cond, &session.bank.non_cond),
            InferenceScope::Detached => (&empty, &empty),
        };
        let step = self.track_step(
            frame_idx,
            is_init_cond_frame,
            &features,
            point_inputs,
            mask_inputs,
            cond,
            non_cond,
            session.num_frames(),
            run_mem_encoder,
            prev_mask_hint,
            reverse,
        )?;

        let maskmem = match step.maskmem {
            Some((feats, pos)) => {
                let feats = feats
                    .to_dtype(DType::BF16)?
                    .to_device(&session.storage_device)?;
                let pos = session.dedup_maskmem_pos_enc(&pos)?;
                Some((feats, pos))
            }
            None => None,
        };
        let mut pred_masks = step.low_res_masks;
        if self.config.fill_hole_area > 0 {
            pred_masks = match fill_holes_in_mask_scores(&pred_masks, self.config.fill_hole_area) {
                Ok(filled) => filled,
                Err(Error::NumericDegradation { stage, reason }) => {
                    warn!("skipping {stage} on frame {frame_idx}: {reason}");
                    pred_masks
                }
                Err(e) => return Err(e),
            };
        }
        Ok(FrameOutput {
            pred_masks: pred_masks.to_device(&session.storage_device)?,
            obj_ptr: step.obj_ptr,
            object_score_logits: step.object_score_logits,
            maskmem,
        })
    }

    /// The frame's backbone features, from cache when possible, replicated
    /// to `batch` rows and flattened for fusion.
    fn frame_features(
        &self,
        session: &mut Session,
        frame_idx: usize,
        batch: usize,
    ) -> Result<FrameFeatures> {
        let backbone = match session.cache.lookup(frame_idx) {
            Some(features) => features,
            None => {
                debug!("backbone cache miss on frame {frame_idx}");
                let frame =
                    session
                        .frames
                        .get_frame(frame_idx, self.model.image_size(), &session.device)?;
                let features = self.model.extract_features(&frame)?;
                session.cache.put(frame_idx, features.clone());
                features
            }
        };
        let expanded = expand_features(&backbone, batch)?;
        prepare_backbone_features(&expanded, self.model.num_feature_levels())
    }

    /// Map a frame's batched masks to native video resolution, one entry
    /// per object in slot order.
    fn video_res_masks(
        &self,
        session: &Session,
        output: &FrameOutput,
        frame_idx: usize,
    ) -> Result<FrameMasks> {
        let (video_w, video_h) = session.video_size();
        let mut masks = output.pred_masks.to_device(&session.device)?;
        if masks.dim(2)? != video_h || masks.dim(3)? != video_w {
            masks = resize_bilinear(&masks, video_h, video_w, false)?;
        }
        if self.config.non_overlap_masks {
            masks = postprocess::apply_non_overlapping_constraints(&masks)?;
        }
        let batch = masks.dim(0)?;
        let rows = masks.chunk(batch, 0)?;
        let mut per_object = Vec::with_capacity(batch);
        for (slot, row) in rows.into_iter().enumerate() {
            let object_id = session.registry.id_of(slot).ok_or_else(|| {
                Error::ConsistencyViolation(format!("output row {slot} has no registered object"))
            })?;
            per_object.push(ObjectMask {
                object_id,
                mask: row.squeeze(0)?.squeeze(0)?,
            });
        }
        Ok(FrameMasks {
            frame_idx,
            masks: per_object,
        })
    }
}

/// Streaming propagation over the processing order. Each `next()` tracks
/// (or reuses) one frame and yields its video-resolution masks, so callers
/// can render incrementally or stop early.
pub struct Propagation<'s, M: TrackerModel> {
    tracker: &'s VideoTracker<M>,
    session: &'s mut Session,
    order: std::vec::IntoIter<usize>,
    reverse: bool,
    clear_non_cond_mem: bool,
}

impl<M: TrackerModel> Propagation<'_, M> {
    fn step(&mut self, frame_idx: usize) -> Result<FrameMasks> {
        let session = &mut *self.session;
        let (output, is_cond) = if let Some(existing) = session.bank.cond.get(&frame_idx).cloned()
        {
            if self.clear_non_cond_mem {
                session.purge_non_cond_around(frame_idx, self.tracker.config.purge_radius());
            }
            (existing, true)
        } else if let Some(existing) = session.bank.non_cond.get(&frame_idx).cloned() {
            (existing, false)
        } else {
            let batch = session.objects.len();
            let output = self.tracker.run_single_frame_inference(
                session,
                InferenceScope::Consolidated,
                frame_idx,
                batch,
                false,
                None,
                None,
                self.reverse,
                true,
                None,
            )?;
            session.bank.non_cond.insert(frame_idx, output.clone());
            (output, false)
        };
        session.split_per_object(frame_idx, is_cond, &output)?;
        session.frames_tracked.insert(frame_idx, self.reverse);
        self.tracker.video_res_masks(session, &output, frame_idx)
    }
}

impl<M: TrackerModel> Iterator for Propagation<'_, M> {
    type Item = Result<FrameMasks>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame_idx = self.order.next()?;
        Some(self.step(frame_idx))
    }
}
