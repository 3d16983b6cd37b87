//! Per-video tracking state.
//!
//! A [`Session`] owns everything tied to one video: the frame store, the
//! object registry, each object's prompts and outputs, the consolidated
//! output bank, the backbone feature cache, and the per-frame tracking
//! record. The engine in [`crate::tracker`] drives it; nothing here runs
//! the model.

pub mod features;
pub mod inputs;
pub mod outputs;
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{Device, Tensor};
use log::info;

use crate::error::{Error, Result};
use crate::frames::FrameStore;
use features::FeatureCache;
use inputs::ObjectInputs;
use outputs::{FrameOutput, ObjectOutputs, OutputBank};
use registry::ObjectRegistry;

/// One tracked object's prompts and outputs, indexed by registry slot.
#[derive(Debug, Default)]
pub struct ObjectRecord {
    pub inputs: ObjectInputs,
    pub outputs: ObjectOutputs,
}

pub struct Session {
    pub(crate) frames: FrameStore,
    pub(crate) registry: ObjectRegistry,
    pub(crate) objects: Vec<ObjectRecord>,
    pub(crate) bank: OutputBank,
    pub(crate) cache: FeatureCache,
    /// Frames visited by propagation, with the direction they were reached
    /// in (`true` = reverse).
    pub(crate) frames_tracked: BTreeMap<usize, bool>,
    pub(crate) tracking_started: bool,
    pub(crate) device: Device,
    pub(crate) storage_device: Device,
    /// Memory positional encoding is identical on every frame; one copy is
    /// kept and re-broadcast per batch.
    pub(crate) maskmem_pos_enc: Option<Tensor>,
}

impl Session {
    pub(crate) fn new(frames: FrameStore, device: Device, storage_device: Device) -> Self {
        Self {
            frames,
            registry: ObjectRegistry::default(),
            objects: Vec::new(),
            bank: OutputBank::default(),
            cache: FeatureCache::default(),
            frames_tracked: BTreeMap::new(),
            tracking_started: false,
            device,
            storage_device,
            maskmem_pos_enc: None,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.frames.num_frames()
    }

    /// Native (width, height) of the video.
    pub fn video_size(&self) -> (usize, usize) {
        (self.frames.video_width(), self.frames.video_height())
    }

    /// Object ids in slot order.
    pub fn object_ids(&self) -> &[usize] {
        self.registry.ids()
    }

    pub fn tracking_started(&self) -> bool {
        self.tracking_started
    }

    pub fn is_tracked(&self, frame_idx: usize) -> bool {
        self.frames_tracked.contains_key(&frame_idx)
    }

    /// Frames of the consolidated bank that hold conditioning outputs.
    pub fn cond_frames(&self) -> Vec<usize> {
        self.bank.cond.keys().copied().collect()
    }

    /// Frames of the consolidated bank that hold non-conditioning outputs.
    pub fn non_cond_frames(&self) -> Vec<usize> {
        self.bank.non_cond.keys().copied().collect()
    }

    /// Union of all frames any object has prompts on.
    pub fn prompted_frames(&self) -> BTreeSet<usize> {
        let mut frames = BTreeSet::new();
        for record in &self.objects {
            frames.extend(record.inputs.prompted_frames());
        }
        frames
    }

    pub(crate) fn check_frame(&self, frame_idx: usize) -> Result<()> {
        self.frames.check_frame(frame_idx)
    }

    /// Slot for `object_id`, registering it if the session still accepts
    /// new objects.
    pub(crate) fn slot_for_prompt(&mut self, object_id: usize) -> Result<usize> {
        if let Some(slot) = self.registry.get(object_id) {
            return Ok(slot);
        }
        if self.tracking_started {
            return Err(Error::InvalidState(format!(
                "cannot register new object {object_id} after tracking has started \
                 (existing ids: {:?}); reset the session to start over",
                self.registry.ids()
            )));
        }
        let slot = self.registry.register(object_id);
        self.objects.push(ObjectRecord::default());
        Ok(slot)
    }

    /// Store a consolidated output and mirror per-object row views into
    /// each object's committed maps.
    pub(crate) fn commit_consolidated(
        &mut self,
        frame_idx: usize,
        is_cond: bool,
        output: FrameOutput,
    ) -> Result<()> {
        self.split_per_object(frame_idx, is_cond, &output)?;
        self.bank.partition_mut(is_cond).insert(frame_idx, output);
        Ok(())
    }

    pub(crate) fn split_per_object(
        &mut self,
        frame_idx: usize,
        is_cond: bool,
        output: &FrameOutput,
    ) -> Result<()> {
        for slot in 0..self.objects.len() {
            let row = output.slice(slot)?;
            self.objects[slot]
                .outputs
                .committed_mut(is_cond)
                .insert(frame_idx, row);
        }
        Ok(())
    }

    /// Forget non-conditioning memory near `frame_idx`, in the bank and in
    /// every per-object map.
    pub(crate) fn purge_non_cond_around(&mut self, frame_idx: usize, radius: usize) {
        let begin = frame_idx.saturating_sub(radius);
        let end = frame_idx + radius;
        self.bank.purge_non_cond_around(frame_idx, radius);
        for record in &mut self.objects {
            record
                .outputs
                .non_cond
                .retain(|t, _| *t < begin || *t > end);
        }
    }

    /// First stored copy wins; later calls return it re-broadcast to the
    /// requested batch size.
    pub(crate) fn dedup_maskmem_pos_enc(&mut self, pos_enc: &Tensor) -> Result<Tensor> {
        let single = match &self.maskmem_pos_enc {
            Some(stored) => stored.clone(),
            None => {
                let first = pos_enc.narrow(0, 0, 1)?.copy()?;
                self.maskmem_pos_enc = Some(first.clone());
                first
            }
        };
        let (batch, _, _, _) = pos_enc.dims4()?;
        let (_, c, h, w) = single.dims4()?;
        Ok(single.expand((batch, c, h, w))?)
    }

    /// Drop all objects, prompts and outputs, returning the session to its
    /// pre-registration phase. The frame store and cached backbone
    /// features are untouched.
    pub(crate) fn reset(&mut self) {
        info!("resetting session tracking state");
        self.registry.clear();
        self.objects.clear();
        self.bank.clear();
        self.frames_tracked.clear();
        self.tracking_started = false;
    }
}
