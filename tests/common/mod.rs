use std::cell::Cell;

use candle_core::{DType, Device, Tensor};
use vostrack::error::Result;
use vostrack::model::{
    BackboneFeatures, DecoderOutput, PointPrompts, PromptEmbeddings, TrackerModel,
};

pub const IMG: usize = 64;
pub const DIM: usize = 32;

/// Deterministic stand-in for the neural pieces.
///
/// Masks decode to +8 when the prompt is positive or the fused features
/// carry memory of the object, -8 otherwise; encoded memory stores the
/// mask's mean occupancy. Object state therefore flows through the session
/// the same way it would with real weights, and call counters expose how
/// often each stage ran.
pub struct StubModel {
    device: Device,
    pub extract_calls: Cell<usize>,
    pub decode_calls: Cell<usize>,
    pub fuse_calls: Cell<usize>,
    /// Object-presence logit the decoder reports.
    pub score_logit: Cell<f32>,
}

impl StubModel {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            extract_calls: Cell::new(0),
            decode_calls: Cell::new(0),
            fuse_calls: Cell::new(0),
            score_logit: Cell::new(10.0),
        }
    }
}

impl TrackerModel for StubModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn image_size(&self) -> usize {
        IMG
    }

    fn hidden_dim(&self) -> usize {
        DIM
    }

    fn mem_dim(&self) -> usize {
        DIM
    }

    fn extract_features(&self, frames: &Tensor) -> Result<BackboneFeatures> {
        self.extract_calls.set(self.extract_calls.get() + 1);
        let b = frames.dim(0)?;
        let mut feature_maps = Vec::new();
        for side in [IMG / 4, IMG / 8, IMG / 16] {
            feature_maps.push(Tensor::zeros((b, DIM, side, side), DType::F32, &self.device)?);
        }
        let position_encodings = feature_maps.clone();
        Ok(BackboneFeatures {
            feature_maps,
            position_encodings,
        })
    }

    fn encode_prompts(
        &self,
        points: Option<&PointPrompts>,
        mask: Option<&Tensor>,
    ) -> Result<PromptEmbeddings> {
        let mut signal = -1.0f32;
        if let Some(p) = points {
            let max_label = p.labels.flatten_all()?.max(0)?.to_scalar::<f32>()?;
            if max_label >= 1.0 {
                signal = 1.0;
            }
        }
        if let Some(m) = mask {
            if m.sum_all()?.to_scalar::<f32>()? > 0.0 {
                signal = 1.0;
            }
        }
        Ok(PromptEmbeddings {
            sparse: Tensor::full(signal, (1, 1, 1), &self.device)?,
            dense: Tensor::zeros((1, 1, 1), DType::F32, &self.device)?,
        })
    }

    fn dense_positional_encoding(&self) -> Result<Tensor> {
        Ok(Tensor::zeros(
            (1, DIM, IMG / 16, IMG / 16),
            DType::F32,
            &self.device,
        )?)
    }

    fn decode_masks(
        &self,
        image_embeddings: &Tensor,
        _image_pe: &Tensor,
        prompts: &PromptEmbeddings,
        multimask_output: bool,
        _high_res_features: Option<&(Tensor, Tensor)>,
    ) -> Result<DecoderOutput> {
        self.decode_calls.set(self.decode_calls.get() + 1);
        let b = image_embeddings.dim(0)?;
        let m = if multimask_output { 3 } else { 1 };
        let side = IMG / 4;
        let signal = prompts.sparse.flatten_all()?.to_vec1::<f32>()?[0];
        let row_means = image_embeddings.flatten(1, 3)?.mean(1)?.to_vec1::<f32>()?;

        let mut rows = Vec::with_capacity(b);
        for &mean in &row_means {
            let base = if signal > 0.0 || mean > 0.25 { 8.0f32 } else { -8.0 };
            let slots: Vec<Tensor> = (0..m)
                .map(|i| Tensor::full(base + i as f32, (1usize, 1, side, side), &self.device))
                .collect::<candle_core::Result<_>>()?;
            rows.push(Tensor::cat(&slots, 1)?);
        }
        let mask_logits = Tensor::cat(&rows, 0)?;

        let iou_row = if m == 3 {
            vec![0.2f32, 0.9, 0.4]
        } else {
            vec![0.9f32]
        };
        let iou_scores = Tensor::from_vec(iou_row, (1, m), &self.device)?
            .expand((b, m))?
            .contiguous()?;
        let mask_tokens = Tensor::zeros((b, m, DIM), DType::F32, &self.device)?;
        let object_score_logits = Tensor::full(self.score_logit.get(), (b, 1), &self.device)?;
        Ok(DecoderOutput {
            mask_logits,
            iou_scores,
            mask_tokens,
            object_score_logits,
        })
    }

    fn encode_memory(
        &self,
        pixel_features: &Tensor,
        mask_for_mem: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (b, _, h, w) = pixel_features.dims4()?;
        let presence = mask_for_mem.flatten(1, 3)?.mean(1)?.reshape((b, 1, 1, 1))?;
        let features = presence.expand((b, DIM, h, w))?.contiguous()?;
        let pos = Tensor::zeros((b, DIM, h, w), DType::F32, &self.device)?;
        Ok((features, pos))
    }

    fn fuse_memory(
        &self,
        current: &Tensor,
        _current_pos: &Tensor,
        memory: &Tensor,
        _memory_pos: &Tensor,
        _num_obj_ptr_tokens: usize,
    ) -> Result<Tensor> {
        self.fuse_calls.set(self.fuse_calls.get() + 1);
        Ok(current.broadcast_add(&memory.mean(0)?.unsqueeze(0)?)?)
    }

    fn no_memory_embedding(&self) -> Result<Tensor> {
        Ok(Tensor::zeros((1, 1, DIM), DType::F32, &self.device)?)
    }

    fn no_memory_pos_enc(&self) -> Result<Tensor> {
        Ok(Tensor::zeros((1, 1, DIM), DType::F32, &self.device)?)
    }

    fn temporal_pos_enc(&self, _slot: usize) -> Result<Tensor> {
        Ok(Tensor::zeros((1, 1, DIM), DType::F32, &self.device)?)
    }
}
