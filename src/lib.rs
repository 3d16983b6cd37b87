//! Interactive multi-object video segmentation on top of a promptable
//! mask model.
//!
//! The crate separates the neural network from the temporal logic: any
//! implementation of [`TrackerModel`] (feature extractor, prompt encoder,
//! mask decoder, memory encoder, memory fusion) can be driven by
//! [`VideoTracker`], which owns prompting, cross-object consolidation,
//! the temporal memory window and propagation through the video. Session
//! state lives in [`Session`] so one tracker can serve many videos.

pub mod config;
pub mod error;
pub mod frames;
mod interpolate;
pub mod model;
pub mod session;
pub mod tracker;

use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array3, Axis};

pub use config::TrackerConfig;
pub use error::{Error, Result};
pub use frames::{FrameSource, ImageDirSource, TensorFrames};
pub use model::{BackboneFeatures, DecoderOutput, PointPrompts, PromptEmbeddings, TrackerModel};
pub use session::inputs::{BoxPrompt, PointLabel};
pub use session::outputs::NO_OBJ_SCORE;
pub use session::Session;
pub use tracker::{FrameMasks, ObjectMask, Propagation, VideoTracker};

pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize a frame to the model input size and normalize it with the
/// ImageNet statistics, returning `[1, 3, height, width]`.
fn preprocess_image(
    img: &DynamicImage,
    width: u32,
    height: u32,
    device: &Device,
) -> Result<Tensor> {
    let resized = img.resize_exact(width, height, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        array[[0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        array[[1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        array[[2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }
    for channel in 0..3 {
        let mut view = array.index_axis_mut(Axis(0), channel);
        view.mapv_inplace(|v| (v - IMAGE_MEAN[channel]) / IMAGE_STD[channel]);
    }

    let data: Vec<f32> = array.into_iter().collect();
    Ok(Tensor::from_vec(
        data,
        (1, 3, height as usize, width as usize),
        device,
    )?)
}
