//! Frame access for a tracking session.
//!
//! Sessions read frames one at a time through [`FrameSource`], so a video
//! can live wherever the application wants: on disk as an image folder, or
//! in memory as a pre-decoded tensor. Sources report the native video
//! resolution; the session uses it to scale prompts in and masks out.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::GenericImageView;
use log::debug;

use crate::error::{Error, Result};
use crate::preprocess_image;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Supplies preprocessed frames to the session on demand.
pub trait FrameSource {
    /// Frame `index` as a `[1, 3, H, W]` model-input tensor on `device`.
    /// `target_size` is the model's (width, height) input size.
    fn get_frame(&self, index: usize, target_size: (usize, usize), device: &Device) -> Result<Tensor>;

    /// Native (width, height) of the video.
    fn frame_size(&self) -> (usize, usize);

    fn total_frames(&self) -> usize;
}

/// Reads frames lazily from a directory of image files, ordered by file
/// name. Every image must share the dimensions of the first one.
pub struct ImageDirSource {
    image_paths: Vec<PathBuf>,
    native_width: u32,
    native_height: u32,
}

impl ImageDirSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut image_paths: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        image_paths.sort();
        let first = image_paths.first().ok_or_else(|| {
            Error::InvalidArgument(format!("no image files found in {:?}", dir.as_ref()))
        })?;
        let (native_width, native_height) = image::open(first)?.dimensions();
        debug!(
            "image source: {} frames at {}x{} from {:?}",
            image_paths.len(),
            native_width,
            native_height,
            dir.as_ref()
        );
        Ok(Self {
            image_paths,
            native_width,
            native_height,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn get_frame(&self, index: usize, target_size: (usize, usize), device: &Device) -> Result<Tensor> {
        let path = self.image_paths.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "frame index {index} out of range ({} frames)",
                self.image_paths.len()
            ))
        })?;
        let img = image::open(path)?;
        let (w, h) = img.dimensions();
        if (w, h) != (self.native_width, self.native_height) {
            return Err(Error::InvalidArgument(format!(
                "frame {index} is {w}x{h} but the video is {}x{}",
                self.native_width, self.native_height
            )));
        }
        preprocess_image(&img, target_size.0 as u32, target_size.1 as u32, device)
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.native_width as usize, self.native_height as usize)
    }

    fn total_frames(&self) -> usize {
        self.image_paths.len()
    }
}

/// Frames already decoded and preprocessed into one `[N, 3, S, S]` tensor.
///
/// The tensor is expected at the model input size with per-channel
/// normalization applied, so `target_size` is not consulted. Keep the
/// tensor on the CPU to trade transfer time for device memory; frames move
/// to the compute device as they are requested.
pub struct TensorFrames {
    frames: Tensor,
    native_width: usize,
    native_height: usize,
}

impl TensorFrames {
    pub fn new(frames: Tensor, native_size: (usize, usize)) -> Result<Self> {
        let dims = frames.dims();
        if dims.len() != 4 || dims[1] != 3 {
            return Err(Error::InvalidArgument(format!(
                "frames tensor must be [N, 3, H, W], got shape {dims:?}"
            )));
        }
        Ok(Self {
            frames,
            native_width: native_size.0,
            native_height: native_size.1,
        })
    }
}

impl FrameSource for TensorFrames {
    fn get_frame(&self, index: usize, _target_size: (usize, usize), device: &Device) -> Result<Tensor> {
        if index >= self.total_frames() {
            return Err(Error::InvalidArgument(format!(
                "frame index {index} out of range ({} frames)",
                self.total_frames()
            )));
        }
        Ok(self.frames.get(index)?.unsqueeze(0)?.to_device(device)?)
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.native_width, self.native_height)
    }

    fn total_frames(&self) -> usize {
        self.frames.dims()[0]
    }
}

/// A session's fixed view of its video: the source plus cached geometry.
pub struct FrameStore {
    source: Box<dyn FrameSource>,
    num_frames: usize,
    video_width: usize,
    video_height: usize,
}

impl FrameStore {
    pub fn new(source: Box<dyn FrameSource>) -> Result<Self> {
        let num_frames = source.total_frames();
        if num_frames == 0 {
            return Err(Error::InvalidArgument("video has no frames".into()));
        }
        let (video_width, video_height) = source.frame_size();
        if video_width == 0 || video_height == 0 {
            return Err(Error::InvalidArgument(format!(
                "video reports an empty frame size {video_width}x{video_height}"
            )));
        }
        Ok(Self {
            source,
            num_frames,
            video_width,
            video_height,
        })
    }

    pub fn get_frame(&self, index: usize, image_size: usize, device: &Device) -> Result<Tensor> {
        self.check_frame(index)?;
        self.source.get_frame(index, (image_size, image_size), device)
    }

    pub fn check_frame(&self, index: usize) -> Result<()> {
        if index >= self.num_frames {
            return Err(Error::InvalidArgument(format!(
                "frame index {index} out of range ({} frames)",
                self.num_frames
            )));
        }
        Ok(())
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn video_width(&self) -> usize {
        self.video_width
    }

    pub fn video_height(&self) -> usize {
        self.video_height
    }
}
