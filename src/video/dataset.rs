//! Frame-stack datasets over a single clip.

use anyhow::{bail, Result};
use image::RgbImage;
use ndarray::{stack, Array1, Array2, Array3, Array4, ArrayView1, ArrayView3, Axis};

use super::clip::ClipDescriptor;
use super::source;
use crate::config::{AudioConfig, LoaderConfig};
use crate::loader::Dataset;

/// Frame parameters shared by both datasets
#[derive(Debug, Clone, Copy)]
pub struct FrameOptions {
    pub frame_size: u32,
    pub stack_size: usize,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            frame_size: 128,
            stack_size: 4,
        }
    }
}

impl From<&LoaderConfig> for FrameOptions {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            frame_size: config.frame_size,
            stack_size: config.stack_size,
        }
    }
}

/// Stacks of consecutive frames from one clip.
///
/// Item `i` is a `(3 * stack_size, frame_size, frame_size)` tensor holding
/// frames `i..i + stack_size` with RGB values scaled to `[0, 1]`.
pub struct VideoDataset {
    frames: Vec<RgbImage>,
    options: FrameOptions,
}

impl VideoDataset {
    pub fn open(clip: &ClipDescriptor, options: FrameOptions) -> Result<Self> {
        let frames = source::decode_frames(clip, options.frame_size)?;
        tracing::info!(clip = %clip.label(), frames = frames.len(), "Loaded video frames");
        Self::from_frames(frames, options)
    }

    /// Every frame must already be `frame_size` square.
    pub fn from_frames(frames: Vec<RgbImage>, options: FrameOptions) -> Result<Self> {
        if options.stack_size == 0 {
            bail!("Stack size must be positive");
        }
        let size = options.frame_size;
        if let Some((i, frame)) = frames
            .iter()
            .enumerate()
            .find(|(_, f)| f.dimensions() != (size, size))
        {
            bail!(
                "Frame {} is {}x{}, expected {}x{}",
                i,
                frame.width(),
                frame.height(),
                size,
                size
            );
        }
        Ok(Self { frames, options })
    }

    fn frame_stack(&self, index: usize) -> Result<Array3<f32>> {
        if index >= self.len() {
            bail!("Index {} out of range for dataset of {} stacks", index, self.len());
        }

        let size = self.options.frame_size as usize;
        let mut out = Array3::<f32>::zeros((3 * self.options.stack_size, size, size));

        let stack = &self.frames[index..index + self.options.stack_size];
        for (k, frame) in stack.iter().enumerate() {
            for (x, y, pixel) in frame.enumerate_pixels() {
                for c in 0..3 {
                    out[[3 * k + c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
                }
            }
        }

        Ok(out)
    }
}

impl Dataset for VideoDataset {
    type Item = Array3<f32>;
    type Batch = Array4<f32>;

    fn len(&self) -> usize {
        (self.frames.len() + 1).saturating_sub(self.options.stack_size)
    }

    fn get(&self, index: usize) -> Result<Array3<f32>> {
        self.frame_stack(index)
    }

    fn collate(items: Vec<Array3<f32>>) -> Result<Array4<f32>> {
        let views: Vec<ArrayView3<f32>> = items.iter().map(|a| a.view()).collect();
        Ok(stack(Axis(0), &views[..])?)
    }
}

/// Frame stacks paired with the audio window starting at the first frame.
pub struct VideoAudioDataset {
    video: VideoDataset,
    audio: Vec<f32>,
    /// Audio sample offset of frame 0 of the trimmed clip
    audio_offset: f64,
    /// Audio samples per video frame
    samples_per_frame: f64,
    window: usize,
}

impl VideoAudioDataset {
    pub fn open(clip: &ClipDescriptor, options: FrameOptions, audio: &AudioConfig) -> Result<Self> {
        let video = VideoDataset::open(clip, options)?;
        let samples = source::decode_audio(clip, audio.sample_rate)?;
        let frame_rate = source::frame_rate(clip)?;

        if samples.is_empty() {
            tracing::warn!(clip = %clip.label(), "Clip has no audio, pairing frames with silence");
        }

        let samples_per_frame = audio.sample_rate as f64 / frame_rate;
        Ok(Self {
            video,
            audio: samples,
            audio_offset: clip.trim.0 as f64 * samples_per_frame,
            samples_per_frame,
            window: audio.window,
        })
    }

    pub fn from_parts(
        video: VideoDataset,
        audio: Vec<f32>,
        audio_offset: f64,
        samples_per_frame: f64,
        window: usize,
    ) -> Self {
        Self {
            video,
            audio,
            audio_offset,
            samples_per_frame,
            window,
        }
    }

    fn audio_window(&self, index: usize) -> Array1<f32> {
        let start = (self.audio_offset + index as f64 * self.samples_per_frame).round() as usize;
        let mut window = Array1::<f32>::zeros(self.window);
        if start < self.audio.len() {
            let end = (start + self.window).min(self.audio.len());
            window
                .slice_mut(ndarray::s![..end - start])
                .assign(&ArrayView1::from(&self.audio[start..end]));
        }
        window
    }
}

impl Dataset for VideoAudioDataset {
    type Item = (Array3<f32>, Array1<f32>);
    type Batch = (Array4<f32>, Array2<f32>);

    fn len(&self) -> usize {
        self.video.len()
    }

    fn get(&self, index: usize) -> Result<Self::Item> {
        let frames = self.video.get(index)?;
        Ok((frames, self.audio_window(index)))
    }

    fn collate(items: Vec<Self::Item>) -> Result<Self::Batch> {
        let stacks: Vec<ArrayView3<f32>> = items.iter().map(|(s, _)| s.view()).collect();
        let samples: Vec<ArrayView1<f32>> = items.iter().map(|(_, a)| a.view()).collect();
        Ok((stack(Axis(0), &stacks[..])?, stack(Axis(0), &samples[..])?))
    }
}
