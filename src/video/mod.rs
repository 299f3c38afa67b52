//! Video clips and the datasets built over them.
//!
//! - `clip`: clip descriptors (file, trim range, crop box, frame rate)
//! - `source`: frame and audio decoding from frame directories or video files
//! - `dataset`: frame-stack datasets consumed by the batched loader

mod clip;
mod dataset;
pub mod source;

pub use clip::{ClipDescriptor, ClipError};
pub use dataset::{FrameOptions, VideoAudioDataset, VideoDataset};
