use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while validating or decoding a clip
#[derive(Debug, Error)]
pub enum ClipError {
    #[error("invalid trim range {start}..{end} (start must be below end)")]
    InvalidTrim { start: usize, end: usize },

    #[error("invalid crop box ({x0}, {y0}, {x1}, {y1}) (x0 < x1 and y0 < y1 required)")]
    InvalidCrop { x0: u32, y0: u32, x1: u32, y1: u32 },

    #[error("crop box ({x0}, {y0}, {x1}, {y1}) exceeds {width}x{height} frame")]
    CropOutOfBounds {
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        width: u32,
        height: u32,
    },

    #[error("video source not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("clip {0} produced no samples")]
    EmptyClip(String),
}

/// A video, the frame range to use and the region of each frame to keep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipDescriptor {
    /// Video file, or directory of extracted frames
    pub filename: PathBuf,

    /// Half-open frame index range
    pub trim: (usize, usize),

    /// Crop box as (x0, y0, x1, y1) in source pixels
    pub crop: (u32, u32, u32, u32),

    /// Resample the video to this rate before trimming
    #[serde(default)]
    pub frame_rate: Option<u32>,
}

impl ClipDescriptor {
    pub fn new(
        filename: impl Into<PathBuf>,
        trim: (usize, usize),
        crop: (u32, u32, u32, u32),
    ) -> Self {
        Self {
            filename: filename.into(),
            trim,
            crop,
            frame_rate: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn validate(&self) -> Result<(), ClipError> {
        let (start, end) = self.trim;
        if start >= end {
            return Err(ClipError::InvalidTrim { start, end });
        }

        let (x0, y0, x1, y1) = self.crop;
        if x0 >= x1 || y0 >= y1 {
            return Err(ClipError::InvalidCrop { x0, y0, x1, y1 });
        }

        Ok(())
    }

    /// Check the crop box against decoded frame dimensions
    pub fn check_crop_bounds(&self, width: u32, height: u32) -> Result<(), ClipError> {
        let (x0, y0, x1, y1) = self.crop;
        if x1 > width || y1 > height {
            return Err(ClipError::CropOutOfBounds {
                x0,
                y0,
                x1,
                y1,
                width,
                height,
            });
        }
        Ok(())
    }

    pub fn crop_width(&self) -> u32 {
        self.crop.2 - self.crop.0
    }

    pub fn crop_height(&self) -> u32 {
        self.crop.3 - self.crop.1
    }

    pub fn path(&self) -> &Path {
        &self.filename
    }

    /// Short label for logs and plot exports
    pub fn label(&self) -> String {
        self.filename
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filename.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let clip = ClipDescriptor::new("a.mp4", (0, 200), (0, 0, 140, 140));
        assert!(clip.validate().is_ok());
        assert_eq!(clip.crop_width(), 140);

        let clip = ClipDescriptor::new("a.mp4", (10, 10), (0, 0, 140, 140));
        assert!(matches!(clip.validate(), Err(ClipError::InvalidTrim { .. })));

        let clip = ClipDescriptor::new("a.mp4", (0, 10), (50, 0, 40, 140));
        assert!(matches!(clip.validate(), Err(ClipError::InvalidCrop { .. })));
    }

    #[test]
    fn test_crop_bounds() {
        let clip = ClipDescriptor::new("a.mp4", (0, 10), (0, 13, 640, 335));
        assert!(clip.check_crop_bounds(640, 360).is_ok());
        assert!(matches!(
            clip.check_crop_bounds(320, 240),
            Err(ClipError::CropOutOfBounds { width: 320, .. })
        ));
    }

    #[test]
    fn test_label() {
        let clip = ClipDescriptor::new("./videos/2AYaxTiWKoY.mp4", (0, 10), (0, 0, 1, 1));
        assert_eq!(clip.label(), "2AYaxTiWKoY");
        let clip = ClipDescriptor::new("./data/6zXXZvVvTFs", (0, 10), (0, 0, 1, 1));
        assert_eq!(clip.label(), "6zXXZvVvTFs");
    }
}
