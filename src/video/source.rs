//! Frame and audio decoding.
//!
//! A clip's `filename` is either a directory of extracted frames or a video
//! file. Video files are decoded through the `ffmpeg` binary, which applies
//! resampling, trimming, cropping and scaling in one filter graph and writes
//! raw RGB frames to stdout.

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use super::clip::{ClipDescriptor, ClipError};

/// Audio track stored next to extracted frames
pub const FRAME_DIR_AUDIO: &str = "audio.wav";

/// Frame rate assumed for frame directories without an explicit rate
pub const DEFAULT_FRAME_RATE: f64 = 15.0;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Decode the trimmed, cropped and resized frames of a clip
pub fn decode_frames(clip: &ClipDescriptor, frame_size: u32) -> Result<Vec<RgbImage>> {
    clip.validate()?;

    if clip.path().is_dir() {
        decode_frame_dir(clip, frame_size)
    } else if clip.path().is_file() {
        decode_video_file(clip, frame_size)
    } else {
        Err(ClipError::NotFound(clip.filename.clone()).into())
    }
}

/// Decode the clip's audio as mono samples at `sample_rate`. A clip without an
/// audio track yields an empty buffer.
pub fn decode_audio(clip: &ClipDescriptor, sample_rate: u32) -> Result<Vec<f32>> {
    let path = if clip.path().is_dir() {
        let audio = clip.path().join(FRAME_DIR_AUDIO);
        if !audio.is_file() {
            return Ok(Vec::new());
        }
        audio
    } else if clip.path().is_file() {
        clip.filename.clone()
    } else {
        return Err(ClipError::NotFound(clip.filename.clone()).into());
    };

    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-nostdin", "-i"])
        .arg(&path)
        .args(["-vn", "-ac", "1", "-ar"])
        .arg(sample_rate.to_string())
        .args(["-f", "f32le", "-"])
        .output()
        .context("Failed to run ffmpeg (is it installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not contain any stream") {
            tracing::debug!(path = ?path, "No audio stream, using silence");
            return Ok(Vec::new());
        }
        bail!("ffmpeg failed to decode audio from {}: {}", path.display(), stderr.trim());
    }

    Ok(output
        .stdout
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Frame rate at which the decoded frames are sampled
pub fn frame_rate(clip: &ClipDescriptor) -> Result<f64> {
    if let Some(rate) = clip.frame_rate {
        return Ok(rate as f64);
    }
    if clip.path().is_dir() {
        return Ok(DEFAULT_FRAME_RATE);
    }
    probe_frame_rate(clip.path())
}

/// Sorted image files directly inside a frame directory
pub fn discover_frames(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();

    for entry in WalkDir::new(directory)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if path.is_file() {
            if let Some(ext) = path.extension() {
                let ext_lower = ext.to_string_lossy().to_lowercase();
                if IMAGE_EXTENSIONS.contains(&ext_lower.as_str()) {
                    frames.push(path.to_path_buf());
                }
            }
        }
    }

    frames.sort();

    Ok(frames)
}

fn decode_frame_dir(clip: &ClipDescriptor, frame_size: u32) -> Result<Vec<RgbImage>> {
    let frames = discover_frames(clip.path())?;
    let start = clip.trim.0.min(frames.len());
    let end = clip.trim.1.min(frames.len());
    let (x0, y0, _, _) = clip.crop;

    tracing::debug!(
        clip = %clip.label(),
        available = frames.len(),
        selected = end - start,
        "Decoding frame directory"
    );

    frames[start..end]
        .par_iter()
        .map(|path| -> Result<RgbImage> {
            let img = image::open(path)
                .with_context(|| format!("Failed to load frame {}", path.display()))?;
            clip.check_crop_bounds(img.width(), img.height())?;
            let cropped = img.crop_imm(x0, y0, clip.crop_width(), clip.crop_height());
            Ok(cropped
                .resize_exact(frame_size, frame_size, FilterType::Triangle)
                .to_rgb8())
        })
        .collect()
}

fn decode_video_file(clip: &ClipDescriptor, frame_size: u32) -> Result<Vec<RgbImage>> {
    let filter = video_filter(clip, frame_size);
    tracing::debug!(clip = %clip.label(), filter = %filter, "Decoding video with ffmpeg");

    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-nostdin", "-i"])
        .arg(clip.path())
        .args(["-an", "-vf"])
        .arg(&filter)
        .args(["-fps_mode", "passthrough", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
        .output()
        .context("Failed to run ffmpeg (is it installed?)")?;

    if !output.status.success() {
        bail!(
            "ffmpeg failed to decode {}: {}",
            clip.path().display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let frame_bytes = (frame_size * frame_size * 3) as usize;
    if output.stdout.len() % frame_bytes != 0 {
        bail!(
            "ffmpeg returned {} bytes, not a multiple of the {} byte frame size",
            output.stdout.len(),
            frame_bytes
        );
    }

    output
        .stdout
        .chunks_exact(frame_bytes)
        .map(|raw| {
            RgbImage::from_raw(frame_size, frame_size, raw.to_vec())
                .ok_or_else(|| anyhow!("Failed to build frame from raw buffer"))
        })
        .collect()
}

fn video_filter(clip: &ClipDescriptor, frame_size: u32) -> String {
    let mut filters = Vec::new();
    if let Some(rate) = clip.frame_rate {
        filters.push(format!("fps={}", rate));
    }
    // Frame numbers count after resampling
    filters.push(format!(
        "select='between(n\\,{}\\,{})'",
        clip.trim.0,
        clip.trim.1 - 1
    ));
    let (x0, y0, _, _) = clip.crop;
    filters.push(format!(
        "crop={}:{}:{}:{}",
        clip.crop_width(),
        clip.crop_height(),
        x0,
        y0
    ));
    filters.push(format!("scale={}:{}:flags=bilinear", frame_size, frame_size));
    filters.join(",")
}

fn probe_frame_rate(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .context("Failed to run ffprobe (is it installed?)")?;

    if !output.status.success() {
        bail!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_rate(String::from_utf8_lossy(&output.stdout).trim())
}

/// Parse an ffprobe rational such as `30000/1001` or a plain number
fn parse_rate(text: &str) -> Result<f64> {
    let rate = match text.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse()?;
            let den: f64 = den.trim().parse()?;
            if den == 0.0 {
                bail!("Frame rate has zero denominator: {}", text);
            }
            num / den
        }
        None => text.parse::<f64>()?,
    };

    if rate <= 0.0 {
        bail!("Invalid frame rate: {}", text);
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::fs::File;
    use tempfile::tempdir;

    fn write_frames(dir: &Path, count: usize, width: u32, height: u32) {
        for i in 0..count {
            let img = RgbImage::from_pixel(width, height, Rgb([i as u8, 100, 200]));
            img.save(dir.join(format!("frame_{:05}.png", i))).unwrap();
        }
    }

    #[test]
    fn test_discover_frames_sorted() {
        let dir = tempdir().unwrap();
        write_frames(dir.path(), 3, 4, 4);
        File::create(dir.path().join("notes.txt")).unwrap();

        let frames = discover_frames(dir.path()).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].ends_with("frame_00000.png"));
        assert!(frames[2].ends_with("frame_00002.png"));
    }

    #[test]
    fn test_decode_frame_dir_trims_and_resizes() {
        let dir = tempdir().unwrap();
        write_frames(dir.path(), 10, 32, 24);

        let clip = ClipDescriptor::new(dir.path(), (2, 6), (0, 0, 16, 16));
        let frames = decode_frames(&clip, 8).unwrap();

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].dimensions(), (8, 8));
        assert_eq!(frames[0].get_pixel(0, 0), &Rgb([2, 100, 200]));
        assert_eq!(frames[3].get_pixel(7, 7), &Rgb([5, 100, 200]));
    }

    #[test]
    fn test_trim_past_end_is_clamped() {
        let dir = tempdir().unwrap();
        write_frames(dir.path(), 5, 8, 8);

        let clip = ClipDescriptor::new(dir.path(), (3, 50), (0, 0, 8, 8));
        assert_eq!(decode_frames(&clip, 4).unwrap().len(), 2);

        let clip = ClipDescriptor::new(dir.path(), (10, 50), (0, 0, 8, 8));
        assert!(decode_frames(&clip, 4).unwrap().is_empty());
    }

    #[test]
    fn test_crop_outside_frame_fails() {
        let dir = tempdir().unwrap();
        write_frames(dir.path(), 2, 8, 8);

        let clip = ClipDescriptor::new(dir.path(), (0, 2), (0, 0, 16, 16));
        let err = decode_frames(&clip, 4).unwrap_err();
        assert!(err.downcast_ref::<ClipError>().is_some());
    }

    #[test]
    fn test_missing_source() {
        let clip = ClipDescriptor::new("/nonexistent/clip.mp4", (0, 2), (0, 0, 16, 16));
        let err = decode_frames(&clip, 4).unwrap_err();
        assert!(matches!(err.downcast_ref::<ClipError>(), Some(ClipError::NotFound(_))));
    }

    #[test]
    fn test_frame_dir_without_audio_is_silent() {
        let dir = tempdir().unwrap();
        write_frames(dir.path(), 2, 8, 8);

        let clip = ClipDescriptor::new(dir.path(), (0, 2), (0, 0, 8, 8));
        assert!(decode_audio(&clip, 2000).unwrap().is_empty());
        assert_eq!(frame_rate(&clip).unwrap(), DEFAULT_FRAME_RATE);
        assert_eq!(frame_rate(&clip.clone().with_frame_rate(30)).unwrap(), 30.0);
    }

    #[test]
    fn test_video_filter() {
        let clip =
            ClipDescriptor::new("v.mp4", (960, 1403), (35, 50, 445, 300)).with_frame_rate(15);
        assert_eq!(
            video_filter(&clip, 128),
            "fps=15,select='between(n\\,960\\,1402)',crop=410:250:35:50,scale=128:128:flags=bilinear"
        );
    }

    #[test]
    fn test_parse_rate() {
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25").unwrap(), 25.0);
        assert!(parse_rate("1/0").is_err());
        assert!(parse_rate("abc").is_err());
    }
}
