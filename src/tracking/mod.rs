//! Experiment tracking.
//!
//! Plots are logged under a key (the evaluation uses `t-SNE`) to either an
//! offline run directory or an HTTP collector.

mod http;
mod offline;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Cursor;

use crate::config::{TrackingConfig, TrackingMode};

pub use http::HttpTracker;
pub use offline::OfflineTracker;

/// Key the evaluation plot is logged under
pub const TSNE_KEY: &str = "t-SNE";

pub trait ExperimentTracker {
    /// Log an image under `key`. Repeated keys get increasing steps.
    fn log_image(&mut self, key: &str, image: &RgbImage) -> Result<()>;

    /// Name of the run being logged to
    fn run_name(&self) -> &str;
}

/// Create the tracker selected by the configuration
pub fn create_tracker(config: &TrackingConfig) -> Result<Box<dyn ExperimentTracker>> {
    let run = config
        .run_name
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("run-%Y%m%d-%H%M%S").to_string());

    match config.mode {
        TrackingMode::Offline => Ok(Box::new(OfflineTracker::create(&config.dir, &run)?)),
        TrackingMode::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow!("HTTP tracking needs tracking.endpoint"))?;
            Ok(Box::new(HttpTracker::new(endpoint, config.api_key.as_deref(), &run)))
        }
    }
}

/// The configured tracker, or `None` when tracking is disabled. Called
/// before inference so a bad tracking section fails the run up front.
pub fn start_tracker(config: &TrackingConfig) -> Result<Option<Box<dyn ExperimentTracker>>> {
    if !config.enabled {
        return Ok(None);
    }
    create_tracker(config)
        .map(Some)
        .context("Failed to start experiment tracker")
}

/// One logged artifact
#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    run: &'a str,
    step: u64,
    key: &'a str,
    sha256: String,
    timestamp: chrono::DateTime<chrono::Local>,
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| anyhow!("Failed to encode image as PNG: {}", e))?;
    Ok(buf.into_inner())
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_offline_tracker() {
        let dir = tempdir().unwrap();
        let config = TrackingConfig {
            enabled: true,
            dir: dir.path().to_path_buf(),
            run_name: Some("eval".to_string()),
            ..Default::default()
        };
        let tracker = create_tracker(&config).unwrap();
        assert_eq!(tracker.run_name(), "eval");
        assert!(dir.path().join("eval").is_dir());
    }

    #[test]
    fn test_start_tracker_disabled() {
        let dir = tempdir().unwrap();
        let config = TrackingConfig {
            enabled: false,
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(start_tracker(&config).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_start_tracker_rejects_missing_endpoint() {
        let config = TrackingConfig {
            enabled: true,
            mode: TrackingMode::Http,
            endpoint: None,
            ..Default::default()
        };
        let err = start_tracker(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("tracking.endpoint"));
    }

    #[test]
    fn test_http_requires_endpoint() {
        let config = TrackingConfig {
            mode: TrackingMode::Http,
            ..Default::default()
        };
        assert!(create_tracker(&config).is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
