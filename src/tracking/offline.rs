use anyhow::{Context, Result};
use image::RgbImage;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{encode_png, sha256_hex, ExperimentTracker, LogRecord};

const HISTORY_FILE: &str = "history.jsonl";

/// Logs into `<root>/<run>/`: images under `media/`, one JSON line per
/// artifact in `history.jsonl`.
pub struct OfflineTracker {
    run: String,
    run_dir: PathBuf,
    steps: HashMap<String, u64>,
}

impl OfflineTracker {
    pub fn create(root: &Path, run: &str) -> Result<Self> {
        let run_dir = root.join(run);
        fs::create_dir_all(run_dir.join("media"))
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

        tracing::info!(run = %run, dir = ?run_dir, "Offline tracking run");

        Ok(Self {
            run: run.to_string(),
            run_dir,
            steps: HashMap::new(),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl ExperimentTracker for OfflineTracker {
    fn log_image(&mut self, key: &str, image: &RgbImage) -> Result<()> {
        let step = self.steps.entry(key.to_string()).or_insert(0);
        let current = *step;
        *step += 1;

        let png = encode_png(image)?;
        let relative = PathBuf::from("media").join(format!("{}-{}.png", file_safe(key), current));
        fs::write(self.run_dir.join(&relative), &png)?;

        let record = LogRecord {
            run: &self.run,
            step: current,
            key,
            sha256: sha256_hex(&png),
            timestamp: chrono::Local::now(),
        };
        let mut line = serde_json::to_value(&record)?;
        line["path"] = serde_json::Value::String(relative.to_string_lossy().into_owned());

        let mut history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join(HISTORY_FILE))?;
        writeln!(history, "{}", line)?;

        tracing::info!(key = %key, step = current, path = ?relative, "Logged image");
        Ok(())
    }

    fn run_name(&self) -> &str {
        &self.run
    }
}

fn file_safe(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn test_log_image_writes_media_and_history() {
        let dir = tempdir().unwrap();
        let mut tracker = OfflineTracker::create(dir.path(), "run-1").unwrap();
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));

        tracker.log_image("t-SNE", &image).unwrap();
        tracker.log_image("t-SNE", &image).unwrap();

        let run_dir = dir.path().join("run-1");
        assert!(run_dir.join("media/t-SNE-0.png").is_file());
        assert!(run_dir.join("media/t-SNE-1.png").is_file());

        let reloaded = image::open(run_dir.join("media/t-SNE-0.png")).unwrap().to_rgb8();
        assert_eq!(reloaded, image);

        let history = fs::read_to_string(run_dir.join(HISTORY_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = history
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "t-SNE");
        assert_eq!(lines[1]["step"], 1);
        assert_eq!(lines[0]["run"], "run-1");
        assert_eq!(lines[0]["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("t-SNE"), "t-SNE");
        assert_eq!(file_safe("eval/t SNE"), "eval_t_SNE");
    }
}
