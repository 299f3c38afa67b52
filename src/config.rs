use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::video::ClipDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub tsne: TsneConfig,

    #[serde(default)]
    pub plot: PlotConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default = "default_clips")]
    pub clips: Vec<ClipDescriptor>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// ONNX export of the frame-stack network
    #[serde(default = "default_stack_model")]
    pub stack_model: PathBuf,

    /// ONNX export of the paired-sample network
    #[serde(default = "default_sample_model")]
    pub sample_model: PathBuf,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default)]
    pub device: DevicePreference,
}

fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("vidtsne/models")
}

fn default_stack_model() -> PathBuf {
    models_dir().join("stack.onnx")
}

fn default_sample_model() -> PathBuf {
    models_dir().join("sample.onnx")
}

fn default_intra_threads() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            stack_model: default_stack_model(),
            sample_model: default_sample_model(),
            intra_threads: default_intra_threads(),
            device: DevicePreference::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Side length frames are resized to after cropping
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,

    /// Consecutive frames concatenated into one sample
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

fn default_batch_size() -> usize {
    32
}

fn default_num_workers() -> usize {
    1
}

fn default_frame_size() -> u32 {
    128
}

fn default_stack_size() -> usize {
    4
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            frame_size: default_frame_size(),
            stack_size: default_stack_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Samples per audio window paired with a frame stack
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_sample_rate() -> u32 {
    2000
}

fn default_window() -> usize {
    512
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            window: default_window(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TsneInit {
    #[default]
    Pca,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsneConfig {
    #[serde(default = "default_perplexity")]
    pub perplexity: f64,

    #[serde(default = "default_early_exaggeration")]
    pub early_exaggeration: f64,

    /// Fixed learning rate; `None` picks max(N / exaggeration / 4, 50)
    #[serde(default)]
    pub learning_rate: Option<f64>,

    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    #[serde(default)]
    pub init: TsneInit,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_perplexity() -> f64 {
    30.0
}

fn default_early_exaggeration() -> f64 {
    12.0
}

fn default_max_iter() -> usize {
    1000
}

fn default_seed() -> u64 {
    0
}

impl Default for TsneConfig {
    fn default() -> Self {
        Self {
            perplexity: default_perplexity(),
            early_exaggeration: default_early_exaggeration(),
            learning_rate: None,
            max_iter: default_max_iter(),
            init: TsneInit::default(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    #[serde(default = "default_save")]
    pub save: bool,

    #[serde(default = "default_plot_path")]
    pub path: PathBuf,

    #[serde(default = "default_plot_size")]
    pub width: u32,

    #[serde(default = "default_plot_size")]
    pub height: u32,

    #[serde(default = "default_point_radius")]
    pub point_radius: u32,

    /// Also write the projected coordinates as CSV
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

fn default_save() -> bool {
    true
}

fn default_plot_path() -> PathBuf {
    PathBuf::from("tsne.png")
}

fn default_plot_size() -> u32 {
    800
}

fn default_point_radius() -> u32 {
    3
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            save: default_save(),
            path: default_plot_path(),
            width: default_plot_size(),
            height: default_plot_size(),
            point_radius: default_point_radius(),
            csv_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    #[default]
    Offline,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: TrackingMode,

    /// Root directory for offline runs
    #[serde(default = "default_runs_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub run_name: Option<String>,
}

fn default_runs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("vidtsne/runs")
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TrackingMode::default(),
            dir: default_runs_dir(),
            endpoint: None,
            api_key: None,
            run_name: None,
        }
    }
}

fn default_clips() -> Vec<ClipDescriptor> {
    [
        ("./data/6zXXZvVvTFs", (960, 1403), (35, 50, 445, 300)),
        ("./data/SuZVyOlgVek", (15, 437), (79, 18, 560, 360)),
        ("./data/2AYaxTiWKoY", (550, 1515), (0, 13, 640, 335)),
        ("./data/pF6xCZA72o0", (1465, 2201), (20, 3, 620, 360)),
    ]
    .into_iter()
    .map(|(filename, trim, crop)| ClipDescriptor::new(filename, trim, crop).with_frame_rate(15))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelConfig::default(),
            loader: LoaderConfig::default(),
            audio: AudioConfig::default(),
            tsne: TsneConfig::default(),
            plot: PlotConfig::default(),
            tracking: TrackingConfig::default(),
            clips: default_clips(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidtsne")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("VIDTSNE_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_evaluation_script() {
        let config = Config::default();
        assert_eq!(config.loader.batch_size, 32);
        assert_eq!(config.loader.num_workers, 1);
        assert_eq!(config.clips.len(), 4);
        assert_eq!(config.clips[1].trim, (15, 437));
        assert_eq!(config.clips[2].crop, (0, 13, 640, 335));
        assert_eq!(config.clips[3].frame_rate, Some(15));
        assert_eq!(config.plot.path, PathBuf::from("tsne.png"));
        assert!(!config.tracking.enabled);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [loader]
            batch_size = 8

            [tsne]
            init = "random"
            learning_rate = 100.0

            [[clips]]
            filename = "clip.mp4"
            trim = [0, 50]
            crop = [0, 0, 64, 64]
            "#,
        )
        .unwrap();

        assert_eq!(config.loader.batch_size, 8);
        assert_eq!(config.loader.stack_size, 4);
        assert_eq!(config.tsne.init, TsneInit::Random);
        assert_eq!(config.tsne.learning_rate, Some(100.0));
        assert_eq!(config.tsne.perplexity, 30.0);
        assert_eq!(config.clips.len(), 1);
        assert_eq!(config.clips[0].frame_rate, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.tracking.enabled = true;
        config.tracking.mode = TrackingMode::Http;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.tracking.enabled);
        assert_eq!(loaded.tracking.mode, TrackingMode::Http);
        assert_eq!(loaded.clips, config.clips);
    }
}
