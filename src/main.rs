//! vidtsne: embed video clips with a pair of networks and plot a joint t-SNE.
//!
//! ## Usage
//!
//! ```bash
//! vidtsne                    # Plot the configured clips to tsne.png
//! vidtsne --track --no-save  # Log the plot to the tracker only
//! ```

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use vidtsne::config::Config;
use vidtsne::device::Device;
use vidtsne::embedding::{tsne_loaders, EmbeddingPipeline};
use vidtsne::evaluate::plot_tsne;
use vidtsne::logging;
use vidtsne::models::OnnxEncoder;
use vidtsne::tracking::{start_tracker, ExperimentTracker};
use vidtsne::tsne::Tsne;

/// Command line overrides
#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    no_save: bool,
    track: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("vidtsne {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--no-save" => {
                parsed.no_save = true;
            }
            "--track" => {
                parsed.track = true;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"vidtsne - t-SNE evaluation of video embedding networks

USAGE:
    vidtsne [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --no-save           Do not write the plot image
    --track             Log the plot to the configured experiment tracker
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    VIDTSNE_CONFIG      Path to config file (overrides default location)
    VIDTSNE_LOG         Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/vidtsne/config.toml

Decoding video files needs ffmpeg and ffprobe on PATH."#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    // Journald on Linux, file fallback otherwise
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let mut config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    if args.no_save {
        config.plot.save = false;
    }
    if args.track {
        config.tracking.enabled = true;
    }

    let mut tracker = start_tracker(&config.tracking)?;

    let device = Device::select(config.models.device)?;
    info!(device = %device, "Selected device");

    let stack_net = OnnxEncoder::load(
        "stack",
        &config.models.stack_model,
        device,
        config.models.intra_threads,
    )?;
    let sample_net = OnnxEncoder::load(
        "sample",
        &config.models.sample_model,
        device,
        config.models.intra_threads,
    )?;

    let loaders = tsne_loaders(&config.clips, &config.loader, &config.audio)?;
    let pipeline = EmbeddingPipeline::new(&stack_net, &sample_net);
    let clips = pipeline.embed_clips(&loaders)?;

    let tsne = Tsne::from(&config.tsne);
    let tracker = tracker
        .as_mut()
        .map(|t| t.as_mut() as &mut dyn ExperimentTracker);
    let result = plot_tsne(&clips, &tsne, &config.plot, tracker)?;

    info!(
        clips = result.offsets.len() - 1,
        points = result.points.nrows(),
        "t-SNE evaluation finished"
    );
    Ok(())
}
