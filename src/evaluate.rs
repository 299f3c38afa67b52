//! Joint projection and plotting of per-clip embeddings.

use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::Array2;

use crate::config::PlotConfig;
use crate::embedding::{join_embeddings, ClipEmbeddings};
use crate::plot::{export_csv, split_by_offsets, ScatterPlot};
use crate::tracking::{ExperimentTracker, TSNE_KEY};
use crate::tsne::Tsne;

/// What a t-SNE plot run produced
#[derive(Debug)]
pub struct TsnePlot {
    /// 2D points, rows in clip order
    pub points: Array2<f64>,
    /// Clip `i` owns rows `offsets[i]..offsets[i + 1]`
    pub offsets: Vec<usize>,
    pub image: RgbImage,
}

/// Run t-SNE jointly over every clip so all points share one coordinate
/// space, then scatter-plot each clip in its own colour. The plot is saved
/// when `plot.save` is set and logged under `t-SNE` when a tracker is given.
pub fn plot_tsne(
    clips: &[ClipEmbeddings],
    tsne: &Tsne,
    plot: &PlotConfig,
    tracker: Option<&mut dyn ExperimentTracker>,
) -> Result<TsnePlot> {
    let (embeds, offsets) = join_embeddings(clips)?;
    let points = tsne.fit_transform(&embeds)?;

    let labels: Vec<String> = clips.iter().map(|c| c.label.clone()).collect();
    let groups = split_by_offsets(&points, &offsets);
    let image = ScatterPlot::from(plot).render(&labels, &groups)?;

    if plot.save {
        image
            .save(&plot.path)
            .with_context(|| format!("Failed to save plot to {}", plot.path.display()))?;
        tracing::info!(path = ?plot.path, "Saved t-SNE plot");
    }

    if let Some(csv_path) = &plot.csv_path {
        let rows = export_csv(csv_path, &labels, &groups)?;
        tracing::info!(path = ?csv_path, rows, "Exported t-SNE coordinates");
    }

    if let Some(tracker) = tracker {
        tracker.log_image(TSNE_KEY, &image)?;
    }

    Ok(TsnePlot {
        points,
        offsets,
        image,
    })
}
