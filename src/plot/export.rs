use anyhow::{bail, Result};
use ndarray::ArrayView2;
use std::path::Path;

/// Write projected coordinates as `clip,index,x,y` rows, index counting
/// samples within each clip.
pub fn export_csv(
    output_path: &Path,
    labels: &[String],
    groups: &[ArrayView2<f64>],
) -> Result<usize> {
    if labels.len() != groups.len() {
        bail!("{} labels for {} point groups", labels.len(), groups.len());
    }

    let mut wtr = csv::Writer::from_path(output_path)?;
    wtr.write_record(["clip", "index", "x", "y"])?;

    let mut rows = 0;
    for (label, group) in labels.iter().zip(groups.iter()) {
        for (index, point) in group.rows().into_iter().enumerate() {
            wtr.write_record([
                label.as_str(),
                &index.to_string(),
                &point[0].to_string(),
                &point[1].to_string(),
            ])?;
            rows += 1;
        }
    }

    wtr.flush()?;
    Ok(rows)
}
