//! Scatter plots of the 2D projection.
//!
//! Each clip's points are drawn as filled circles in its own colour over a
//! pair of labelled axes, clips in order so later clips paint over earlier
//! ones.

mod colormap;
mod export;

use anyhow::{anyhow, Result};
use image::RgbImage;
use ndarray::{s, Array2, ArrayView2};
use plotters::prelude::*;
use std::ops::Range;

use crate::config::PlotConfig;

pub use colormap::rainbow;
pub use export::export_csv;

/// Padding around the data, as a fraction of its span
const RANGE_PADDING: f64 = 0.05;
const LABEL_AREA: u32 = 40;
/// Room for the axis lines when no tick labels are drawn
const BARE_AXIS_AREA: u32 = 4;
const CHART_MARGIN: u32 = 10;

/// Split projected points back into per-clip groups using cumulative offsets
pub fn split_by_offsets<'a>(
    points: &'a Array2<f64>,
    offsets: &[usize],
) -> Vec<ArrayView2<'a, f64>> {
    offsets
        .windows(2)
        .map(|w| points.slice(s![w[0]..w[1], ..]))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ScatterPlot {
    pub width: u32,
    pub height: u32,
    pub point_radius: u32,
}

impl From<&PlotConfig> for ScatterPlot {
    fn from(config: &PlotConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            point_radius: config.point_radius,
        }
    }
}

fn plot_error<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("Plot drawing failed: {}", e)
}

/// Axis ranges covering every point with a little padding
fn fitted_ranges(groups: &[ArrayView2<f64>]) -> (Range<f64>, Range<f64>) {
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for group in groups {
        for point in group.rows() {
            x_min = x_min.min(point[0]);
            x_max = x_max.max(point[0]);
            y_min = y_min.min(point[1]);
            y_max = y_max.max(point[1]);
        }
    }
    (padded(x_min, x_max), padded(y_min, y_max))
}

fn padded(min: f64, max: f64) -> Range<f64> {
    if !min.is_finite() || !max.is_finite() {
        return -1.0..1.0;
    }
    let span = max - min;
    if span <= f64::EPSILON {
        return (min - 1.0)..(max + 1.0);
    }
    let pad = span * RANGE_PADDING;
    (min - pad)..(max + pad)
}

impl ScatterPlot {
    /// Render one colour per group, colours from the rainbow colormap, with
    /// tick labels and a legend naming each group by `labels`.
    ///
    /// Text needs a system font. Without one the chart is drawn with bare
    /// axes and no legend.
    pub fn render(&self, labels: &[String], groups: &[ArrayView2<f64>]) -> Result<RgbImage> {
        match self.draw(labels, groups, true) {
            Ok(image) => Ok(image),
            Err(e) => {
                tracing::warn!(error = %e, "Plot text unavailable, drawing without labels");
                self.draw(labels, groups, false)
            }
        }
    }

    fn draw(
        &self,
        labels: &[String],
        groups: &[ArrayView2<f64>],
        with_text: bool,
    ) -> Result<RgbImage> {
        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        {
            let root = BitMapBackend::with_buffer(&mut buf, (self.width, self.height))
                .into_drawing_area();
            root.fill(&WHITE).map_err(plot_error)?;

            let label_area = if with_text {
                LABEL_AREA.min(self.width.min(self.height) / 4)
            } else {
                BARE_AXIS_AREA
            };
            let (x_range, y_range) = fitted_ranges(groups);
            let mut chart = ChartBuilder::on(&root)
                .margin(CHART_MARGIN)
                .x_label_area_size(label_area)
                .y_label_area_size(label_area)
                .build_cartesian_2d(x_range, y_range)
                .map_err(plot_error)?;

            {
                let mut mesh = chart.configure_mesh();
                mesh.disable_mesh();
                if !with_text {
                    mesh.x_labels(0).y_labels(0);
                }
                mesh.draw().map_err(plot_error)?;
            }

            let colors = rainbow(groups.len());
            let radius = self.point_radius;
            for (i, (group, color)) in groups.iter().zip(colors.iter()).enumerate() {
                let [r, g, b] = color.0;
                let style = RGBColor(r, g, b).filled();
                let series = chart
                    .draw_series(
                        group
                            .rows()
                            .into_iter()
                            .map(move |p| Circle::new((p[0], p[1]), radius, style)),
                    )
                    .map_err(plot_error)?;
                if let (true, Some(label)) = (with_text, labels.get(i)) {
                    series
                        .label(label.as_str())
                        .legend(move |(x, y)| Circle::new((x, y), radius, style));
                }
            }

            if with_text && !labels.is_empty() {
                chart
                    .configure_series_labels()
                    .background_style(WHITE.mix(0.8))
                    .border_style(BLACK)
                    .draw()
                    .map_err(plot_error)?;
            }

            root.present().map_err(plot_error)?;
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| anyhow!("Plot buffer does not match {}x{}", self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::array;

    const WHITE_PIXEL: Rgb<u8> = Rgb([255, 255, 255]);

    fn has_pixel(image: &RgbImage, color: Rgb<u8>) -> bool {
        image.pixels().any(|p| *p == color)
    }

    #[test]
    fn test_split_by_offsets() {
        let points = Array2::from_shape_fn((6, 2), |(i, _)| i as f64);
        let groups = split_by_offsets(&points, &[0, 2, 6]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].nrows(), 2);
        assert_eq!(groups[1].nrows(), 4);
        assert_eq!(groups[1][[0, 0]], 2.0);
        assert_eq!(groups.iter().map(|g| g.nrows()).sum::<usize>(), points.nrows());
    }

    #[test]
    fn test_fitted_ranges_cover_points() {
        let points = array![[-2.0, 1.0], [8.0, 3.0]];
        let groups = split_by_offsets(&points, &[0, 1, 2]);
        let (x, y) = fitted_ranges(&groups);
        assert!(x.start < -2.0 && x.end > 8.0);
        assert!((x.start + 2.5).abs() < 1e-12);
        assert!(y.start < 1.0 && y.end > 3.0);

        let single = array![[3.0, 3.0]];
        let (x, y) = fitted_ranges(&split_by_offsets(&single, &[0, 1]));
        assert_eq!(x, 2.0..4.0);
        assert_eq!(y, 2.0..4.0);

        let (x, _) = fitted_ranges(&[]);
        assert_eq!(x, -1.0..1.0);
    }

    #[test]
    fn test_render_draws_every_group() {
        let plot = ScatterPlot {
            width: 200,
            height: 160,
            point_radius: 3,
        };
        let points = array![[0.0, 0.0], [1.0, 0.5], [10.0, 10.0]];
        let groups = split_by_offsets(&points, &[0, 2, 3]);
        let labels = vec!["a".to_string(), "b".to_string()];
        let colors = rainbow(2);

        let image = plot.render(&labels, &groups).unwrap();
        assert_eq!(image.dimensions(), (200, 160));
        assert!(has_pixel(&image, colors[0]));
        assert!(has_pixel(&image, colors[1]));
        assert!(has_pixel(&image, WHITE_PIXEL));
    }

    #[test]
    fn test_bare_axes_without_text() {
        let plot = ScatterPlot {
            width: 120,
            height: 100,
            point_radius: 2,
        };
        let points = array![[0.0, 0.0], [4.0, 2.0]];
        let groups = split_by_offsets(&points, &[0, 2]);

        let image = plot.draw(&[], &groups, false).unwrap();
        assert_eq!(image.dimensions(), (120, 100));
        assert!(has_pixel(&image, rainbow(1)[0]));
        // Axis lines are drawn in black
        assert!(has_pixel(&image, Rgb([0, 0, 0])));
    }
}
