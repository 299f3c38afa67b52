use image::Rgb;
use std::f64::consts::PI;

/// `n` evenly spaced colours from the rainbow colormap, purple to red.
///
/// Channels follow the gnuplot-style formulas `|2x - 0.5|`, `sin(pi x)` and
/// `cos(pi x / 2)`, clipped to `[0, 1]`.
pub fn rainbow(n: usize) -> Vec<Rgb<u8>> {
    (0..n)
        .map(|i| {
            let x = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            Rgb([
                to_u8((2.0 * x - 0.5).abs()),
                to_u8((PI * x).sin()),
                to_u8((PI * x / 2.0).cos()),
            ])
        })
        .collect()
}

fn to_u8(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let colors = rainbow(4);
        assert_eq!(colors.len(), 4);
        assert_eq!(colors[0], Rgb([128, 0, 255]));
        assert_eq!(colors[3], Rgb([255, 0, 0]));
    }

    #[test]
    fn test_distinct() {
        let colors = rainbow(6);
        for i in 0..colors.len() {
            for j in (i + 1)..colors.len() {
                assert_ne!(colors[i], colors[j]);
            }
        }
    }

    #[test]
    fn test_single_and_empty() {
        assert_eq!(rainbow(1), vec![Rgb([128, 0, 255])]);
        assert!(rainbow(0).is_empty());
    }
}
