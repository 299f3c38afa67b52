//! Exact t-SNE.
//!
//! Input affinities come from squared Euclidean distances with a per-point
//! Gaussian bandwidth calibrated to the target perplexity. The 2D layout is
//! optimized by gradient descent on the KL divergence with a Student-t output
//! kernel, using early exaggeration, momentum and adaptive gains.
//!
//! The cost is quadratic in the number of points, which is fine for the few
//! thousand frames of an evaluation run.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::config::{TsneConfig, TsneInit};

const MACHINE_EPSILON: f64 = f64::EPSILON;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const PERPLEXITY_STEPS: usize = 100;
const EXPLORATION_ITER: usize = 250;
const CHECK_INTERVAL: usize = 50;
const MIN_GRAD_NORM: f64 = 1e-7;
const MIN_GAIN: f64 = 0.01;
const INIT_SCALE: f64 = 1e-4;
const POWER_ITERATIONS: usize = 200;

/// Result of a t-SNE run
#[derive(Debug, Clone)]
pub struct TsneFit {
    /// One row per input point
    pub embedding: Array2<f64>,
    pub kl_divergence: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct Tsne {
    pub perplexity: f64,
    pub early_exaggeration: f64,
    pub learning_rate: Option<f64>,
    pub max_iter: usize,
    pub init: TsneInit,
    pub seed: u64,
}

impl Default for Tsne {
    fn default() -> Self {
        Self::from(&TsneConfig::default())
    }
}

impl From<&TsneConfig> for Tsne {
    fn from(config: &TsneConfig) -> Self {
        Self {
            perplexity: config.perplexity,
            early_exaggeration: config.early_exaggeration,
            learning_rate: config.learning_rate,
            max_iter: config.max_iter,
            init: config.init,
            seed: config.seed,
        }
    }
}

impl Tsne {
    /// Project `data` (one point per row) into 2D
    pub fn fit_transform(&self, data: &Array2<f32>) -> Result<Array2<f64>> {
        Ok(self.fit(data)?.embedding)
    }

    pub fn fit(&self, data: &Array2<f32>) -> Result<TsneFit> {
        let n = data.nrows();
        if n < 2 {
            bail!("t-SNE needs at least 2 points, got {}", n);
        }
        if self.perplexity <= 0.0 || self.perplexity >= n as f64 {
            bail!(
                "Perplexity must be in (0, n_samples), got {} for {} samples",
                self.perplexity,
                n
            );
        }
        if self.early_exaggeration < 1.0 {
            bail!("Early exaggeration must be at least 1, got {}", self.early_exaggeration);
        }

        let x = data.mapv(|v| v as f64);
        let distances = squared_distances(&x);
        let conditional = conditional_probabilities(&distances, self.perplexity);
        let p = joint_probabilities(&conditional);

        let learning_rate = self
            .learning_rate
            .unwrap_or_else(|| (n as f64 / self.early_exaggeration / 4.0).max(50.0));

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut y = match self.init {
            TsneInit::Pca => pca_init(&x, &mut rng).unwrap_or_else(|| {
                tracing::warn!("PCA initialization degenerate, using random init");
                random_init(n, &mut rng)
            }),
            TsneInit::Random => random_init(n, &mut rng),
        };

        tracing::info!(
            points = n,
            dim = x.ncols(),
            perplexity = self.perplexity,
            learning_rate,
            "Running t-SNE"
        );

        let exploration = EXPLORATION_ITER.min(self.max_iter);
        let mut optimizer = Optimizer::new(n, learning_rate);

        let (explored, exploration_kl) =
            optimizer.run(&p, &mut y, self.early_exaggeration, 0.5, 0, exploration);
        let (iterations, final_kl) = optimizer.run(&p, &mut y, 1.0, 0.8, explored, self.max_iter);
        let kl_divergence = if final_kl.is_nan() { exploration_kl } else { final_kl };

        tracing::info!(iterations, kl_divergence, "t-SNE finished");

        let mut embedding = Array2::zeros((n, 2));
        for (i, point) in y.iter().enumerate() {
            embedding[[i, 0]] = point[0];
            embedding[[i, 1]] = point[1];
        }

        Ok(TsneFit {
            embedding,
            kl_divergence,
            iterations,
        })
    }
}

/// Pairwise squared Euclidean distances, zero on the diagonal
fn squared_distances(x: &Array2<f64>) -> Array2<f64> {
    let norms: Array1<f64> = x.map_axis(Axis(1), |row| row.dot(&row));
    let mut distances = x.dot(&x.t());
    for ((i, j), d) in distances.indexed_iter_mut() {
        *d = if i == j {
            0.0
        } else {
            (norms[i] + norms[j] - 2.0 * *d).max(0.0)
        };
    }
    distances
}

/// Row-conditional probabilities p(j|i), each row calibrated by binary search
/// on the Gaussian precision so its entropy matches `ln(perplexity)`.
fn conditional_probabilities(distances: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = distances.nrows();
    let desired_entropy = perplexity.ln();

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let row = distances.row(i);
            let mut p = vec![0.0; n];
            let mut beta = 1.0;
            let mut beta_min = f64::NEG_INFINITY;
            let mut beta_max = f64::INFINITY;

            for _ in 0..PERPLEXITY_STEPS {
                let mut sum_p = 0.0;
                for j in 0..n {
                    p[j] = if j == i { 0.0 } else { (-row[j] * beta).exp() };
                    sum_p += p[j];
                }
                if sum_p == 0.0 {
                    sum_p = 1e-8;
                }

                let mut sum_disti_pi = 0.0;
                for j in 0..n {
                    p[j] /= sum_p;
                    sum_disti_pi += row[j] * p[j];
                }

                let entropy = sum_p.ln() + beta * sum_disti_pi;
                let diff = entropy - desired_entropy;
                if diff.abs() <= PERPLEXITY_TOLERANCE {
                    break;
                }

                if diff > 0.0 {
                    beta_min = beta;
                    beta = if beta_max == f64::INFINITY {
                        beta * 2.0
                    } else {
                        (beta + beta_max) / 2.0
                    };
                } else {
                    beta_max = beta;
                    beta = if beta_min == f64::NEG_INFINITY {
                        beta / 2.0
                    } else {
                        (beta + beta_min) / 2.0
                    };
                }
            }
            p
        })
        .collect();

    let mut conditional = Array2::zeros((n, n));
    for (i, row) in rows.into_iter().enumerate() {
        conditional.row_mut(i).assign(&Array1::from(row));
    }
    conditional
}

/// Symmetrize and normalize so all off-diagonal entries sum to one
fn joint_probabilities(conditional: &Array2<f64>) -> Vec<f64> {
    let n = conditional.nrows();
    let sum_p = (conditional.sum() * 2.0).max(MACHINE_EPSILON);

    let mut p = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            if i != j {
                let v = (conditional[[i, j]] + conditional[[j, i]]) / sum_p;
                p[i * n + j] = v.max(MACHINE_EPSILON);
            }
        }
    }
    p
}

fn random_init(n: usize, rng: &mut StdRng) -> Vec<[f64; 2]> {
    (0..n)
        .map(|_| {
            let a: f64 = rng.sample(StandardNormal);
            let b: f64 = rng.sample(StandardNormal);
            [a * INIT_SCALE, b * INIT_SCALE]
        })
        .collect()
}

/// Project onto the top two principal components, scaled so the first axis
/// has standard deviation `INIT_SCALE`. `None` when the data has no variance.
fn pca_init(x: &Array2<f64>, rng: &mut StdRng) -> Option<Vec<[f64; 2]>> {
    let mean = x.mean_axis(Axis(0))?;
    let centered = x - &mean;
    let d = centered.ncols();

    let mut components: Vec<Array1<f64>> = Vec::with_capacity(2);
    for _ in 0..2 {
        let mut v = Array1::from_iter((0..d).map(|_| rng.sample::<f64, _>(StandardNormal)));
        for _ in 0..POWER_ITERATIONS {
            let mut next = centered.t().dot(&centered.dot(&v));
            for c in &components {
                let overlap = next.dot(c);
                next.scaled_add(-overlap, c);
            }
            let norm = next.dot(&next).sqrt();
            if norm < MACHINE_EPSILON {
                break;
            }
            v = next / norm;
        }
        // Deterministic sign: largest magnitude coordinate positive
        let pivot = v
            .iter()
            .copied()
            .fold(0.0f64, |acc, c| if c.abs() > acc.abs() { c } else { acc });
        if pivot < 0.0 {
            v.mapv_inplace(|c| -c);
        }
        components.push(v);
    }

    let first = centered.dot(&components[0]);
    let second = centered.dot(&components[1]);
    let std = first.std(0.0);
    if !(std > MACHINE_EPSILON) {
        return None;
    }

    let scale = INIT_SCALE / std;
    Some(
        first
            .iter()
            .zip(second.iter())
            .map(|(a, b)| [a * scale, b * scale])
            .collect(),
    )
}

/// Gradient descent state carried across the exploration and final phases
struct Optimizer {
    update: Vec<[f64; 2]>,
    gains: Vec<[f64; 2]>,
    learning_rate: f64,
}

impl Optimizer {
    fn new(n: usize, learning_rate: f64) -> Self {
        Self {
            update: vec![[0.0; 2]; n],
            gains: vec![[1.0; 2]; n],
            learning_rate,
        }
    }

    /// Iterate from `start` to `end`. Returns the iteration reached and the
    /// last KL divergence computed.
    fn run(
        &mut self,
        p: &[f64],
        y: &mut [[f64; 2]],
        exaggeration: f64,
        momentum: f64,
        start: usize,
        end: usize,
    ) -> (usize, f64) {
        let mut kl = f64::NAN;
        for iteration in start..end {
            let check = (iteration + 1) % CHECK_INTERVAL == 0 || iteration + 1 == end;
            let (grad, error) = kl_gradient(p, y, exaggeration, check);

            let mut grad_norm_sq = 0.0;
            for i in 0..y.len() {
                for k in 0..2 {
                    let g = grad[i][k];
                    let gain = &mut self.gains[i][k];
                    if self.update[i][k] * g < 0.0 {
                        *gain += 0.2;
                    } else {
                        *gain *= 0.8;
                    }
                    *gain = gain.max(MIN_GAIN);

                    let scaled = g * *gain;
                    grad_norm_sq += g * g;
                    self.update[i][k] = momentum * self.update[i][k] - self.learning_rate * scaled;
                    y[i][k] += self.update[i][k];
                }
            }

            if let Some(error) = error {
                kl = error;
                let grad_norm = grad_norm_sq.sqrt();
                tracing::debug!(
                    iteration = iteration + 1,
                    kl_divergence = error,
                    grad_norm,
                    "t-SNE progress"
                );
                if grad_norm < MIN_GRAD_NORM {
                    return (iteration + 1, kl);
                }
            }
        }
        (end.max(start), kl)
    }
}

/// Gradient of KL(P || Q) with respect to the layout, and optionally the
/// divergence itself.
fn kl_gradient(
    p: &[f64],
    y: &[[f64; 2]],
    exaggeration: f64,
    with_error: bool,
) -> (Vec<[f64; 2]>, Option<f64>) {
    let n = y.len();
    let kernel = |i: usize, j: usize| {
        let dx = y[i][0] - y[j][0];
        let dy = y[i][1] - y[j][1];
        1.0 / (1.0 + dx * dx + dy * dy)
    };

    let z: f64 = (0..n)
        .into_par_iter()
        .map(|i| (0..n).filter(|&j| j != i).map(|j| kernel(i, j)).sum::<f64>())
        .sum::<f64>()
        .max(MACHINE_EPSILON);

    let grad = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut g = [0.0; 2];
            for j in 0..n {
                if j == i {
                    continue;
                }
                let num = kernel(i, j);
                let q = (num / z).max(MACHINE_EPSILON);
                let mult = (exaggeration * p[i * n + j] - q) * num;
                g[0] += mult * (y[i][0] - y[j][0]);
                g[1] += mult * (y[i][1] - y[j][1]);
            }
            [4.0 * g[0], 4.0 * g[1]]
        })
        .collect();

    let error = with_error.then(|| {
        (0..n)
            .into_par_iter()
            .map(|i| {
                (0..n)
                    .filter(|&j| j != i)
                    .map(|j| {
                        let pij = exaggeration * p[i * n + j];
                        let q = (kernel(i, j) / z).max(MACHINE_EPSILON);
                        pij * (pij.max(MACHINE_EPSILON) / q).ln()
                    })
                    .sum::<f64>()
            })
            .sum::<f64>()
    });

    (grad, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight blobs far apart in 6D
    fn blobs(per_blob: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Array2::zeros((per_blob * 2, 6));
        for i in 0..per_blob * 2 {
            let center = if i < per_blob { 0.0 } else { 10.0 };
            for k in 0..6 {
                let noise: f64 = rng.sample(StandardNormal);
                data[[i, k]] = (center + 0.3 * noise) as f32;
            }
        }
        data
    }

    fn quick(init: TsneInit) -> Tsne {
        Tsne {
            perplexity: 5.0,
            max_iter: 400,
            init,
            ..Tsne::default()
        }
    }

    fn centroid(points: &Array2<f64>, rows: std::ops::Range<usize>) -> [f64; 2] {
        let count = rows.len() as f64;
        let mut c = [0.0; 2];
        for i in rows {
            c[0] += points[[i, 0]] / count;
            c[1] += points[[i, 1]] / count;
        }
        c
    }

    fn mean_spread(points: &Array2<f64>, rows: std::ops::Range<usize>) -> f64 {
        let c = centroid(points, rows.clone());
        let count = rows.len() as f64;
        rows.map(|i| ((points[[i, 0]] - c[0]).powi(2) + (points[[i, 1]] - c[1]).powi(2)).sqrt())
            .sum::<f64>()
            / count
    }

    #[test]
    fn test_separates_clusters() {
        let data = blobs(20, 1);
        for init in [TsneInit::Pca, TsneInit::Random] {
            let fit = quick(init).fit(&data).unwrap();
            let y = &fit.embedding;
            assert_eq!(y.shape(), &[40, 2]);
            assert!(y.iter().all(|v| v.is_finite()));

            let a = centroid(y, 0..20);
            let b = centroid(y, 20..40);
            let gap = ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt();
            assert!(gap > 2.0 * mean_spread(y, 0..20));
            assert!(gap > 2.0 * mean_spread(y, 20..40));
            assert!(fit.kl_divergence.is_finite());
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let data = blobs(10, 2);
        let tsne = Tsne {
            perplexity: 4.0,
            max_iter: 300,
            init: TsneInit::Random,
            seed: 7,
            ..Tsne::default()
        };
        let first = tsne.fit_transform(&data).unwrap();
        let second = tsne.fit_transform(&data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let tsne = Tsne::default();
        assert!(tsne.fit(&Array2::zeros((1, 3))).is_err());
        // Default perplexity 30 needs more than 30 points
        assert!(tsne.fit(&Array2::zeros((30, 3))).is_err());
        let tsne = Tsne {
            perplexity: 0.0,
            ..Tsne::default()
        };
        assert!(tsne.fit(&Array2::zeros((10, 3))).is_err());
    }

    #[test]
    fn test_conditional_rows_match_perplexity() {
        let x = blobs(15, 3).mapv(|v| v as f64);
        let distances = squared_distances(&x);
        let conditional = conditional_probabilities(&distances, 8.0);

        for (i, row) in conditional.rows().into_iter().enumerate() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert_eq!(row[i], 0.0);
            let entropy: f64 = row.iter().filter(|&&p| p > 0.0).map(|&p| -p * p.ln()).sum();
            assert!((entropy.exp() - 8.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_joint_probabilities_symmetric() {
        let x = blobs(8, 4).mapv(|v| v as f64);
        let conditional = conditional_probabilities(&squared_distances(&x), 3.0);
        let p = joint_probabilities(&conditional);
        let n = 16;

        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for i in 0..n {
            assert_eq!(p[i * n + i], 0.0);
            for j in 0..n {
                assert!((p[i * n + j] - p[j * n + i]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_squared_distances() {
        let x = ndarray::array![[0.0, 0.0], [3.0, 4.0], [1.0, 0.0]];
        let d = squared_distances(&x);
        assert!((d[[0, 1]] - 25.0).abs() < 1e-9);
        assert!((d[[1, 2]] - 20.0).abs() < 1e-9);
        assert_eq!(d[[2, 2]], 0.0);
    }

    #[test]
    fn test_pca_init_follows_main_axis() {
        // Points along the x axis with a little y jitter
        let x = Array2::from_shape_fn((12, 2), |(i, k)| {
            if k == 0 {
                i as f64
            } else if i % 2 == 0 {
                0.1
            } else {
                -0.1
            }
        });
        let mut rng = StdRng::seed_from_u64(0);
        let y = pca_init(&x, &mut rng).unwrap();

        let first = Array1::from_iter(y.iter().map(|p| p[0]));
        assert!((first.std(0.0) - INIT_SCALE).abs() < 1e-9);
        // Ordering along the main axis is preserved
        assert!(y.windows(2).all(|w| w[1][0] > w[0][0]));

        let flat = Array2::<f64>::ones((5, 3));
        assert!(pca_init(&flat, &mut rng).is_none());
    }
}
