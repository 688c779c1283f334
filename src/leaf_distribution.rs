use crate::functions;
use ndarray::{s, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// E/M passes performed by a single `update` call. Fixed, no convergence
/// check.
pub const EM_ITERATIONS: usize = 10;

/// Additive floor applied before every normalization in the EM update. It
/// guards against exact-zero division, not against ill-conditioned
/// covariance: a leaf starved of responsibility mass can still end up with a
/// near-singular sigma, which the density primitive degrades to zero density.
const EPSILON: f64 = 1e-9;

/// Per-(tree, leaf) Gaussian over the task space. `mean` has shape
/// `[trees, leaves, tasks, 1]` and `sigma` `[trees, leaves, tasks, tasks]`;
/// both are refit in place by `update` and are the entire durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafDistribution {
    mean: Array4<f64>,
    sigma: Array4<f64>,
}

impl LeafDistribution {
    /// Uniform-random initialization in `[0, 1)`, as a cold start before any
    /// EM pass.
    pub fn random<R: Rng + ?Sized>(
        rng: &mut R,
        trees_len: usize,
        leaves_len: usize,
        tasks_len: usize,
    ) -> Self {
        let mean =
            Array4::from_shape_simple_fn((trees_len, leaves_len, tasks_len, 1), || rng.gen());
        let sigma =
            Array4::from_shape_simple_fn((trees_len, leaves_len, tasks_len, tasks_len), || {
                rng.gen()
            });
        Self { mean, sigma }
    }

    pub fn trees_len(&self) -> usize {
        self.mean.shape()[0]
    }

    pub fn leaves_len(&self) -> usize {
        self.mean.shape()[1]
    }

    pub fn tasks_len(&self) -> usize {
        self.mean.shape()[2]
    }

    pub fn mean(&self) -> ArrayView4<f64> {
        self.mean.view()
    }

    pub fn sigma(&self) -> ArrayView4<f64> {
        self.sigma.view()
    }

    /// Current leaf means with the trailing singleton axis squeezed away:
    /// `[trees, leaves, tasks]`.
    pub fn means(&self) -> Array3<f64> {
        self.mean.index_axis(Axis(3), 0).to_owned()
    }

    /// Warm start from externally computed cluster statistics: leaf `l` of
    /// every tree is seeded with `means[l]` / `sigmas[l]`.
    pub fn init_from_clusters(
        &mut self,
        means: &ArrayView2<f64>,
        sigmas: &ArrayView3<f64>,
    ) -> Result<(), DistributionError> {
        let leaves = self.leaves_len();
        let tasks = self.tasks_len();
        if means.dim() != (leaves, tasks) {
            return Err(DistributionError::CentroidShapeMismatch {
                expected: (leaves, tasks),
                actual: means.dim(),
            });
        }
        if sigmas.dim() != (leaves, tasks, tasks) {
            return Err(DistributionError::CentroidCovarianceShapeMismatch {
                expected: (leaves, tasks, tasks),
                actual: sigmas.dim(),
            });
        }

        info!("seeding leaf distributions from cluster centroids");
        for tree in 0..self.trees_len() {
            for leaf in 0..leaves {
                for task in 0..tasks {
                    self.mean[[tree, leaf, task, 0]] = means[[leaf, task]];
                }
                self.sigma
                    .slice_mut(s![tree, leaf, .., ..])
                    .assign(&sigmas.index_axis(Axis(0), leaf));
            }
        }
        Ok(())
    }

    /// Refit every leaf Gaussian from routing responsibilities `x`
    /// (`[samples, trees, leaves]`) and observed targets `y`
    /// (`[samples, tasks]`).
    ///
    /// Shape checks happen before any mutation; after that, each pass
    /// materializes the full new `mean` and `sigma` before overwriting the
    /// previous ones.
    pub fn update(&mut self, x: &ArrayView3<f64>, y: &ArrayView2<f64>) -> Result<(), DistributionError> {
        let expected = (y.nrows(), self.trees_len(), self.leaves_len());
        if x.dim() != expected {
            return Err(DistributionError::ResponsibilityShapeMismatch {
                expected,
                actual: x.dim(),
            });
        }
        if y.ncols() != self.tasks_len() {
            return Err(DistributionError::TaskLenMismatch {
                expected: self.tasks_len(),
                actual: y.ncols(),
            });
        }

        debug!(samples = y.nrows(), "refitting leaf distributions");
        for _ in 0..EM_ITERATIONS {
            self.em_pass(x, y);
        }
        Ok(())
    }

    fn em_pass(&mut self, x: &ArrayView3<f64>, y: &ArrayView2<f64>) {
        let (trees, leaves, tasks, _) = self.mean.dim();
        let samples = y.nrows();

        // E-step: posterior responsibility of each leaf for each sample,
        // combining the routing prior with the Gaussian likelihood and
        // normalizing per (sample, tree).
        let densities = functions::gaussian_densities(y, &self.mean.view(), &self.sigma.view());
        let mut zeta = Array3::zeros((samples, trees, leaves));
        for sample in 0..samples {
            for tree in 0..trees {
                let mut total = 0.0;
                for leaf in 0..leaves {
                    let w = x[[sample, tree, leaf]] * (densities[[sample, tree, leaf]] + EPSILON);
                    zeta[[sample, tree, leaf]] = w;
                    total += w;
                }
                for leaf in 0..leaves {
                    zeta[[sample, tree, leaf]] /= total + EPSILON;
                }
            }
        }

        // M-step: responsibility-weighted mean, then covariance around the
        // mean updated in this same pass.
        let mut mean = Array4::zeros((trees, leaves, tasks, 1));
        let mut sigma = Array4::zeros((trees, leaves, tasks, tasks));
        for tree in 0..trees {
            for leaf in 0..leaves {
                let mut mass = 0.0;
                let mut weighted = vec![0.0; tasks];
                for sample in 0..samples {
                    let z = zeta[[sample, tree, leaf]];
                    mass += z;
                    for task in 0..tasks {
                        weighted[task] += z * y[[sample, task]];
                    }
                }
                for task in 0..tasks {
                    mean[[tree, leaf, task, 0]] = weighted[task] / (mass + EPSILON);
                }

                let mut residual = vec![0.0; tasks];
                for sample in 0..samples {
                    let z = zeta[[sample, tree, leaf]];
                    for task in 0..tasks {
                        residual[task] = y[[sample, task]] - mean[[tree, leaf, task, 0]];
                    }
                    for i in 0..tasks {
                        for j in 0..tasks {
                            sigma[[tree, leaf, i, j]] += z * residual[i] * residual[j];
                        }
                    }
                }
                for i in 0..tasks {
                    for j in 0..tasks {
                        sigma[[tree, leaf, i, j]] /= mass + EPSILON;
                    }
                }
            }
        }

        self.mean = mean;
        self.sigma = sigma;
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistError> {
        info!(path = %path.as_ref().display(), "saving leaf distributions");
        let encoded = bincode::serialize(self)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        info!(path = %path.as_ref().display(), "loading leaf distributions");
        let encoded = std::fs::read(path)?;
        Ok(bincode::deserialize(&encoded)?)
    }
}

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("responsibilities have shape {actual:?}, but {expected:?} was expected")]
    ResponsibilityShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("targets have {actual} task dimensions, but the distribution holds {expected}")]
    TaskLenMismatch { expected: usize, actual: usize },

    #[error("cluster centroids have shape {actual:?}, but {expected:?} was expected")]
    CentroidShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("cluster covariances have shape {actual:?}, but {expected:?} was expected")]
    CentroidCovarianceShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to access the distribution file")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode the distribution")]
    Codec(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bimodal_case(leaf_means: [f64; 2]) -> (LeafDistribution, Array3<f64>, ndarray::Array2<f64>) {
        let mut mean = Array4::zeros((1, 2, 1, 1));
        mean[[0, 0, 0, 0]] = leaf_means[0];
        mean[[0, 1, 0, 0]] = leaf_means[1];
        let sigma = Array4::ones((1, 2, 1, 1));
        let dist = LeafDistribution { mean, sigma };

        // Routing pinned to an even split for both samples.
        let x = Array3::from_elem((2, 1, 2), 0.5);
        let y = array![[1.0], [3.0]];
        (dist, x, y)
    }

    #[test]
    fn uniform_responsibilities_keep_a_symmetric_mean_fixed() -> Result<(), anyhow::Error> {
        // Both leaves hold the same Gaussian centered on the sample mean of
        // the targets, so the update has nothing to move.
        let (mut dist, x, y) = bimodal_case([2.0, 2.0]);
        dist.update(&x.view(), &y.view())?;
        assert!((dist.mean[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((dist.mean[[0, 1, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((dist.sigma[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn em_separates_bimodal_targets() -> Result<(), anyhow::Error> {
        // Leaves start on opposite sides of the two targets and must latch
        // onto 1.0 and 3.0 instead of collapsing to the global mean 2.0.
        let (mut dist, x, y) = bimodal_case([0.0, 4.0]);
        dist.update(&x.view(), &y.view())?;
        assert!((dist.mean[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((dist.mean[[0, 1, 0, 0]] - 3.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn passes_compose_without_hidden_state() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = LeafDistribution::random(&mut rng, 2, 4, 2);

        let samples = 6;
        let mut x = Array3::from_shape_simple_fn((samples, 2, 4), || rng.gen::<f64>());
        for mut row in x.rows_mut() {
            let total = row.sum();
            row.mapv_inplace(|v| v / total);
        }
        let y = ndarray::Array2::from_shape_simple_fn((samples, 2), || rng.gen::<f64>() * 4.0);

        let mut a = base.clone();
        for _ in 0..5 {
            a.em_pass(&x.view(), &y.view());
        }
        let mut b = base.clone();
        for _ in 0..2 {
            b.em_pass(&x.view(), &y.view());
        }
        for _ in 0..3 {
            b.em_pass(&x.view(), &y.view());
        }
        assert_eq!(a, b);
    }

    #[test]
    fn update_rejects_mismatched_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut dist = LeafDistribution::random(&mut rng, 2, 4, 2);

        let x = Array3::from_elem((3, 2, 3), 0.25);
        let y = ndarray::Array2::zeros((3, 2));
        assert!(matches!(
            dist.update(&x.view(), &y.view()),
            Err(DistributionError::ResponsibilityShapeMismatch {
                expected: (3, 2, 4),
                actual: (3, 2, 3),
            })
        ));

        let x = Array3::from_elem((3, 2, 4), 0.25);
        let y = ndarray::Array2::zeros((3, 1));
        assert!(matches!(
            dist.update(&x.view(), &y.view()),
            Err(DistributionError::TaskLenMismatch {
                expected: 2,
                actual: 1,
            })
        ));
    }

    #[test]
    fn cluster_seed_broadcasts_across_trees() -> Result<(), anyhow::Error> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut dist = LeafDistribution::random(&mut rng, 3, 2, 2);

        let means = array![[1.0, 2.0], [3.0, 4.0]];
        let mut sigmas = Array3::zeros((2, 2, 2));
        sigmas[[0, 0, 0]] = 0.5;
        sigmas[[0, 1, 1]] = 0.5;
        sigmas[[1, 0, 0]] = 2.0;
        sigmas[[1, 1, 1]] = 2.0;
        dist.init_from_clusters(&means.view(), &sigmas.view())?;

        for tree in 0..3 {
            assert_eq!(dist.mean[[tree, 0, 1, 0]], 2.0);
            assert_eq!(dist.mean[[tree, 1, 0, 0]], 3.0);
            assert_eq!(dist.sigma[[tree, 1, 1, 1]], 2.0);
        }

        let bad = array![[1.0], [2.0]];
        assert!(dist.init_from_clusters(&bad.view(), &sigmas.view()).is_err());
        Ok(())
    }

    #[test]
    fn save_then_load_is_bit_exact() -> Result<(), anyhow::Error> {
        let mut rng = StdRng::seed_from_u64(7);
        let dist = LeafDistribution::random(&mut rng, 2, 4, 3);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pi.bin");
        dist.save(&path)?;
        let loaded = LeafDistribution::load(&path)?;
        assert_eq!(dist, loaded);
        Ok(())
    }
}
