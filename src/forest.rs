use crate::leaf_distribution::{DistributionError, LeafDistribution};
use crate::tree::{SoftTree, TreeError};
use itertools::izip;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::num::NonZeroUsize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ForestOptions {
    pub trees: NonZeroUsize,
    pub depth: NonZeroUsize,
    pub tasks: NonZeroUsize,
    pub seed: Option<u64>,
}

impl ForestOptions {
    pub fn trees(mut self, trees: NonZeroUsize) -> Self {
        self.trees = trees;
        self
    }

    pub fn depth(mut self, depth: NonZeroUsize) -> Self {
        self.depth = depth;
        self
    }

    pub fn tasks(mut self, tasks: NonZeroUsize) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rngs(&self) -> impl Iterator<Item = StdRng> {
        let seed_u64 = self.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let mut seed = [0u8; 32];
        (&mut seed[0..8]).copy_from_slice(&seed_u64.to_be_bytes()[..]);
        let mut rng = StdRng::from_seed(seed);
        std::iter::repeat_with(move || {
            let mut seed = [0u8; 32];
            rng.fill(&mut seed);
            StdRng::from_seed(seed)
        })
    }
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            trees: NonZeroUsize::new(5).expect("never fails"),
            depth: NonZeroUsize::new(6).expect("never fails"),
            tasks: NonZeroUsize::new(2).expect("never fails"),
            seed: None,
        }
    }
}

/// An ensemble of independently masked soft trees sharing one
/// `LeafDistribution`. Prediction combines each tree's leaf routing with the
/// current leaf means; the routing tensor it returns doubles as the
/// responsibility input of `update_distribution`.
#[derive(Debug)]
pub struct Forest {
    trees: Vec<SoftTree>,
    distribution: LeafDistribution,
}

impl Forest {
    pub fn new(features_len: usize, options: ForestOptions) -> Result<Self, ForestError> {
        let mut rngs = options.rngs();
        let mut trees = Vec::with_capacity(options.trees.get());
        for _ in 0..options.trees.get() {
            let mut rng = rngs.next().expect("never fails");
            trees.push(SoftTree::new(&mut rng, options.depth, features_len)?);
        }

        let leaves_len = trees[0].leaves_len();
        let mut rng = rngs.next().expect("never fails");
        let distribution =
            LeafDistribution::random(&mut rng, trees.len(), leaves_len, options.tasks.get());

        Ok(Self {
            trees,
            distribution,
        })
    }

    pub fn trees_len(&self) -> usize {
        self.trees.len()
    }

    pub fn leaves_len(&self) -> usize {
        self.trees[0].leaves_len()
    }

    pub fn distribution(&self) -> &LeafDistribution {
        &self.distribution
    }

    pub fn distribution_mut(&mut self) -> &mut LeafDistribution {
        &mut self.distribution
    }

    /// Task-space prediction `[rows, tasks]` plus the raw per-tree routing
    /// probabilities `[rows, trees, leaves]`. Pure function of the current
    /// tree masks and leaf means.
    pub fn predict(
        &self,
        x: &ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array3<f64>), ForestError> {
        let routed = self
            .trees
            .iter()
            .map(|tree| tree.route_batch(x))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.combine(x.nrows(), &routed))
    }

    /// `predict` with the per-tree routing fanned out over rayon.
    pub fn predict_parallel(
        &self,
        x: &ArrayView2<f64>,
    ) -> Result<(Array2<f64>, Array3<f64>), ForestError> {
        let routed = self
            .trees
            .par_iter()
            .map(|tree| tree.route_batch(x))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.combine(x.nrows(), &routed))
    }

    fn combine(&self, rows: usize, routed: &[Array2<f64>]) -> (Array2<f64>, Array3<f64>) {
        let leaves = self.leaves_len();
        let tasks = self.distribution.tasks_len();
        let means = self.distribution.means();

        let mut routing = Array3::zeros((rows, self.trees.len(), leaves));
        let mut prediction = Array2::zeros((rows, tasks));
        for (tree, mu, tree_means) in izip!(0..self.trees.len(), routed, means.outer_iter()) {
            routing.slice_mut(s![.., tree, ..]).assign(mu);
            for row in 0..rows {
                for leaf in 0..leaves {
                    let p = mu[[row, leaf]];
                    for task in 0..tasks {
                        prediction[[row, task]] += p * tree_means[[leaf, task]];
                    }
                }
            }
        }
        (prediction, routing)
    }

    /// Forward the routing tensor returned by `predict` (detached from any
    /// gradient context) and the observed targets into the EM refit of the
    /// shared leaf distribution.
    pub fn update_distribution(
        &mut self,
        routing: &ArrayView3<f64>,
        targets: &ArrayView2<f64>,
    ) -> Result<(), ForestError> {
        self.distribution.update(routing, targets)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ForestError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn options(trees: usize, depth: usize, tasks: usize) -> ForestOptions {
        ForestOptions::default()
            .trees(NonZeroUsize::new(trees).expect("never fails"))
            .depth(NonZeroUsize::new(depth).expect("never fails"))
            .tasks(NonZeroUsize::new(tasks).expect("never fails"))
            .seed(7)
    }

    fn sample_input() -> ndarray::Array2<f64> {
        array![
            [0.1, -0.4, 1.3, 0.8, -1.1, 0.0, 0.5, -0.9],
            [2.0, 0.3, -0.2, 1.5, 0.7, -1.8, 0.9, 0.4],
            [-0.6, 1.1, 0.2, -0.3, 0.6, 1.9, -1.2, 0.1],
        ]
    }

    #[test]
    fn routing_tensor_matches_update_contract() -> Result<(), anyhow::Error> {
        let mut forest = Forest::new(8, options(3, 3, 2))?;
        let x = sample_input();
        let (prediction, routing) = forest.predict(&x.view())?;
        assert_eq!(prediction.dim(), (3, 2));
        assert_eq!(routing.dim(), (3, 3, 4));

        for tree in 0..3 {
            for row in 0..3 {
                let total = routing.slice(s![row, tree, ..]).sum();
                assert!((total - 1.0).abs() < 1e-12);
            }
        }

        // The routing output feeds straight back into the EM update.
        let y = array![[0.5, 1.5], [2.5, 0.5], [1.0, 1.0]];
        forest.update_distribution(&routing.view(), &y.view())?;
        Ok(())
    }

    #[test]
    fn prediction_is_linear_in_leaf_means() -> Result<(), anyhow::Error> {
        let mut forest = Forest::new(8, options(3, 3, 2))?;
        let x = sample_input();

        let means = array![
            [1.0, -2.0],
            [0.5, 0.5],
            [-1.5, 3.0],
            [2.0, 1.0],
        ];
        let mut sigmas = Array3::zeros((4, 2, 2));
        for leaf in 0..4 {
            sigmas[[leaf, 0, 0]] = 1.0;
            sigmas[[leaf, 1, 1]] = 1.0;
        }

        forest
            .distribution_mut()
            .init_from_clusters(&means.view(), &sigmas.view())?;
        let (p1, _) = forest.predict(&x.view())?;

        let doubled = means.mapv(|m| m * 2.0);
        forest
            .distribution_mut()
            .init_from_clusters(&doubled.view(), &sigmas.view())?;
        let (p2, _) = forest.predict(&x.view())?;

        for (a, b) in p1.iter().zip(p2.iter()) {
            assert!((b - 2.0 * a).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn parallel_prediction_matches_serial() -> Result<(), anyhow::Error> {
        let forest = Forest::new(8, options(4, 3, 2))?;
        let x = sample_input();
        let (serial, routing_s) = forest.predict(&x.view())?;
        let (parallel, routing_p) = forest.predict_parallel(&x.view())?;
        assert_eq!(serial, parallel);
        assert_eq!(routing_s, routing_p);
        Ok(())
    }

    #[test]
    fn seeded_forests_are_reproducible() -> Result<(), anyhow::Error> {
        let a = Forest::new(8, options(2, 3, 2))?;
        let b = Forest::new(8, options(2, 3, 2))?;
        let x = sample_input();
        assert_eq!(a.predict(&x.view())?.0, b.predict(&x.view())?.0);
        Ok(())
    }

    #[test]
    fn construction_fails_when_features_run_out() {
        // Depth 4 needs 7 distinct features per tree.
        assert!(matches!(
            Forest::new(6, options(2, 4, 2)),
            Err(ForestError::Tree(TreeError::NotEnoughFeatures { .. }))
        ));
    }
}
