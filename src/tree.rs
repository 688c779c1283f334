use crate::functions;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom as _;
use rand::Rng;
use std::num::NonZeroUsize;
use thiserror::Error;

/// A soft binary decision tree. Each internal node reads one input feature
/// through a fixed one-hot projection and turns its value into a sigmoid
/// split probability; a leaf's routing probability is the product of the
/// split probabilities along its root-to-leaf path.
#[derive(Debug, Clone)]
pub struct SoftTree {
    depth: usize,
    n_leaf: usize,
    // `[features_len, leaves_len - 1]`, one-hot columns in level order.
    // Fixed at construction, never updated by any training signal.
    feature_mask: Array2<f64>,
}

impl SoftTree {
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        depth: NonZeroUsize,
        features_len: usize,
    ) -> Result<Self, TreeError> {
        let depth = depth.get();
        let n_leaf = 1 << (depth - 1);
        let n_node = n_leaf - 1;
        if n_node > features_len {
            return Err(TreeError::NotEnoughFeatures {
                depth,
                required: n_node,
                available: features_len,
            });
        }

        let candidates = (0..features_len).collect::<Vec<_>>();
        let mut feature_mask = Array2::zeros((features_len, n_node));
        for (node, &feature) in candidates.choose_multiple(rng, n_node).enumerate() {
            feature_mask[[feature, node]] = 1.0;
        }

        Ok(Self {
            depth,
            n_leaf,
            feature_mask,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn leaves_len(&self) -> usize {
        self.n_leaf
    }

    pub fn features_len(&self) -> usize {
        self.feature_mask.nrows()
    }

    pub fn route(&self, x: &ArrayView1<f64>) -> Result<Array1<f64>, TreeError> {
        let batch = x.to_owned().insert_axis(Axis(0));
        let mu = self.route_batch(&batch.view())?;
        Ok(mu.index_axis(Axis(0), 0).to_owned())
    }

    /// Routing probabilities for a whole batch: `[rows, leaves_len]`,
    /// non-negative, each row summing to one.
    ///
    /// Deep trees multiply many probabilities per path, so very small leaf
    /// masses can underflow; no rescaling is applied.
    pub fn route_batch(&self, x: &ArrayView2<f64>) -> Result<Array2<f64>, TreeError> {
        if x.ncols() != self.features_len() {
            return Err(TreeError::FeatureLenMismatch {
                expected: self.features_len(),
                actual: x.ncols(),
            });
        }

        let rows = x.nrows();
        let scores = x.dot(&self.feature_mask);

        // Double the probability mass vector once per level: each node at the
        // current level splits its mass between a left (1 - sigmoid) and a
        // right (sigmoid) child.
        let mut mu = Array2::ones((rows, 1));
        let mut level_start = 0;
        for level in 0..self.depth - 1 {
            let width = 1 << level;
            let mut next = Array2::zeros((rows, width * 2));
            for node in 0..width {
                for row in 0..rows {
                    let go_right = functions::sigmoid(scores[[row, level_start + node]]);
                    let mass = mu[[row, node]];
                    next[[row, node * 2]] = mass * (1.0 - go_right);
                    next[[row, node * 2 + 1]] = mass * go_right;
                }
            }
            mu = next;
            level_start += width;
        }

        Ok(mu)
    }
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error(
        "a tree of depth {depth} splits on {required} distinct features, \
         but only {available} are available"
    )]
    NotEnoughFeatures {
        depth: usize,
        required: usize,
        available: usize,
    },

    #[error("input has {actual} features, but the tree was built for {expected}")]
    FeatureLenMismatch { expected: usize, actual: usize },
}
