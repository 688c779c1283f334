pub use cluster::{cluster_targets, ClusterError};
pub use forest::{Forest, ForestError, ForestOptions};
pub use leaf_distribution::{DistributionError, LeafDistribution, PersistError, EM_ITERATIONS};
pub use tree::{SoftTree, TreeError};

pub mod functions;

mod cluster;
mod forest;
mod leaf_distribution;
mod tree;
