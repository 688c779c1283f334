use crate::functions;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2};
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom as _;
use rand::Rng;
use thiserror::Error;

/// Lloyd's k-means over target vectors, returning one `(mean, covariance)`
/// pair per cluster: `([clusters, tasks], [clusters, tasks, tasks])`. The
/// output is shaped to feed `LeafDistribution::init_from_clusters` with one
/// cluster per leaf.
pub fn cluster_targets<R: Rng + ?Sized>(
    rng: &mut R,
    y: &ArrayView2<f64>,
    clusters: usize,
    iterations: usize,
) -> Result<(Array2<f64>, Array3<f64>), ClusterError> {
    let samples = y.nrows();
    let tasks = y.ncols();
    if clusters == 0 || samples < clusters {
        return Err(ClusterError::TooFewSamples { samples, clusters });
    }

    let rows = (0..samples).collect::<Vec<_>>();
    let mut centroids = Array2::zeros((clusters, tasks));
    for (cluster, &row) in rows.choose_multiple(rng, clusters).enumerate() {
        centroids.row_mut(cluster).assign(&y.row(row));
    }

    let mut assignment = vec![0; samples];
    for _ in 0..iterations {
        for (sample, slot) in assignment.iter_mut().enumerate() {
            *slot = (0..clusters)
                .min_by_key(|&c| OrderedFloat(squared_distance(&y.row(sample), &centroids.row(c))))
                .expect("never fails");
        }

        for cluster in 0..clusters {
            let members = assignment
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c == cluster)
                .map(|(sample, _)| sample)
                .collect::<Vec<_>>();
            // An emptied cluster keeps its previous centroid.
            if members.is_empty() {
                continue;
            }
            for task in 0..tasks {
                centroids[[cluster, task]] =
                    functions::mean(members.iter().map(|&sample| y[[sample, task]]));
            }
        }
    }

    let mut sigmas = Array3::zeros((clusters, tasks, tasks));
    for cluster in 0..clusters {
        let members = assignment
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == cluster)
            .map(|(sample, _)| sample)
            .collect::<Vec<_>>();
        if members.is_empty() {
            // Nothing to estimate from; fall back to a unit covariance.
            for task in 0..tasks {
                sigmas[[cluster, task, task]] = 1.0;
            }
            continue;
        }
        for &sample in &members {
            for i in 0..tasks {
                let ri = y[[sample, i]] - centroids[[cluster, i]];
                for j in 0..tasks {
                    let rj = y[[sample, j]] - centroids[[cluster, j]];
                    sigmas[[cluster, i, j]] += ri * rj;
                }
            }
        }
        let count = members.len() as f64;
        for i in 0..tasks {
            for j in 0..tasks {
                sigmas[[cluster, i, j]] /= count;
            }
        }
    }

    Ok((centroids, sigmas))
}

fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cannot form {clusters} clusters from {samples} samples")]
    TooFewSamples { samples: usize, clusters: usize },
}
