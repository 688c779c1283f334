use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView4};
use std::f64::consts::PI;

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn softmax(xs: &ArrayView1<f64>) -> Array1<f64> {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps = xs.mapv(|x| (x - max).exp());
    let total = exps.sum();
    exps / total
}

pub fn mean(xs: impl Iterator<Item = f64>) -> f64 {
    let mut count = 0;
    let mut total = 0.0;
    for x in xs {
        count += 1;
        total += x;
    }
    assert_ne!(count, 0);
    total / count as f64
}

/// Multivariate normal density of every target row under every `(tree, leaf)`
/// Gaussian. A non-positive-definite or non-finite covariance yields zero
/// density for its `(tree, leaf)` pair instead of an error.
pub fn gaussian_densities(
    y: &ArrayView2<f64>,
    mean: &ArrayView4<f64>,
    sigma: &ArrayView4<f64>,
) -> Array3<f64> {
    let (n_tree, n_leaf, tasks, _) = mean.dim();
    let n_sample = y.nrows();
    let mut densities = Array3::zeros((n_sample, n_tree, n_leaf));

    for tree in 0..n_tree {
        for leaf in 0..n_leaf {
            let mu = mean.slice(s![tree, leaf, .., 0]);
            let cov = sigma.slice(s![tree, leaf, .., ..]);
            let chol = match cholesky(&cov) {
                Some(chol) => chol,
                None => continue,
            };
            let det_sqrt = (0..tasks).map(|i| chol[[i, i]]).product::<f64>();
            let scale = 1.0 / ((2.0 * PI).powf(tasks as f64 / 2.0) * det_sqrt);
            if !scale.is_finite() {
                continue;
            }

            for sample in 0..n_sample {
                // Solve `L v = y - mu` by forward substitution; the quadratic
                // form is then the squared norm of `v`.
                let mut v = vec![0.0; tasks];
                let mut quad = 0.0;
                for i in 0..tasks {
                    let mut sum = y[[sample, i]] - mu[i];
                    for j in 0..i {
                        sum -= chol[[i, j]] * v[j];
                    }
                    v[i] = sum / chol[[i, i]];
                    quad += v[i] * v[i];
                }
                let density = scale * (-0.5 * quad).exp();
                if density.is_finite() {
                    densities[[sample, tree, leaf]] = density;
                }
            }
        }
    }

    densities
}

/// Lower Cholesky factor, reading only the lower triangle. Returns `None` for
/// matrices that are not (numerically) positive definite.
fn cholesky(m: &ArrayView2<f64>) -> Option<Array2<f64>> {
    let n = m.nrows();
    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = m[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if !sum.is_finite() || sum <= 0.0 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    if l.iter().all(|v| v.is_finite()) {
        Some(l)
    } else {
        None
    }
}
