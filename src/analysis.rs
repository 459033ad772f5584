use crate::ann::{ApproxNN, Query};
use crate::error::{Error, Result};

use ndarray::Array1;
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Words grouped by cluster label, labels ascending.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterWords {
    pub labels: Vec<i64>,
    pub words: Vec<Vec<String>>,
    pub sizes: Vec<usize>,
}

pub fn words_in_clusters(cluster_labels: &[i64], words: &[String]) -> Result<ClusterWords> {

    if cluster_labels.len() != words.len() {
        return Err(Error::config(format!("{} cluster labels for {} words", cluster_labels.len(), words.len())));
    }

    let mut clusters: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for (label, word) in cluster_labels.iter().zip(words) {
        clusters.entry(*label).or_default().push(word.clone());
    }

    let sizes = clusters.values().map(Vec::len).collect();
    let (labels, words) = clusters.into_iter().unzip();
    Ok(ClusterWords { labels, words, sizes })
}

// maximum likelihood estimate from sorted neighbour distances T_1..T_k
fn levina_bickel(distances: &Array1<f64>) -> f64 {
    let k = distances.len();
    if k < 2 || distances.iter().any(|d| !d.is_finite() || *d <= 0.0) {
        return f64::NAN;
    }
    let t_k = match distances.max() {
        Ok(t_k) => *t_k,
        Err(_) => return f64::NAN,
    };
    let sum: f64 = distances.iter().take(k - 1).map(|t_j| (t_k / t_j).ln()).sum();
    if sum <= 0.0 {
        return f64::NAN;
    }
    (k - 1) as f64 / sum
}

/// Local intrinsic dimension of item `id` from its `k` nearest neighbours, itself excluded.
/// Degenerate neighbourhoods (`k < 2`, duplicate points) give NaN.
pub fn local_intrinsic_dimension(approx_nn: &ApproxNN, id: usize, k: usize) -> Result<f64> {
    let neighbours = approx_nn.search(Query::Item(id), k + 1)?;
    let distances: Array1<f64> = neighbours
        .iter()
        .filter(|n| n.id != id)
        .take(k)
        .map(|n| n.distance as f64)
        .collect();
    if distances.len() < k {
        return Ok(f64::NAN);
    }
    Ok(levina_bickel(&distances))
}

pub fn intrinsic_dimensions(approx_nn: &ApproxNN, ids: &[usize], k: usize) -> Result<Vec<f64>> {
    ids.par_iter().map(|id| local_intrinsic_dimension(approx_nn, *id, k)).collect()
}
