//! Approximate nearest neighbour search over embedding rows.
//!
//! Two backends sit behind [`ApproxNN`]: a forest of random projection trees stored
//! as a single file, and k-means partitions with 8-bit scalar quantization stored as
//! a directory of arrays. The backend is picked at build time from [`ApproxNnParams`]
//! and must be named again when loading.

mod partitions;
mod trees;

pub(crate) use partitions::is_index_dir as is_partitions_dir;
pub use partitions::PartitionIndex;
pub use trees::TreeIndex;

use crate::error::{Error, Result};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    /// `sqrt(2 - 2 cos(a, b))`, the euclidean distance of the normalized vectors.
    Angular,
}

impl Metric {

    /// Distance between two vectors; angular distance involving a zero vector is NaN.
    pub fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
        match self {
            Metric::Euclidean => a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt(),
            Metric::Angular => {
                let cos = a.dot(&b) / (a.dot(&a).sqrt() * b.dot(&b).sqrt());
                (2.0 - 2.0 * cos).max(0.0).sqrt()
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => write!(f, "euclidean"),
            Metric::Angular => write!(f, "angular"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnBackendKind {
    Trees,
    Partitions,
}

impl fmt::Display for AnnBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnBackendKind::Trees => write!(f, "trees"),
            AnnBackendKind::Partitions => write!(f, "partitions"),
        }
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Metric> {
        match s {
            "euclidean" => Ok(Metric::Euclidean),
            "angular" => Ok(Metric::Angular),
            _ => Err(Error::config(format!("unknown metric {:?}, expected euclidean or angular", s))),
        }
    }
}

impl FromStr for AnnBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<AnnBackendKind> {
        match s {
            "trees" => Ok(AnnBackendKind::Trees),
            "partitions" => Ok(AnnBackendKind::Partitions),
            _ => Err(Error::config(format!("unknown backend {:?}, expected trees or partitions", s))),
        }
    }
}

fn default_metric() -> Metric { Metric::Euclidean }

/// Build parameters. Fields of the backend that is not selected are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproxNnParams {
    pub backend: AnnBackendKind,
    #[serde(default = "default_metric")]
    pub metric: Metric,
    #[serde(default)]
    pub seed: u64,
    // trees
    pub n_trees: Option<usize>,
    pub search_k: Option<usize>,
    pub leaf_size: Option<usize>,
    // partitions
    pub num_leaves_scaling: Option<f64>,
    pub num_leaves_to_search: Option<usize>,
    pub training_sample_size: Option<usize>,
    pub reorder_num_neighbours: Option<usize>,
}

impl ApproxNnParams {

    fn empty(backend: AnnBackendKind, metric: Metric) -> Self {
        Self {
            backend,
            metric,
            seed: 0,
            n_trees: None,
            search_k: None,
            leaf_size: None,
            num_leaves_scaling: None,
            num_leaves_to_search: None,
            training_sample_size: None,
            reorder_num_neighbours: None,
        }
    }

    pub fn trees(n_trees: usize, metric: Metric) -> ApproxNnParams {
        Self { n_trees: Some(n_trees), ..ApproxNnParams::empty(AnnBackendKind::Trees, metric) }
    }

    pub fn partitions(num_leaves_scaling: f64, metric: Metric) -> ApproxNnParams {
        Self { num_leaves_scaling: Some(num_leaves_scaling), ..ApproxNnParams::empty(AnnBackendKind::Partitions, metric) }
    }
}

/// What to search around: a free vector or an indexed item.
#[derive(Clone, Copy, Debug)]
pub enum Query<'a> {
    Vector(ArrayView1<'a, f32>),
    Item(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbour {
    pub id: usize,
    pub distance: f32,
}

// NaN distances sort last, equal distances by ascending id
pub(crate) fn cmp_neighbours(a: &Neighbour, b: &Neighbour) -> Ordering {
    let key = |d: f32| if d.is_nan() { f32::INFINITY } else { d };
    key(a.distance).total_cmp(&key(b.distance)).then_with(|| a.id.cmp(&b.id))
}

/// Exact distances from `query` to the `candidates` rows of `data`, best `k` kept.
pub(crate) fn rerank(
    data: ArrayView2<f32>,
    metric: Metric,
    query: ArrayView1<f32>,
    candidates: impl IntoIterator<Item = usize>,
    k: usize,
) -> Vec<Neighbour> {
    let mut seen = HashSet::new();
    let mut scored: Vec<Neighbour> = candidates
        .into_iter()
        .filter(|id| seen.insert(*id))
        .map(|id| Neighbour { id, distance: metric.distance(query, data.row(id)) })
        .collect();
    scored.sort_by(cmp_neighbours);
    scored.truncate(k);
    scored
}

/// Brute force k nearest neighbours, the baseline approximate results are measured against.
pub fn exact_nearest_neighbours(data: ArrayView2<f32>, query: ArrayView1<f32>, k: usize, metric: Metric) -> Vec<Neighbour> {
    rerank(data, metric, query, 0..data.nrows(), k)
}

/// Rows scaled to unit L2 norm, zero rows are left as they are.
pub fn normalize_rows(data: ArrayView2<f32>) -> Array2<f32> {
    let mut normalized = data.to_owned();
    for mut row in normalized.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|x| x / norm);
        }
    }
    normalized
}

pub(crate) fn normalize(v: ArrayView1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 { v.mapv(|x| x / norm) } else { v.to_owned() }
}

fn check_data(data: ArrayView2<f32>) -> Result<()> {
    if data.nrows() == 0 || data.ncols() == 0 {
        return Err(Error::config(format!("cannot index an empty {:?} matrix", data.dim())));
    }
    if data.iter().any(|x| !x.is_finite()) {
        return Err(Error::config("data to index contains non-finite values"));
    }
    Ok(())
}

pub enum ApproxNN {
    Trees(TreeIndex),
    Partitions(PartitionIndex),
}

impl ApproxNN {

    /// Builds the backend selected by `params.backend` over the rows of `data`.
    pub fn build(data: ArrayView2<f32>, params: &ApproxNnParams) -> Result<ApproxNN> {
        check_data(data)?;
        match params.backend {
            AnnBackendKind::Trees => Ok(ApproxNN::Trees(TreeIndex::build(data, params)?)),
            AnnBackendKind::Partitions => Ok(ApproxNN::Partitions(PartitionIndex::build(data, params)?)),
        }
    }

    /// A single `.ann` file for trees, a directory for partitions.
    pub fn save(&self, path: &Path) -> Result<()> {
        match self {
            ApproxNN::Trees(index) => index.save(path),
            ApproxNN::Partitions(index) => index.save(path),
        }
    }

    pub fn load(path: &Path, kind: AnnBackendKind, dim: usize, metric: Metric, prefault: bool) -> Result<ApproxNN> {
        let found = if path.is_dir() { AnnBackendKind::Partitions } else { AnnBackendKind::Trees };
        if path.exists() && found != kind {
            return Err(Error::IndexMismatch { what: "backend", expected: kind.to_string(), found: found.to_string() });
        }
        match kind {
            AnnBackendKind::Trees => Ok(ApproxNN::Trees(TreeIndex::load(path, dim, metric, prefault)?)),
            AnnBackendKind::Partitions => Ok(ApproxNN::Partitions(PartitionIndex::load(path, dim, metric)?)),
        }
    }

    pub fn kind(&self) -> AnnBackendKind {
        match self {
            ApproxNN::Trees(_) => AnnBackendKind::Trees,
            ApproxNN::Partitions(_) => AnnBackendKind::Partitions,
        }
    }

    fn data(&self) -> ArrayView2<'_, f32> {
        match self {
            ApproxNN::Trees(index) => index.data(),
            ApproxNN::Partitions(index) => index.data(),
        }
    }

    pub fn metric(&self) -> Metric {
        match self {
            ApproxNN::Trees(index) => index.metric(),
            ApproxNN::Partitions(index) => index.metric(),
        }
    }

    pub fn len(&self) -> usize {
        self.data().nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.data().ncols()
    }

    pub fn get_item_vector(&self, id: usize) -> Result<Array1<f32>> {
        if id >= self.len() {
            return Err(Error::config(format!("item {} out of range [0, {})", id, self.len())));
        }
        Ok(self.data().row(id).to_owned())
    }

    /// The `k` nearest items, closest first. An item query includes the item itself.
    pub fn search(&self, query: Query<'_>, k: usize) -> Result<Vec<Neighbour>> {
        let item;
        let vector = match query {
            Query::Vector(ref v) => v.view(),
            Query::Item(id) => {
                item = self.get_item_vector(id)?;
                item.view()
            }
        };
        if vector.len() != self.dim() {
            return Err(Error::config(format!("query of dimension {} on an index of dimension {}", vector.len(), self.dim())));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        Ok(match self {
            ApproxNN::Trees(index) => index.search(vector, k),
            ApproxNN::Partitions(index) => index.search(vector, k),
        })
    }

    pub fn search_ids(&self, query: Query<'_>, k: usize) -> Result<Vec<usize>> {
        Ok(self.search(query, k)?.into_iter().map(|n| n.id).collect())
    }
}
