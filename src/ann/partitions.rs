use super::{cmp_neighbours, normalize, normalize_rows, rerank, AnnBackendKind, ApproxNnParams, Metric, Neighbour};
use crate::error::{Error, Result};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_npy::{read_npy, write_npy};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

const PARTITIONS_FORMAT_VERSION: u32 = 1;
const KMEANS_ITERATIONS: usize = 25;
const DEFAULT_REORDER_NUM_NEIGHBOURS: usize = 100;

const CENTROIDS_FILE: &str = "centroids.npy";
const DATASET_FILE: &str = "dataset.npy";
const CODES_FILE: &str = "codes.npy";
const QUANTIZATION_MIN_FILE: &str = "quantization_min.npy";
const QUANTIZATION_SCALE_FILE: &str = "quantization_scale.npy";
const ASSIGNMENTS_FILE: &str = "partition_assignments.npy";
const CONFIG_FILE: &str = "index_config.json";

/// Whether `dir` holds a saved partition index.
pub(crate) fn is_index_dir(dir: &Path) -> bool {
    dir.join(CONFIG_FILE).is_file()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PartitionConfig {
    format_version: u32,
    backend: AnnBackendKind,
    metric: Metric,
    dim: usize,
    n_items: usize,
    num_leaves: usize,
    num_leaves_to_search: usize,
    reorder_num_neighbours: usize,
}

fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    Zip::from(&a).and(&b).fold(0.0, |acc, x, y| acc + (x - y) * (x - y))
}

fn nearest_centroid(point: ArrayView1<f32>, centroids: ArrayView2<f32>) -> usize {
    let mut best = (0, f32::INFINITY);
    for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best.0
}

fn assign(points: ArrayView2<f32>, centroids: ArrayView2<f32>) -> Vec<usize> {
    (0..points.nrows())
        .into_par_iter()
        .map(|i| nearest_centroid(points.row(i), centroids))
        .collect()
}

/// Lloyd iterations from `k` distinct sample points; an emptied cluster keeps its centre.
fn kmeans(sample: ArrayView2<f32>, k: usize, rng: &mut StdRng) -> Array2<f32> {

    let init = index::sample(rng, sample.nrows(), k).into_vec();
    let mut centroids = sample.select(Axis(0), &init);
    let mut assignments: Vec<usize> = Vec::new();

    for iteration in 0..KMEANS_ITERATIONS {
        let next = assign(sample, centroids.view());
        if next == assignments {
            debug!("k-means converged after {} iterations", iteration);
            break;
        }
        assignments = next;

        let mut sums = Array2::<f64>::zeros(centroids.dim());
        let mut counts = vec![0usize; k];
        for (point, cluster) in sample.axis_iter(Axis(0)).zip(&assignments) {
            sums.row_mut(*cluster).zip_mut_with(&point, |s, x| *s += *x as f64);
            counts[*cluster] += 1;
        }
        for (cluster, count) in counts.iter().enumerate() {
            if *count > 0 {
                let mean = sums.row(cluster).mapv(|s| (s / *count as f64) as f32);
                centroids.row_mut(cluster).assign(&mean);
            }
        }
    }
    centroids
}

/// k-means partitions of the indexed rows, scored with 8-bit quantized codes and
/// re-ranked exactly.
pub struct PartitionIndex {
    metric: Metric,
    dataset: Array2<f32>,
    centroids: Array2<f32>,
    codes: Array2<u8>,
    quantization_min: Array1<f32>,
    quantization_scale: Array1<f32>,
    partitions: Vec<Vec<usize>>,
    assignments: Array1<u64>,
    num_leaves_to_search: usize,
    reorder_num_neighbours: usize,
}

impl PartitionIndex {

    pub(super) fn build(data: ArrayView2<f32>, params: &ApproxNnParams) -> Result<PartitionIndex> {

        let scaling = params
            .num_leaves_scaling
            .ok_or(Error::MissingParameter { backend: "partitions", parameter: "num_leaves_scaling" })?;
        if !(scaling.is_finite() && scaling > 0.0) {
            return Err(Error::config(format!("num_leaves_scaling must be positive, got {}", scaling)));
        }

        let n = data.nrows();
        let num_leaves = ((n as f64).sqrt() * scaling).round().clamp(1.0, n as f64) as usize;
        let num_leaves_to_search = params.num_leaves_to_search.unwrap_or((num_leaves / 10).max(1)).clamp(1, num_leaves);
        let reorder_num_neighbours = params.reorder_num_neighbours.unwrap_or(DEFAULT_REORDER_NUM_NEIGHBOURS).max(1);
        let sample_size = params.training_sample_size.unwrap_or(n).clamp(num_leaves, n);

        // angular search runs on the unit sphere, where euclidean order equals angular order
        let space = match params.metric {
            Metric::Angular => normalize_rows(data),
            Metric::Euclidean => data.to_owned(),
        };

        let mut rng = StdRng::seed_from_u64(params.seed);
        let sample_ids = index::sample(&mut rng, n, sample_size).into_vec();
        let sample = space.select(Axis(0), &sample_ids);
        let centroids = kmeans(sample.view(), num_leaves, &mut rng);

        let assigned = assign(space.view(), centroids.view());
        let mut partitions = vec![Vec::new(); num_leaves];
        for (id, leaf) in assigned.iter().enumerate() {
            partitions[*leaf].push(id);
        }
        let assignments: Array1<u64> = assigned.iter().map(|a| *a as u64).collect();

        let (quantization_min, quantization_scale) = PartitionIndex::quantization_range(space.view());
        let codes = PartitionIndex::quantize(space.view(), &quantization_min, &quantization_scale);

        info!(
            "built {} partitions over {} items of dimension {}, searching {} of them",
            num_leaves, n, data.ncols(), num_leaves_to_search
        );
        Ok(Self {
            metric: params.metric,
            dataset: data.to_owned(),
            centroids,
            codes,
            quantization_min,
            quantization_scale,
            partitions,
            assignments,
            num_leaves_to_search,
            reorder_num_neighbours,
        })
    }

    // per dimension minimum and step of the 256 levels
    fn quantization_range(space: ArrayView2<f32>) -> (Array1<f32>, Array1<f32>) {
        let min = space.fold_axis(Axis(0), f32::INFINITY, |a, x| f32::min(*a, *x));
        let max = space.fold_axis(Axis(0), f32::NEG_INFINITY, |a, x| f32::max(*a, *x));
        let scale = Zip::from(&min).and(&max).map_collect(|lo, hi| (hi - lo) / 255.0);
        (min, scale)
    }

    fn quantize(space: ArrayView2<f32>, min: &Array1<f32>, scale: &Array1<f32>) -> Array2<u8> {
        let mut codes = Array2::<u8>::zeros(space.dim());
        Zip::from(codes.rows_mut()).and(space.rows()).for_each(|mut code, row| {
            Zip::from(&mut code).and(&row).and(min).and(scale).for_each(|c, x, lo, s| {
                *c = if *s > 0.0 { ((x - lo) / s).round().clamp(0.0, 255.0) as u8 } else { 0 };
            });
        });
        codes
    }

    fn quantized_distance(&self, query: ArrayView1<f32>, id: usize) -> f32 {
        Zip::from(&query)
            .and(self.codes.row(id))
            .and(&self.quantization_min)
            .and(&self.quantization_scale)
            .fold(0.0, |acc, q, c, lo, s| {
                let x = lo + *c as f32 * s;
                acc + (q - x) * (q - x)
            })
    }

    pub(super) fn data(&self) -> ArrayView2<'_, f32> {
        self.dataset.view()
    }

    pub(super) fn metric(&self) -> Metric {
        self.metric
    }

    pub fn num_leaves(&self) -> usize {
        self.centroids.nrows()
    }

    pub(super) fn search(&self, query: ArrayView1<f32>, k: usize) -> Vec<Neighbour> {

        let query_space = match self.metric {
            Metric::Angular => normalize(query),
            Metric::Euclidean => query.to_owned(),
        };

        let mut leaves: Vec<Neighbour> = self
            .centroids
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(id, c)| Neighbour { id, distance: squared_distance(query_space.view(), c) })
            .collect();
        leaves.sort_by(cmp_neighbours);
        leaves.truncate(self.num_leaves_to_search);

        let mut scored: Vec<Neighbour> = leaves
            .iter()
            .flat_map(|leaf| self.partitions[leaf.id].iter())
            .map(|id| Neighbour { id: *id, distance: self.quantized_distance(query_space.view(), *id) })
            .collect();
        scored.sort_by(cmp_neighbours);
        scored.truncate(self.reorder_num_neighbours.max(k));

        rerank(self.dataset.view(), self.metric, query, scored.into_iter().map(|n| n.id), k)
    }

    fn config(&self) -> PartitionConfig {
        PartitionConfig {
            format_version: PARTITIONS_FORMAT_VERSION,
            backend: AnnBackendKind::Partitions,
            metric: self.metric,
            dim: self.dataset.ncols(),
            n_items: self.dataset.nrows(),
            num_leaves: self.num_leaves(),
            num_leaves_to_search: self.num_leaves_to_search,
            reorder_num_neighbours: self.reorder_num_neighbours,
        }
    }

    pub(super) fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        write_npy(dir.join(CENTROIDS_FILE), &self.centroids)?;
        write_npy(dir.join(DATASET_FILE), &self.dataset)?;
        write_npy(dir.join(CODES_FILE), &self.codes)?;
        write_npy(dir.join(QUANTIZATION_MIN_FILE), &self.quantization_min)?;
        write_npy(dir.join(QUANTIZATION_SCALE_FILE), &self.quantization_scale)?;
        write_npy(dir.join(ASSIGNMENTS_FILE), &self.assignments)?;

        let mut f = BufWriter::new(File::create(dir.join(CONFIG_FILE))?);
        serde_json::to_writer_pretty(&mut f, &self.config())?;
        f.flush()?;
        info!("saved partition index to {}", dir.display());
        Ok(())
    }

    pub(super) fn load(dir: &Path, dim: usize, metric: Metric) -> Result<PartitionIndex> {

        let config: PartitionConfig = serde_json::from_reader(BufReader::new(File::open(dir.join(CONFIG_FILE))?))?;
        if config.format_version != PARTITIONS_FORMAT_VERSION {
            return Err(Error::IndexMismatch {
                what: "format version",
                expected: PARTITIONS_FORMAT_VERSION.to_string(),
                found: config.format_version.to_string(),
            });
        }
        if config.backend != AnnBackendKind::Partitions {
            return Err(Error::IndexMismatch { what: "backend", expected: "partitions".to_string(), found: config.backend.to_string() });
        }
        if config.dim != dim {
            return Err(Error::IndexMismatch { what: "dimensionality", expected: dim.to_string(), found: config.dim.to_string() });
        }
        if config.metric != metric {
            return Err(Error::IndexMismatch { what: "metric", expected: metric.to_string(), found: config.metric.to_string() });
        }

        let centroids: Array2<f32> = read_npy(dir.join(CENTROIDS_FILE))?;
        let dataset: Array2<f32> = read_npy(dir.join(DATASET_FILE))?;
        let codes: Array2<u8> = read_npy(dir.join(CODES_FILE))?;
        let quantization_min: Array1<f32> = read_npy(dir.join(QUANTIZATION_MIN_FILE))?;
        let quantization_scale: Array1<f32> = read_npy(dir.join(QUANTIZATION_SCALE_FILE))?;
        let assignments: Array1<u64> = read_npy(dir.join(ASSIGNMENTS_FILE))?;

        let n = config.n_items;
        let consistent = dataset.dim() == (n, dim)
            && codes.dim() == (n, dim)
            && centroids.dim() == (config.num_leaves, dim)
            && quantization_min.len() == dim
            && quantization_scale.len() == dim
            && assignments.len() == n
            && assignments.iter().all(|a| (*a as usize) < config.num_leaves);
        if !consistent {
            return Err(Error::config(format!("arrays in {} do not match {}", dir.display(), CONFIG_FILE)));
        }

        let mut partitions = vec![Vec::new(); config.num_leaves];
        for (id, leaf) in assignments.iter().enumerate() {
            partitions[*leaf as usize].push(id);
        }

        Ok(Self {
            metric,
            dataset,
            centroids,
            codes,
            quantization_min,
            quantization_scale,
            partitions,
            assignments,
            num_leaves_to_search: config.num_leaves_to_search.clamp(1, config.num_leaves),
            reorder_num_neighbours: config.reorder_num_neighbours.max(1),
        })
    }
}
