use super::{normalize, normalize_rows, rerank, ApproxNnParams, Metric, Neighbour};
use crate::error::{Error, Result};

use memmap2::MmapOptions;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

const TREE_MAGIC: &[u8; 8] = b"W2VANNT\0";
const TREE_FORMAT_VERSION: u32 = 1;
const DEFAULT_LEAF_SIZE: usize = 32;
const TWO_MEANS_ITERATIONS: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Node {
    // items with `normal · x + offset > 0` go right
    Split { normal: Vec<f32>, offset: f32, left: usize, right: usize },
    Leaf { items: Vec<usize> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
    root: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TreeHeader {
    dim: usize,
    metric: Metric,
    n_items: usize,
    n_trees: usize,
    leaf_size: usize,
}

fn margin(normal: &[f32], offset: f32, v: ArrayView1<f32>) -> f32 {
    normal.iter().zip(v.iter()).map(|(n, x)| n * x).sum::<f32>() + offset
}

fn squared_distance(a: &[f32], b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

struct TreeBuilder<'a> {
    // normalized rows for angular, raw rows for euclidean
    space: ArrayView2<'a, f32>,
    metric: Metric,
    leaf_size: usize,
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {

    // hyperplane between two centres found by an online two-means over random items
    fn two_means(&self, ids: &[usize], rng: &mut StdRng) -> (Vec<f32>, f32) {
        let n = ids.len();
        let i = rng.gen_range(0..n);
        let mut j = rng.gen_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        let mut p: Vec<f32> = self.space.row(ids[i]).to_vec();
        let mut q: Vec<f32> = self.space.row(ids[j]).to_vec();
        let (mut ic, mut jc) = (1.0f32, 1.0f32);

        for _ in 0..TWO_MEANS_ITERATIONS {
            let v = self.space.row(ids[rng.gen_range(0..n)]);
            let di = ic * squared_distance(&p, v);
            let dj = jc * squared_distance(&q, v);
            if di < dj {
                p.iter_mut().zip(v.iter()).for_each(|(c, x)| *c = (*c * ic + x) / (ic + 1.0));
                ic += 1.0;
            } else if dj < di {
                q.iter_mut().zip(v.iter()).for_each(|(c, x)| *c = (*c * jc + x) / (jc + 1.0));
                jc += 1.0;
            }
        }

        let normal: Vec<f32> = p.iter().zip(&q).map(|(a, b)| a - b).collect();
        let offset = match self.metric {
            Metric::Angular => 0.0,
            Metric::Euclidean => -normal.iter().zip(p.iter().zip(&q)).map(|(n, (a, b))| n * (a + b) / 2.0).sum::<f32>(),
        };
        (normal, offset)
    }

    fn build_node(&mut self, mut ids: Vec<usize>, rng: &mut StdRng) -> usize {

        if ids.len() <= self.leaf_size {
            self.nodes.push(Node::Leaf { items: ids });
            return self.nodes.len() - 1;
        }

        let (normal, offset) = self.two_means(&ids, rng);
        let (mut left, mut right): (Vec<usize>, Vec<usize>) =
            ids.iter().copied().partition(|id| margin(&normal, offset, self.space.row(*id)) <= 0.0);

        // duplicates or a degenerate plane, fall back to a random halving
        if left.is_empty() || right.is_empty() {
            ids.shuffle(rng);
            right = ids.split_off(ids.len() / 2);
            left = ids;
        }

        let left = self.build_node(left, rng);
        let right = self.build_node(right, rng);
        self.nodes.push(Node::Split { normal, offset, left, right });
        self.nodes.len() - 1
    }
}

// max-heap entry, the largest margin is explored first
#[derive(Clone, Copy, Debug)]
struct Frontier {
    priority: f32,
    tree: usize,
    node: usize,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Forest of random projection trees over the indexed rows.
pub struct TreeIndex {
    data: Array2<f32>,
    metric: Metric,
    trees: Vec<Tree>,
    leaf_size: usize,
    search_k: Option<usize>,
}

impl TreeIndex {

    pub(super) fn build(data: ArrayView2<f32>, params: &ApproxNnParams) -> Result<TreeIndex> {

        let n_trees = params
            .n_trees
            .ok_or(Error::MissingParameter { backend: "trees", parameter: "n_trees" })?;
        if n_trees == 0 {
            return Err(Error::config("n_trees must be positive"));
        }
        let leaf_size = params.leaf_size.unwrap_or(DEFAULT_LEAF_SIZE).max(1);
        let metric = params.metric;

        let normalized;
        let space = match metric {
            Metric::Angular => {
                normalized = normalize_rows(data);
                normalized.view()
            }
            Metric::Euclidean => data.view(),
        };

        // each tree has its own rng, so the forest does not depend on the thread schedule
        let trees: Vec<Tree> = (0..n_trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let mut builder = TreeBuilder { space, metric, leaf_size, nodes: Vec::new() };
                let root = builder.build_node((0..space.nrows()).collect(), &mut rng);
                Tree { nodes: builder.nodes, root }
            })
            .collect();

        info!("built {} trees over {} items of dimension {}", n_trees, data.nrows(), data.ncols());
        Ok(Self { data: data.to_owned(), metric, trees, leaf_size, search_k: params.search_k })
    }

    pub(super) fn data(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub(super) fn metric(&self) -> Metric {
        self.metric
    }

    // distinct items collected before reranking, by default one leaf per tree for small k
    fn candidate_budget(&self, k: usize) -> usize {
        self.search_k.unwrap_or(self.trees.len() * k.max(self.leaf_size)).max(k)
    }

    pub(super) fn search(&self, query: ArrayView1<f32>, k: usize) -> Vec<Neighbour> {

        let search_k = self.candidate_budget(k);
        let query_space: Array1<f32> = match self.metric {
            Metric::Angular => normalize(query),
            Metric::Euclidean => query.to_owned(),
        };

        let mut heap: BinaryHeap<Frontier> = self
            .trees
            .iter()
            .enumerate()
            .map(|(tree, t)| Frontier { priority: f32::INFINITY, tree, node: t.root })
            .collect();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut candidates: Vec<usize> = Vec::new();

        while candidates.len() < search_k {
            let Some(Frontier { priority, tree, node }) = heap.pop() else { break };
            match &self.trees[tree].nodes[node] {
                Node::Leaf { items } => candidates.extend(items.iter().copied().filter(|&id| seen.insert(id))),
                Node::Split { normal, offset, left, right } => {
                    let m = margin(normal, *offset, query_space.view());
                    heap.push(Frontier { priority: priority.min(m), tree, node: *right });
                    heap.push(Frontier { priority: priority.min(-m), tree, node: *left });
                }
            }
        }

        rerank(self.data.view(), self.metric, query, candidates, k)
    }

    fn header(&self) -> TreeHeader {
        TreeHeader {
            dim: self.data.ncols(),
            metric: self.metric,
            n_items: self.data.nrows(),
            n_trees: self.trees.len(),
            leaf_size: self.leaf_size,
        }
    }

    pub(super) fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = BufWriter::new(File::create(path)?);
        f.write_all(TREE_MAGIC)?;
        f.write_all(&TREE_FORMAT_VERSION.to_le_bytes())?;
        bincode::serialize_into(&mut f, &self.header())?;
        bincode::serialize_into(&mut f, &(&self.data, &self.trees))?;
        f.flush()?;
        info!("saved tree index to {}", path.display());
        Ok(())
    }

    pub(super) fn load(path: &Path, dim: usize, metric: Metric, prefault: bool) -> Result<TreeIndex> {

        let file = File::open(path)?;
        let mut options = MmapOptions::new();
        if prefault {
            options.populate();
        }
        // safety: read-only mapping of an index file that is not modified after saving
        let mmap = unsafe { options.map(&file)? };

        let header_len = TREE_MAGIC.len() + 4;
        if mmap.len() < header_len || &mmap[..TREE_MAGIC.len()] != TREE_MAGIC {
            return Err(Error::config(format!("{} is not a tree index", path.display())));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&mmap[TREE_MAGIC.len()..header_len]);
        let version = u32::from_le_bytes(version);
        if version != TREE_FORMAT_VERSION {
            return Err(Error::IndexMismatch {
                what: "format version",
                expected: TREE_FORMAT_VERSION.to_string(),
                found: version.to_string(),
            });
        }

        let mut body: &[u8] = &mmap[header_len..];
        let header: TreeHeader = bincode::deserialize_from(&mut body)?;
        if header.dim != dim {
            return Err(Error::IndexMismatch { what: "dimensionality", expected: dim.to_string(), found: header.dim.to_string() });
        }
        if header.metric != metric {
            return Err(Error::IndexMismatch { what: "metric", expected: metric.to_string(), found: header.metric.to_string() });
        }

        let (data, trees): (Array2<f32>, Vec<Tree>) = bincode::deserialize_from(&mut body)?;
        if data.dim() != (header.n_items, header.dim) || trees.len() != header.n_trees {
            return Err(Error::config(format!("{} does not match its header", path.display())));
        }
        Ok(Self { data, metric, trees, leaf_size: header.leaf_size, search_k: None })
    }
}


#[cfg(test)]
mod tests {

    use super::super::tests::{clustered, recall};
    use super::super::{ApproxNN, AnnBackendKind, Query};
    use super::*;

    #[test]
    fn leaves_hold_every_item_once() {
        let data = clustered(500, 8, 10, 1);
        let params = ApproxNnParams { leaf_size: Some(16), ..ApproxNnParams::trees(3, Metric::Euclidean) };
        let index = TreeIndex::build(data.view(), &params).unwrap();

        for tree in &index.trees {
            let mut items: Vec<usize> = tree
                .nodes
                .iter()
                .filter_map(|node| match node {
                    Node::Leaf { items } => {
                        assert!(items.len() <= 16);
                        Some(items.clone())
                    }
                    Node::Split { .. } => None,
                })
                .flatten()
                .collect();
            items.sort_unstable();
            assert_eq!(items, (0..500).collect::<Vec<_>>());
        }
    }

    #[test]
    fn duplicate_rows_still_split() {
        let data = Array2::<f32>::ones((100, 4));
        let params = ApproxNnParams { leaf_size: Some(8), search_k: Some(100), ..ApproxNnParams::trees(2, Metric::Euclidean) };
        let index = ApproxNN::build(data.view(), &params).unwrap();
        assert_eq!(index.search(Query::Item(5), 10).unwrap().len(), 10);
    }

    #[test]
    fn recall_on_clustered_data() {
        let data = clustered(2000, 16, 40, 7);
        for metric in [Metric::Euclidean, Metric::Angular] {
            let params = ApproxNnParams { search_k: Some(400), ..ApproxNnParams::trees(10, metric) };
            let index = ApproxNN::build(data.view(), &params).unwrap();
            let r = recall(&index, &data, 50, 10);
            assert!(r >= 0.9, "{} recall {}", metric, r);
        }
    }

    #[test]
    fn recall_with_default_search_k() {
        let data = normalize_rows(clustered(10_000, 300, 100, 21).view());
        for metric in [Metric::Euclidean, Metric::Angular] {
            let index = TreeIndex::build(data.view(), &ApproxNnParams::trees(10, metric)).unwrap();
            // 320 of 10000 items are reranked
            assert_eq!(index.candidate_budget(10), 320);
            assert_eq!(index.candidate_budget(50), 500);

            let index = ApproxNN::Trees(index);
            let r = recall(&index, &data, 100, 10);
            assert!(r >= 0.9, "{} recall {}", metric, r);
        }
    }

    #[test]
    fn items_seen_in_several_trees_are_counted_once() {
        // the query's leaf is the same cluster in every tree
        let data = clustered(64, 4, 2, 8);
        let params = ApproxNnParams { search_k: Some(64), ..ApproxNnParams::trees(4, Metric::Euclidean) };
        let index = ApproxNN::build(data.view(), &params).unwrap();
        let mut found = index.search_ids(Query::Item(3), 64).unwrap();
        assert_eq!(found[0], 3);
        found.sort_unstable();
        assert_eq!(found, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn queries_are_deterministic() {
        let data = clustered(300, 8, 6, 3);
        let index = ApproxNN::build(data.view(), &ApproxNnParams::trees(4, Metric::Angular)).unwrap();
        let query = data.row(17);
        let first = index.search(Query::Vector(query), 10).unwrap();
        for _ in 0..5 {
            assert_eq!(index.search(Query::Vector(query), 10).unwrap(), first);
        }

        // same seed, same forest
        let again = ApproxNN::build(data.view(), &ApproxNnParams::trees(4, Metric::Angular)).unwrap();
        assert_eq!(again.search(Query::Vector(query), 10).unwrap(), first);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("word2vec_toy_annoy_index.ann");
        let data = clustered(200, 6, 5, 4);
        let index = ApproxNN::build(data.view(), &ApproxNnParams::trees(3, Metric::Euclidean)).unwrap();
        index.save(&path).unwrap();

        for prefault in [false, true] {
            let loaded = ApproxNN::load(&path, AnnBackendKind::Trees, 6, Metric::Euclidean, prefault).unwrap();
            assert_eq!(loaded.len(), 200);
            assert_eq!(loaded.dim(), 6);
            assert_eq!(loaded.get_item_vector(9).unwrap(), data.row(9));
            for i in [0, 50, 199] {
                assert_eq!(loaded.search(Query::Item(i), 5).unwrap(), index.search(Query::Item(i), 5).unwrap());
            }
        }

        assert!(matches!(
            ApproxNN::load(&path, AnnBackendKind::Trees, 7, Metric::Euclidean, false),
            Err(Error::IndexMismatch { what: "dimensionality", .. })
        ));
        assert!(matches!(
            ApproxNN::load(&path, AnnBackendKind::Trees, 6, Metric::Angular, false),
            Err(Error::IndexMismatch { what: "metric", .. })
        ));

        let garbage = dir.path().join("garbage.ann");
        std::fs::write(&garbage, b"not an index").unwrap();
        assert!(ApproxNN::load(&garbage, AnnBackendKind::Trees, 6, Metric::Euclidean, false).is_err());
    }
}
