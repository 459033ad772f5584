use crate::ann::{is_partitions_dir, AnnBackendKind, ApproxNN, Metric};
use crate::config::files_handling::{self, read_gz_bytes, write_gz_bytes, ReadFile, SaveFile};
use crate::error::{Error, Result};
use crate::sgns::{LossScale, ModelWeights, Word2VecConfig};

use memmap2::{Mmap, MmapOptions};
use ndarray::{Array2, ArrayView2};
use ndarray_npy::ViewNpyExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const SNAPSHOT_MAGIC: &[u8; 8] = b"W2VSGNS\0";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Names of every file a training run writes to its output directory.
#[derive(Clone, Debug)]
pub struct ModelPaths {
    output_dir: PathBuf,
    model_id: String,
}

impl ModelPaths {

    pub fn new(output_dir: &Path, model_name: &str, dataset_name: &str) -> ModelPaths {
        Self {
            output_dir: output_dir.to_path_buf(),
            model_id: format!("{}_{}", model_name, dataset_name),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn training_conf(&self) -> PathBuf {
        self.output_dir.join(format!("{}.conf", self.model_id))
    }

    pub fn checkpoint(&self, epoch_nr: usize) -> PathBuf {
        self.output_dir.join(format!("{}_{:02}.model", self.model_id, epoch_nr))
    }

    pub fn intermediate_embedding_weights(&self, epoch_nr: usize, sub_epoch_nr: usize) -> PathBuf {
        self.output_dir.join(format!("{}_{:02}_{:02}_weights.npy", self.model_id, epoch_nr, sub_epoch_nr))
    }

    pub fn words(&self) -> PathBuf {
        self.output_dir.join(format!("{}_words.txt", self.model_id))
    }

    pub fn word_counts(&self) -> PathBuf {
        self.output_dir.join(format!("{}_word_counts.txt", self.model_id))
    }

    pub fn train_logs(&self) -> PathBuf {
        self.output_dir.join(format!("{}_logs.csv", self.model_id))
    }

    /// `{model}_{dataset}_{suffix}.ann` for trees, the directory `{model}_{dataset}_{suffix}` for partitions.
    pub fn ann_index(&self, kind: AnnBackendKind, suffix: &str) -> PathBuf {
        match kind {
            AnnBackendKind::Trees => self.output_dir.join(format!("{}_{}.ann", self.model_id, suffix)),
            AnnBackendKind::Partitions => self.output_dir.join(format!("{}_{}", self.model_id, suffix)),
        }
    }
}

fn parse_number(digits: &str) -> Option<usize> {
    if digits.len() >= 2 && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Files of one model found in an output directory, checkpoints ordered first to last.
#[derive(Clone, Debug, Default)]
pub struct ModelCheckpointFiles {
    pub model_training_conf: PathBuf,
    pub models: Vec<(usize, PathBuf)>,
    pub intermediate_embedding_weights: Vec<((usize, usize), PathBuf)>,
    pub words: Option<PathBuf>,
    pub word_counts: Option<PathBuf>,
    pub train_logs: Option<PathBuf>,
    /// Trees index files and partitions index directories, each sorted by name.
    pub trees_indexes: Vec<PathBuf>,
    pub partitions_indexes: Vec<PathBuf>,
}

impl ModelCheckpointFiles {

    pub fn discover(output_dir: &Path, model_name: &str, dataset_name: &str) -> Result<ModelCheckpointFiles> {

        let paths = ModelPaths::new(output_dir, model_name, dataset_name);
        let prefix = format!("{}_", paths.model_id());
        let mut found = ModelCheckpointFiles {
            model_training_conf: paths.training_conf(),
            ..Default::default()
        };

        for entry in fs::read_dir(output_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else { continue };

            if let Some(epoch) = rest.strip_suffix(".model").and_then(parse_number) {
                found.models.push((epoch, entry.path()));
            } else if rest.len() > ".ann".len() && rest.ends_with(".ann") && entry.file_type()?.is_file() {
                found.trees_indexes.push(entry.path());
            } else if entry.file_type()?.is_dir() && is_partitions_dir(&entry.path()) {
                found.partitions_indexes.push(entry.path());
            } else if let Some(numbers) = rest.strip_suffix("_weights.npy") {
                let parsed = numbers
                    .split_once('_')
                    .and_then(|(e, s)| Some((parse_number(e)?, parse_number(s)?)));
                if let Some(key) = parsed {
                    found.intermediate_embedding_weights.push((key, entry.path()));
                }
            }
        }

        found.models.sort();
        found.intermediate_embedding_weights.sort();
        found.trees_indexes.sort();
        found.partitions_indexes.sort();

        let exists = |p: PathBuf| if p.is_file() { Some(p) } else { None };
        found.words = exists(paths.words());
        found.word_counts = exists(paths.word_counts());
        found.train_logs = exists(paths.train_logs());
        Ok(found)
    }

    pub fn last_model(&self) -> Option<&(usize, PathBuf)> {
        self.models.last()
    }

    pub fn last_intermediate_embedding_weights(&self) -> Option<&((usize, usize), PathBuf)> {
        self.intermediate_embedding_weights.last()
    }

    pub fn last_ann_index(&self, kind: AnnBackendKind) -> Option<&PathBuf> {
        match kind {
            AnnBackendKind::Trees => self.trees_indexes.last(),
            AnnBackendKind::Partitions => self.partitions_indexes.last(),
        }
    }
}

/// Resumable training state: hyper-parameters, vocabulary and flat weight arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub config: Word2VecConfig,
    pub words: Vec<String>,
    pub word_counts: Vec<u64>,
    pub corpus_size: u64,
    /// Number of the last completed epoch.
    pub epoch_nr: usize,
    pub loss_scale: LossScale,
    pub weights: ModelWeights,
}

impl ModelSnapshot {

    pub fn save(&self, file_path: &Path) -> Result<()> {
        files_handling::save_output(file_path, self)
    }

    pub fn load(file_path: &Path) -> Result<ModelSnapshot> {
        files_handling::read_input::<ModelSnapshot>(file_path)
    }

    fn corrupt(file_path: &Path, reason: impl Into<String>) -> Error {
        Error::CorruptCheckpoint { path: file_path.to_path_buf(), reason: reason.into() }
    }
}

impl SaveFile for ModelSnapshot {
    fn save_file(&self, file_path: &Path) -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        bincode::serialize_into(&mut buf, self)?;
        write_gz_bytes(file_path, &buf)
    }
}

impl ReadFile for ModelSnapshot {
    fn read_file(file_path: &Path) -> Result<Self> {

        // a missing checkpoint stays an i/o error, anything unreadable after that is corruption
        let buf = match read_gz_bytes(file_path) {
            Ok(buf) => buf,
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => return Err(Error::Io(e)),
            Err(e) => return Err(ModelSnapshot::corrupt(file_path, e.to_string())),
        };

        let header_len = SNAPSHOT_MAGIC.len() + 4;
        if buf.len() < header_len || &buf[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err(ModelSnapshot::corrupt(file_path, "not a model checkpoint"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&buf[SNAPSHOT_MAGIC.len()..header_len]);
        let version = u32::from_le_bytes(version);
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(ModelSnapshot::corrupt(
                file_path,
                format!("unsupported format version {} (expected {})", version, SNAPSHOT_FORMAT_VERSION),
            ));
        }

        bincode::deserialize(&buf[header_len..]).map_err(|e| ModelSnapshot::corrupt(file_path, e.to_string()))
    }
}

/// Read-only memory map of a `.npy` embedding file.
pub struct MappedEmbeddings {
    mmap: Mmap,
}

impl MappedEmbeddings {

    pub fn open(file_path: &Path) -> Result<MappedEmbeddings> {
        let file = File::open(file_path)?;
        // safety: the mapping is read-only and snapshots are never rewritten in place
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let mapped = Self { mmap };
        mapped.view()?;
        Ok(mapped)
    }

    pub fn view(&self) -> Result<ArrayView2<'_, f64>> {
        Ok(ArrayView2::<f64>::view_npy(&self.mmap[..])?)
    }
}

pub enum EmbeddingWeights {
    Owned(Array2<f64>),
    Mapped(MappedEmbeddings),
}

impl EmbeddingWeights {

    pub fn view(&self) -> Result<ArrayView2<'_, f64>> {
        match self {
            EmbeddingWeights::Owned(w) => Ok(w.view()),
            EmbeddingWeights::Mapped(m) => m.view(),
        }
    }

    pub fn to_f32(&self) -> Result<Array2<f32>> {
        Ok(self.view()?.mapv(|x| x as f32))
    }
}

/// Output of a finished (or interrupted) training run, as consumed by analysis code.
pub struct TrainingOutput {
    pub last_embedding_weights: EmbeddingWeights,
    pub last_embedding_weights_filepath: PathBuf,
    /// Rows of the last weights scaled to unit length, zero rows left as they are.
    pub last_embedding_weights_normalized: Option<Array2<f64>>,
    pub trees_index: Option<ApproxNN>,
    pub trees_index_filepath: Option<PathBuf>,
    pub partitions_index: Option<ApproxNN>,
    pub partitions_index_filepath: Option<PathBuf>,
    pub words: Vec<String>,
    pub word_to_int: HashMap<String, usize>,
    pub word_counts: Vec<u64>,
}

/// What [`load_model_training_output_with`] loads besides the weights and the vocabulary.
#[derive(Clone, Copy, Debug)]
pub struct TrainingOutputOptions {
    /// Memory map the last `.npy` snapshot instead of reading it.
    pub mmap: bool,
    pub normalized: bool,
    /// Load the last trees index of the run, if there is one.
    pub trees_index: bool,
    pub trees_prefault: bool,
    /// Load the last partitions index of the run, if there is one.
    pub partitions_index: bool,
    /// Metric the indexes were built with.
    pub ann_metric: Metric,
}

impl Default for TrainingOutputOptions {
    fn default() -> Self {
        Self {
            mmap: true,
            normalized: false,
            trees_index: false,
            trees_prefault: false,
            partitions_index: false,
            ann_metric: Metric::Euclidean,
        }
    }
}

fn normalized_rows(weights: ArrayView2<f64>) -> Array2<f64> {
    let mut normalized = weights.to_owned();
    for mut row in normalized.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|x| x / norm);
        }
    }
    normalized
}

/// Loads the last embedding snapshot (memory mapped when `mmap` is set) together with
/// the words and word counts of a training run. Without `.npy` snapshots the target
/// weights of the last `.model` checkpoint are used.
pub fn load_model_training_output(
    output_dir: &Path,
    model_name: &str,
    dataset_name: &str,
    mmap: bool,
) -> Result<TrainingOutput> {
    let options = TrainingOutputOptions { mmap, ..Default::default() };
    load_model_training_output_with(output_dir, model_name, dataset_name, &options)
}

/// Like [`load_model_training_output`], optionally adding the normalized weights and the
/// last approximate nearest neighbour indexes found in the output directory. Index paths
/// are reported whenever an index exists; a requested index that does not exist is `None`.
pub fn load_model_training_output_with(
    output_dir: &Path,
    model_name: &str,
    dataset_name: &str,
    options: &TrainingOutputOptions,
) -> Result<TrainingOutput> {

    let mmap = options.mmap;
    let files = ModelCheckpointFiles::discover(output_dir, model_name, dataset_name)?;
    let paths = ModelPaths::new(output_dir, model_name, dataset_name);

    let (last_embedding_weights, last_embedding_weights_filepath) = match files.last_intermediate_embedding_weights() {
        Some((_, path)) if mmap => (EmbeddingWeights::Mapped(MappedEmbeddings::open(path)?), path.clone()),
        Some((_, path)) => (EmbeddingWeights::Owned(files_handling::read_input::<Array2<f64>>(path)?), path.clone()),
        None => match files.last_model() {
            Some((_, path)) => {
                let snapshot = ModelSnapshot::load(path)?;
                (EmbeddingWeights::Owned(snapshot.weights.target.mapv(f64::from)), path.clone())
            }
            None => {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no embedding weights for {} in {}", paths.model_id(), output_dir.display()),
                )))
            }
        },
    };

    let words = files_handling::read_input::<Vec<String>>(&paths.words())?;
    let word_counts = files_handling::read_input::<Vec<u64>>(&paths.word_counts())?;
    let rows = last_embedding_weights.view()?.nrows();
    if words.len() != word_counts.len() || words.len() != rows {
        return Err(Error::config(format!(
            "{} words, {} word counts and {} embedding rows are not aligned",
            words.len(), word_counts.len(), rows
        )));
    }
    let word_to_int = words.iter().enumerate().map(|(i, w)| (w.clone(), i)).collect();

    let last_embedding_weights_normalized = match options.normalized {
        true => Some(normalized_rows(last_embedding_weights.view()?)),
        false => None,
    };

    let dim = last_embedding_weights.view()?.ncols();
    let trees_index_filepath = files.last_ann_index(AnnBackendKind::Trees).cloned();
    let trees_index = match &trees_index_filepath {
        Some(path) if options.trees_index => {
            Some(ApproxNN::load(path, AnnBackendKind::Trees, dim, options.ann_metric, options.trees_prefault)?)
        }
        _ => None,
    };
    let partitions_index_filepath = files.last_ann_index(AnnBackendKind::Partitions).cloned();
    let partitions_index = match &partitions_index_filepath {
        Some(path) if options.partitions_index => {
            Some(ApproxNN::load(path, AnnBackendKind::Partitions, dim, options.ann_metric, false)?)
        }
        _ => None,
    };

    Ok(TrainingOutput {
        last_embedding_weights,
        last_embedding_weights_filepath,
        last_embedding_weights_normalized,
        trees_index,
        trees_index_filepath,
        partitions_index,
        partitions_index_filepath,
        words,
        word_to_int,
        word_counts,
    })
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::ann::{ApproxNnParams, Query};
    use crate::sgns::Precision;
    use ndarray::array;

    fn snapshot() -> ModelSnapshot {
        ModelSnapshot {
            config: Word2VecConfig { embedding_dim: 2, ..Word2VecConfig::default() },
            words: vec!["a".to_string(), "b".to_string()],
            word_counts: vec![3, 1],
            corpus_size: 4,
            epoch_nr: 3,
            loss_scale: LossScale::new(Precision::Full),
            weights: ModelWeights {
                target: array![[0.1, 0.2], [0.3, 0.4]],
                context: array![[0.0, 0.0], [1.0, -1.0]],
            },
        }
    }

    #[test]
    fn file_names_are_zero_padded() {
        let paths = ModelPaths::new(Path::new("out"), "word2vec", "enwiki");
        assert_eq!(paths.checkpoint(3), Path::new("out/word2vec_enwiki_03.model"));
        assert_eq!(
            paths.intermediate_embedding_weights(12, 4),
            Path::new("out/word2vec_enwiki_12_04_weights.npy")
        );
        assert_eq!(paths.training_conf(), Path::new("out/word2vec_enwiki.conf"));
        assert_eq!(paths.train_logs(), Path::new("out/word2vec_enwiki_logs.csv"));
        assert_eq!(paths.words(), Path::new("out/word2vec_enwiki_words.txt"));
        assert_eq!(paths.word_counts(), Path::new("out/word2vec_enwiki_word_counts.txt"));
        assert_eq!(
            paths.ann_index(AnnBackendKind::Trees, "annoy_index"),
            Path::new("out/word2vec_enwiki_annoy_index.ann")
        );
        assert_eq!(paths.ann_index(AnnBackendKind::Partitions, "scann"), Path::new("out/word2vec_enwiki_scann"));
    }

    #[test]
    fn discovery_orders_by_epoch_and_sub_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::new(dir.path(), "word2vec", "enwiki");
        for (e, s) in [(2, 1), (1, 2), (10, 1), (1, 10), (2, 2)] {
            fs::write(paths.intermediate_embedding_weights(e, s), b"").unwrap();
        }
        for e in [10, 2, 1] {
            fs::write(paths.checkpoint(e), b"").unwrap();
        }
        // other models and datasets must not be picked up
        fs::write(dir.path().join("word2vec_enwiki2_01.model"), b"").unwrap();
        fs::write(dir.path().join("other_enwiki_05.model"), b"").unwrap();
        fs::write(paths.words(), "a").unwrap();

        let found = ModelCheckpointFiles::discover(dir.path(), "word2vec", "enwiki").unwrap();
        let epochs: Vec<usize> = found.models.iter().map(|(e, _)| *e).collect();
        assert_eq!(epochs, vec![1, 2, 10]);
        let keys: Vec<(usize, usize)> = found.intermediate_embedding_weights.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 2), (1, 10), (2, 1), (2, 2), (10, 1)]);
        assert_eq!(found.last_intermediate_embedding_weights().unwrap().1, paths.intermediate_embedding_weights(10, 1));
        assert_eq!(found.words, Some(paths.words()));
        assert_eq!(found.word_counts, None);
        assert_eq!(found.train_logs, None);
        assert!(found.trees_indexes.is_empty() && found.partitions_indexes.is_empty());
    }

    fn write_vocab(paths: &ModelPaths) {
        files_handling::save_output(&paths.words(), ["a".to_string(), "b".to_string(), "c".to_string()].as_slice())
            .unwrap();
        files_handling::save_output(&paths.word_counts(), [3u64, 2, 1].as_slice()).unwrap();
    }

    #[test]
    fn discovery_finds_ann_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::new(dir.path(), "word2vec", "toy");
        let data: Array2<f32> = array![[1.0, 0.0], [0.0, 1.0], [0.6, 0.8]];
        for suffix in ["b_index", "a_index"] {
            let index = ApproxNN::build(data.view(), &ApproxNnParams::trees(2, Metric::Euclidean)).unwrap();
            index.save(&paths.ann_index(AnnBackendKind::Trees, suffix)).unwrap();
        }
        let index = ApproxNN::build(data.view(), &ApproxNnParams::partitions(1.0, Metric::Euclidean)).unwrap();
        index.save(&paths.ann_index(AnnBackendKind::Partitions, "scann")).unwrap();

        // not indexes of this run
        fs::create_dir(dir.path().join("word2vec_toy_notes")).unwrap();
        fs::write(dir.path().join("word2vec_other_x.ann"), b"").unwrap();
        fs::write(dir.path().join("word2vec_toy_.ann"), b"").unwrap();

        let found = ModelCheckpointFiles::discover(dir.path(), "word2vec", "toy").unwrap();
        assert_eq!(
            found.trees_indexes,
            vec![paths.ann_index(AnnBackendKind::Trees, "a_index"), paths.ann_index(AnnBackendKind::Trees, "b_index")]
        );
        assert_eq!(found.partitions_indexes, vec![paths.ann_index(AnnBackendKind::Partitions, "scann")]);
        assert_eq!(found.last_ann_index(AnnBackendKind::Trees), Some(&paths.ann_index(AnnBackendKind::Trees, "b_index")));
    }

    #[test]
    fn training_output_loads_normalized_weights_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::new(dir.path(), "word2vec", "toy");
        write_vocab(&paths);
        let weights: Array2<f64> = array![[3.0, 4.0], [0.0, 0.0], [0.0, -2.0]];
        files_handling::save_output(&paths.intermediate_embedding_weights(1, 1), &weights).unwrap();

        // nothing extra unless asked for
        let plain = load_model_training_output(dir.path(), "word2vec", "toy", true).unwrap();
        assert!(plain.last_embedding_weights_normalized.is_none());
        assert!(plain.trees_index.is_none() && plain.trees_index_filepath.is_none());
        assert!(plain.partitions_index.is_none() && plain.partitions_index_filepath.is_none());

        let rows: Array2<f32> = array![[0.6, 0.8], [1.0, 0.0], [0.0, -1.0]];
        let trees_path = paths.ann_index(AnnBackendKind::Trees, "annoy_index");
        ApproxNN::build(rows.view(), &ApproxNnParams::trees(2, Metric::Angular)).unwrap().save(&trees_path).unwrap();
        let partitions_path = paths.ann_index(AnnBackendKind::Partitions, "scann");
        ApproxNN::build(rows.view(), &ApproxNnParams::partitions(1.0, Metric::Angular))
            .unwrap()
            .save(&partitions_path)
            .unwrap();

        let options = TrainingOutputOptions {
            normalized: true,
            trees_index: true,
            trees_prefault: true,
            partitions_index: true,
            ann_metric: Metric::Angular,
            ..Default::default()
        };
        let output = load_model_training_output_with(dir.path(), "word2vec", "toy", &options).unwrap();
        let normalized = output.last_embedding_weights_normalized.unwrap();
        assert_eq!(normalized, array![[0.6, 0.8], [0.0, 0.0], [0.0, -1.0]]);
        assert_eq!(output.trees_index_filepath, Some(trees_path));
        assert_eq!(output.partitions_index_filepath, Some(partitions_path.clone()));
        for index in [output.trees_index.unwrap(), output.partitions_index.unwrap()] {
            assert_eq!(index.len(), 3);
            assert_eq!(index.metric(), Metric::Angular);
            assert_eq!(index.search_ids(Query::Item(2), 1).unwrap(), vec![2]);
        }

        // paths are reported without loading
        let paths_only = load_model_training_output(dir.path(), "word2vec", "toy", false).unwrap();
        assert_eq!(paths_only.partitions_index_filepath, Some(partitions_path));
        assert!(paths_only.partitions_index.is_none());

        // an index built with another metric is not silently accepted
        let euclidean = TrainingOutputOptions { trees_index: true, ..Default::default() };
        assert!(matches!(
            load_model_training_output_with(dir.path(), "word2vec", "toy", &euclidean),
            Err(Error::IndexMismatch { what: "metric", .. })
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("word2vec_test_03.model");
        let original = snapshot();
        original.save(&path).unwrap();
        assert_eq!(ModelSnapshot::load(&path).unwrap(), original);
    }

    #[test]
    fn missing_and_corrupt_snapshots_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.model");
        assert!(matches!(ModelSnapshot::load(&missing), Err(Error::Io(_))));

        let garbage = dir.path().join("garbage.model");
        fs::write(&garbage, b"definitely not gzip").unwrap();
        assert!(matches!(ModelSnapshot::load(&garbage), Err(Error::CorruptCheckpoint { .. })));

        let wrong_magic = dir.path().join("wrong_magic.model");
        write_gz_bytes(&wrong_magic, b"0123456789abcdef").unwrap();
        assert!(matches!(ModelSnapshot::load(&wrong_magic), Err(Error::CorruptCheckpoint { .. })));

        let truncated = dir.path().join("truncated.model");
        let mut buf = SNAPSHOT_MAGIC.to_vec();
        buf.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        write_gz_bytes(&truncated, &buf).unwrap();
        assert!(matches!(ModelSnapshot::load(&truncated), Err(Error::CorruptCheckpoint { .. })));

        let future = dir.path().join("future.model");
        let mut buf = SNAPSHOT_MAGIC.to_vec();
        buf.extend_from_slice(&(SNAPSHOT_FORMAT_VERSION + 1).to_le_bytes());
        write_gz_bytes(&future, &buf).unwrap();
        assert!(matches!(ModelSnapshot::load(&future), Err(Error::CorruptCheckpoint { .. })));
    }

    #[test]
    fn training_output_prefers_last_snapshot_and_maps_it() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::new(dir.path(), "word2vec", "toy");
        files_handling::save_output(&paths.words(), ["a".to_string(), "b".to_string()].as_slice()).unwrap();
        files_handling::save_output(&paths.word_counts(), [3u64, 1].as_slice()).unwrap();
        let first: Array2<f64> = array![[1.0, 0.0], [0.0, 1.0]];
        let last: Array2<f64> = array![[2.0, 0.0], [0.0, 2.0]];
        files_handling::save_output(&paths.intermediate_embedding_weights(1, 1), &first).unwrap();
        files_handling::save_output(&paths.intermediate_embedding_weights(1, 2), &last).unwrap();

        let output = load_model_training_output(dir.path(), "word2vec", "toy", true).unwrap();
        assert!(matches!(output.last_embedding_weights, EmbeddingWeights::Mapped(_)));
        assert_eq!(output.last_embedding_weights.view().unwrap(), last.view());
        assert_eq!(output.last_embedding_weights_filepath, paths.intermediate_embedding_weights(1, 2));
        assert_eq!(output.word_to_int["b"], 1);
        assert_eq!(output.word_counts, vec![3, 1]);

        let owned = load_model_training_output(dir.path(), "word2vec", "toy", false).unwrap();
        assert!(matches!(owned.last_embedding_weights, EmbeddingWeights::Owned(_)));
    }

    #[test]
    fn training_output_falls_back_to_last_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::new(dir.path(), "word2vec", "toy");
        files_handling::save_output(&paths.words(), ["a".to_string(), "b".to_string()].as_slice()).unwrap();
        files_handling::save_output(&paths.word_counts(), [3u64, 1].as_slice()).unwrap();
        snapshot().save(&paths.checkpoint(3)).unwrap();

        let output = load_model_training_output(dir.path(), "word2vec", "toy", true).unwrap();
        assert_eq!(output.last_embedding_weights_filepath, paths.checkpoint(3));
        let view = output.last_embedding_weights.view().unwrap();
        assert!((view[[1, 1]] - 0.4).abs() < 1e-6);
    }
}
