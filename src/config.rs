pub mod files_handling;

use crate::ann::ApproxNnParams;
use crate::error::{Error, Result};
use crate::sgns::{Precision, Word2VecConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

fn default_model_name() -> String { "word2vec".to_string() }
fn default_vocab_size() -> i64 { -1 }
fn default_min_word_count() -> u64 { 1 }
fn default_embedding_dim() -> usize { 300 }
fn default_learning_rate() -> f32 { 0.025 }
fn default_min_learning_rate() -> f32 { 0.0000025 }
fn default_batch_size() -> usize { 256 }
fn default_n_epochs() -> usize { 5 }
fn default_max_window_size() -> usize { 2 }
fn default_num_negative_samples() -> usize { 15 }
fn default_unigram_exponent() -> f64 { 0.75 }
fn default_sampling_factor() -> f64 { 1e-5 }
fn default_starting_epoch_nr() -> usize { 1 }
fn default_true() -> bool { true }
fn default_initial_loss_scale() -> f32 { 32768.0 }
fn default_output_filepath_suffix() -> String { "annoy_index".to_string() }

/// Parameters of one training run, read from the json file given on the command line.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub text_files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub dataset_name: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: i64,
    #[serde(default = "default_min_word_count")]
    pub min_word_count: u64,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_min_learning_rate")]
    pub min_learning_rate: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,
    #[serde(default = "default_num_negative_samples")]
    pub num_negative_samples: usize,
    #[serde(default = "default_unigram_exponent")]
    pub unigram_exponent_negative_sampling: f64,
    #[serde(default = "default_sampling_factor")]
    pub sampling_factor: f64,
    #[serde(default)]
    pub mixed_precision: bool,
    #[serde(default = "default_initial_loss_scale")]
    pub initial_loss_scale: f32,
    #[serde(default = "default_starting_epoch_nr")]
    pub starting_epoch_nr: usize,
    #[serde(default)]
    pub intermediate_embedding_weights_saves: usize,
    #[serde(default = "default_true")]
    pub train_logs_to_file: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub resume_checkpoint: Option<PathBuf>,
}

impl RunConfig {

    pub fn from_json_file(path: &Path) -> Result<RunConfig> {
        let f = BufReader::new(File::open(path)?);
        let config: RunConfig = serde_json::from_reader(f)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.text_files.is_empty() {
            return Err(Error::config("text_files must name at least one file"));
        }
        if self.dataset_name.is_empty() || self.model_name.is_empty() {
            return Err(Error::config("model_name and dataset_name must be non-empty"));
        }
        if self.vocab_size == 0 || self.vocab_size < -1 {
            return Err(Error::config(format!("vocab_size must be positive or -1, got {}", self.vocab_size)));
        }
        if self.starting_epoch_nr == 0 {
            return Err(Error::config("starting_epoch_nr counts from 1"));
        }
        if self.n_epochs == 0 {
            return Err(Error::config("n_epochs must be positive"));
        }
        self.word2vec_config().validate()
    }

    pub fn word2vec_config(&self) -> Word2VecConfig {
        let precision = if self.mixed_precision {
            Precision::Mixed { initial_loss_scale: self.initial_loss_scale }
        } else {
            Precision::Full
        };
        Word2VecConfig {
            embedding_dim: self.embedding_dim,
            learning_rate: self.learning_rate,
            min_learning_rate: self.min_learning_rate,
            batch_size: self.batch_size,
            max_window_size: self.max_window_size,
            num_negative_samples: self.num_negative_samples,
            unigram_exponent_negative_sampling: self.unigram_exponent_negative_sampling,
            sampling_factor: self.sampling_factor,
            model_name: self.model_name.clone(),
            precision,
            seed: self.seed,
        }
    }

    /// `None` keeps every word of the corpus.
    pub fn max_vocab_size(&self) -> Option<usize> {
        if self.vocab_size < 0 { None } else { Some(self.vocab_size as usize) }
    }
}

impl Display for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "using hyper-params:
        text_files: {:?}
        output_dir: {}
        dataset_name: {}
        model_name: {}
        vocab_size: {}
        min_word_count: {}
        embedding_dim: {}
        learning_rate: {}
        min_learning_rate: {}
        batch_size: {}
        n_epochs: {}
        max_window_size: {}
        num_negative_samples: {}
        mixed_precision: {}
        starting_epoch_nr: {}
        intermediate_embedding_weights_saves: {}",
        self.text_files, self.output_dir.display(), self.dataset_name, self.model_name, self.vocab_size,
        self.min_word_count, self.embedding_dim, self.learning_rate, self.min_learning_rate, self.batch_size,
        self.n_epochs, self.max_window_size, self.num_negative_samples, self.mixed_precision,
        self.starting_epoch_nr, self.intermediate_embedding_weights_saves)
    }
}

/// Parameters of the index builder binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnIndexConfig {
    pub model_training_output_dir: PathBuf,
    pub model_name: String,
    pub dataset_name: String,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: i64,
    pub output_dir: PathBuf,
    #[serde(default = "default_output_filepath_suffix")]
    pub output_filepath_suffix: String,
    pub ann: ApproxNnParams,
}

impl AnnIndexConfig {
    pub fn from_json_file(path: &Path) -> Result<AnnIndexConfig> {
        let f = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(f)?)
    }
}

pub struct Config {
    path: PathBuf,
}

impl Config {

    // binaries take a single argument, the path to a json file
    pub fn new(args: &[String]) -> Result<Config> {
        if args.len() != 2 {
            return Err(Error::config("input should be a path to json file only"));
        }
        Ok(Self { path: PathBuf::from(&args[1]) })
    }

    pub fn run_config(&self) -> Result<RunConfig> {
        RunConfig::from_json_file(&self.path)
    }

    pub fn ann_index_config(&self) -> Result<AnnIndexConfig> {
        AnnIndexConfig::from_json_file(&self.path)
    }
}

const MODEL_SECTION: &str = "MODELCONFIG";
const TRAIN_SECTION: &str = "TRAINCONFIG";

/// The `{model}_{dataset}.conf` file written next to the checkpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelTrainingConf {
    pub corpus_size: u64,
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub batch_size: usize,
    pub n_epochs: usize,
    pub learning_rate: f32,
    pub min_learning_rate: f32,
    pub max_window_size: usize,
    pub num_negative_samples: usize,
}

impl ModelTrainingConf {

    fn sections(&self) -> [(&'static str, Vec<(&'static str, String)>); 2] {
        [
            (MODEL_SECTION, vec![
                ("corpus_size", self.corpus_size.to_string()),
                ("vocab_size", self.vocab_size.to_string()),
                ("embedding_dim", self.embedding_dim.to_string()),
            ]),
            (TRAIN_SECTION, vec![
                ("batch_size", self.batch_size.to_string()),
                ("n_epochs", self.n_epochs.to_string()),
                ("learning_rate", self.learning_rate.to_string()),
                ("min_learning_rate", self.min_learning_rate.to_string()),
                ("max_window_size", self.max_window_size.to_string()),
                ("num_negative_samples", self.num_negative_samples.to_string()),
            ]),
        ]
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = BufWriter::new(File::create(path)?);
        for (section, entries) in self.sections() {
            writeln!(f, "[{}]", section)?;
            for (key, value) in entries {
                writeln!(f, "{} = {}", key, value)?;
            }
            writeln!(f)?;
        }
        f.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<ModelTrainingConf> {
        let content = fs::read_to_string(path)?;
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (line_nr, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::config(format!("{}:{}: expected `key = value`", path.display(), line_nr + 1))
            })?;
            let section = current.as_ref().ok_or_else(|| {
                Error::config(format!("{}:{}: entry outside of a section", path.display(), line_nr + 1))
            })?;
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        let get = |section: &str, key: &str| -> Result<&String> {
            sections
                .get(section)
                .and_then(|entries| entries.get(key))
                .ok_or_else(|| Error::config(format!("{}: missing {}.{}", path.display(), section, key)))
        };
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse::<T>()
                .map_err(|_| Error::config(format!("cannot parse {} from `{}`", key, value)))
        }

        Ok(ModelTrainingConf {
            corpus_size: parse("corpus_size", get(MODEL_SECTION, "corpus_size")?)?,
            vocab_size: parse("vocab_size", get(MODEL_SECTION, "vocab_size")?)?,
            embedding_dim: parse("embedding_dim", get(MODEL_SECTION, "embedding_dim")?)?,
            batch_size: parse("batch_size", get(TRAIN_SECTION, "batch_size")?)?,
            n_epochs: parse("n_epochs", get(TRAIN_SECTION, "n_epochs")?)?,
            learning_rate: parse("learning_rate", get(TRAIN_SECTION, "learning_rate")?)?,
            min_learning_rate: parse("min_learning_rate", get(TRAIN_SECTION, "min_learning_rate")?)?,
            max_window_size: parse("max_window_size", get(TRAIN_SECTION, "max_window_size")?)?,
            num_negative_samples: parse("num_negative_samples", get(TRAIN_SECTION, "num_negative_samples")?)?,
        })
    }
}
