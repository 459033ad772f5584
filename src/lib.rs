mod run;
mod config;
mod error;
mod vocab;
mod dataset;
mod sgns;
mod train;
mod checkpoint;
mod similarity;
mod analysis;
pub mod ann;

pub use run::Run;
pub use config::{files_handling, AnnIndexConfig, Config, ModelTrainingConf, RunConfig};
pub use error::{Error, Result};
pub use vocab::Tokenizer;
pub use dataset::{count_lines, Batch, SkipGramBatches};
pub use sgns::{LossScale, ModelWeights, Precision, StepOutcome, UnigramSampler, Word2Vec, Word2VecConfig};
pub use train::{learning_rate, overall_progress, read_train_logs, EpochLog, FitOptions, SnapshotSchedule, Trainer};
pub use checkpoint::{
    load_model_training_output, load_model_training_output_with, EmbeddingWeights, MappedEmbeddings,
    ModelCheckpointFiles, ModelPaths, ModelSnapshot, TrainingOutput, TrainingOutputOptions, SNAPSHOT_FORMAT_VERSION,
};
pub use similarity::Similarity;
pub use analysis::{intrinsic_dimensions, local_intrinsic_dimension, words_in_clusters, ClusterWords};
