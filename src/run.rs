use crate::ann::{normalize_rows, ApproxNN};
use crate::checkpoint::{load_model_training_output, ModelPaths};
use crate::config::{AnnIndexConfig, Config, RunConfig};
use crate::dataset::count_lines;
use crate::error::{Error, Result};
use crate::train::{EpochLog, FitOptions, Trainer};
use crate::vocab::Tokenizer;

use ndarray::s;
use std::env;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;


pub struct Run {}

impl Run {

    /// Trains from the run config given as the only command line argument.
    pub fn run() -> Result<()> {

        info!("entering program...");
        let args: Vec<String> = env::args().collect();

        info!("building parameters...");
        let params = Config::new(&args)?.run_config()?;
        info!("{}", params);

        Run::train(&params)?;
        Ok(())
    }

    /// Builds an approximate nearest neighbour index from the config given as the only argument.
    pub fn run_build_ann_index() -> Result<()> {
        let args: Vec<String> = env::args().collect();
        let params = Config::new(&args)?.ann_index_config()?;
        Run::build_ann_index(&params)?;
        Ok(())
    }

    pub fn train(params: &RunConfig) -> Result<Vec<EpochLog>> {

        params.validate()?;

        // vocabulary comes with the checkpoint when resuming
        let mut trainer = match &params.resume_checkpoint {
            Some(checkpoint) => {
                info!("resuming from {}...", checkpoint.display());
                Trainer::resume(checkpoint)?
            }
            None => {
                info!("starting vocab building...");
                let my_time = Instant::now();
                let tokenizer = Tokenizer::build(&params.text_files, params.max_vocab_size(), params.min_word_count)?;
                info!("finished vocab creation, took {} seconds ...", my_time.elapsed().as_secs());
                Trainer::new(tokenizer, params.word2vec_config())?
            }
        };

        let num_texts = count_lines(&params.text_files)?;
        info!("found {} texts in {} files", num_texts, params.text_files.len());

        let options = FitOptions {
            text_files: params.text_files.clone(),
            num_texts,
            dataset_name: params.dataset_name.clone(),
            n_epochs: params.n_epochs,
            output_dir: params.output_dir.clone(),
            starting_epoch_nr: params.starting_epoch_nr,
            intermediate_embedding_weights_saves: params.intermediate_embedding_weights_saves,
            train_logs_to_file: params.train_logs_to_file,
        };

        let my_time = Instant::now();
        info!("starting training part...");
        let history = trainer.fit(&options)?;
        info!("finished training, took {} seconds ...", my_time.elapsed().as_secs());
        Ok(history)
    }

    /// Returns the path of the saved index.
    pub fn build_ann_index(params: &AnnIndexConfig) -> Result<PathBuf> {

        let output = load_model_training_output(&params.model_training_output_dir, &params.model_name, &params.dataset_name, true)?;
        let weights = output.last_embedding_weights.view()?;
        info!("loaded embedding weights {:?} from {}", weights.dim(), output.last_embedding_weights_filepath.display());

        let rows = match params.vocab_size {
            -1 => weights.nrows(),
            n if n > 0 => (n as usize).min(weights.nrows()),
            n => return Err(Error::config(format!("vocab_size must be positive or -1, got {}", n))),
        };
        let in_vocab = weights.slice(s![..rows, ..]).mapv(|x| x as f32);
        let normalized = normalize_rows(in_vocab.view());

        info!("building {} index over {} words...", params.ann.backend, rows);
        let my_time = Instant::now();
        let index = ApproxNN::build(normalized.view(), &params.ann)?;
        info!("built index, took {} seconds ...", my_time.elapsed().as_secs());

        let path = ModelPaths::new(&params.output_dir, &params.model_name, &params.dataset_name)
            .ann_index(params.ann.backend, &params.output_filepath_suffix);
        index.save(&path)?;
        info!("saved index to {}", path.display());
        Ok(path)
    }
}
