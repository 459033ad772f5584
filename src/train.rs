use crate::checkpoint::{ModelPaths, ModelSnapshot};
use crate::config::files_handling;
use crate::config::ModelTrainingConf;
use crate::dataset::SkipGramBatches;
use crate::error::{Error, Result};
use crate::sgns::{LossScale, Word2Vec, Word2VecConfig};
use crate::vocab::Tokenizer;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

// batches between two progress lines
const PROGRESS_LOG_INTERVAL: usize = 10_000;

/// Linearly decaying learning rate, floored at `min_learning_rate`.
pub fn learning_rate(progress: f64, learning_rate: f32, min_learning_rate: f32) -> f32 {
    let p = progress.clamp(0.0, 1.0) as f32;
    (learning_rate * (1.0 - p) + min_learning_rate * p).max(min_learning_rate)
}

/// Progress over the whole run, `epoch_nr` counts from 1.
pub fn overall_progress(epoch_nr: usize, epoch_progress: f64, end_epoch_nr: usize) -> f64 {
    ((epoch_nr as f64 - 1.0 + epoch_progress) / end_epoch_nr.max(1) as f64).clamp(0.0, 1.0)
}

/// Decides when the `n` intermediate embedding snapshots of an epoch are written.
/// Snapshot `k` is due once the epoch progress reaches `k / n`; the last one is only
/// written by `finish`, so that it always holds the end of epoch weights.
#[derive(Clone, Debug)]
pub struct SnapshotSchedule {
    n: usize,
    next: usize,
}

impl SnapshotSchedule {

    pub fn new(n: usize) -> SnapshotSchedule {
        Self { n, next: 1 }
    }

    /// Sub-epoch numbers whose threshold was crossed since the last call.
    pub fn due(&mut self, epoch_progress: f64) -> Vec<usize> {
        let mut due = Vec::new();
        while self.next < self.n && epoch_progress >= self.next as f64 / self.n as f64 {
            due.push(self.next);
            self.next += 1;
        }
        due
    }

    /// Outstanding sub-epoch numbers at the end of the epoch, `n` included.
    pub fn finish(&mut self) -> Vec<usize> {
        let outstanding = (self.next..=self.n).collect();
        self.next = self.n + 1;
        outstanding
    }
}

/// One row of the `_logs.csv` training log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    pub epoch_nr: usize,
    pub train_loss: f64,
    pub time_spent: f64,
}

pub fn read_train_logs(file_path: &Path) -> Result<Vec<EpochLog>> {
    let mut reader = csv::Reader::from_path(file_path)?;
    let rows = reader.deserialize().collect::<std::result::Result<Vec<EpochLog>, csv::Error>>()?;
    Ok(rows)
}

/// Everything `fit` needs besides the model itself.
#[derive(Clone, Debug)]
pub struct FitOptions {
    pub text_files: Vec<PathBuf>,
    pub num_texts: usize,
    pub dataset_name: String,
    pub n_epochs: usize,
    pub output_dir: PathBuf,
    pub starting_epoch_nr: usize,
    pub intermediate_embedding_weights_saves: usize,
    pub train_logs_to_file: bool,
}

struct DisplayProgress {
    epoch_loss: f64,        // sum of the mean losses of applied batches
    n_batches: usize,       // number of applied batches
    n_skipped: usize,       // batches skipped by the loss scale
}

impl DisplayProgress {

    fn new() -> Self {
        Self { epoch_loss: 0.0, n_batches: 0, n_skipped: 0 }
    }

    fn record(&mut self, applied: bool, mean_loss: f32) {
        if applied {
            self.epoch_loss += mean_loss as f64;
            self.n_batches += 1;
        } else {
            self.n_skipped += 1;
        }
    }

    fn mean_loss(&self) -> f64 {
        if self.n_batches == 0 { f64::NAN } else { self.epoch_loss / self.n_batches as f64 }
    }
}

pub struct Trainer {
    tokenizer: Tokenizer,
    model: Word2Vec,
    loss_scale: LossScale,
    rng: StdRng,        // negative sampling
    data_rng: StdRng,   // windows and subsampling
    completed_epoch_nr: Option<usize>,
}

impl Trainer {

    pub fn new(tokenizer: Tokenizer, config: Word2VecConfig) -> Result<Trainer> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let data_rng = StdRng::seed_from_u64(rng.gen());
        let loss_scale = LossScale::new(config.precision);
        let model = Word2Vec::new(config, tokenizer.word_counts(), &mut rng)?;
        Ok(Self { tokenizer, model, loss_scale, rng, data_rng, completed_epoch_nr: None })
    }

    /// Restores a trainer from a `.model` checkpoint. A missing or unreadable checkpoint is an error.
    pub fn resume(checkpoint_path: &Path) -> Result<Trainer> {

        let snapshot = ModelSnapshot::load(checkpoint_path)?;
        let tokenizer = Tokenizer::from_parts(snapshot.words, snapshot.word_counts, snapshot.corpus_size)?;

        // fresh streams per resumed epoch, so that a resumed run does not replay epoch 1
        let mut rng = StdRng::seed_from_u64(snapshot.config.seed.wrapping_add(snapshot.epoch_nr as u64));
        let data_rng = StdRng::seed_from_u64(rng.gen());
        let model = Word2Vec::reconstruct(snapshot.config, snapshot.weights, tokenizer.word_counts())?;

        info!("resumed {} after epoch {}", checkpoint_path.display(), snapshot.epoch_nr);
        Ok(Self {
            tokenizer,
            model,
            loss_scale: snapshot.loss_scale,
            rng,
            data_rng,
            completed_epoch_nr: Some(snapshot.epoch_nr),
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn model(&self) -> &Word2Vec {
        &self.model
    }

    pub fn completed_epoch_nr(&self) -> Option<usize> {
        self.completed_epoch_nr
    }

    pub fn snapshot(&self, epoch_nr: usize) -> ModelSnapshot {
        ModelSnapshot {
            config: self.model.config().clone(),
            words: self.tokenizer.words().to_vec(),
            word_counts: self.tokenizer.word_counts().to_vec(),
            corpus_size: self.tokenizer.corpus_size(),
            epoch_nr,
            loss_scale: self.loss_scale.clone(),
            weights: self.model.weights(),
        }
    }

    fn check_resume(&self, options: &FitOptions, paths: &ModelPaths) -> Result<()> {

        let start = options.starting_epoch_nr;
        if start == 0 {
            return Err(Error::config("starting_epoch_nr counts from 1"));
        }
        if options.n_epochs == 0 {
            return Err(Error::config("n_epochs must be positive"));
        }

        match self.completed_epoch_nr {
            Some(done) if done + 1 != start => {
                return Err(Error::ResumeMismatch(format!(
                    "checkpoint completed epoch {} but training starts at epoch {}", done, start
                )))
            }
            None if start > 1 => {
                return Err(Error::ResumeMismatch(format!(
                    "starting at epoch {} requires a resumed checkpoint", start
                )))
            }
            _ => {}
        }

        if start > 1 && options.train_logs_to_file {
            let logs_path = paths.train_logs();
            if !logs_path.is_file() {
                return Err(Error::ResumeMismatch(format!("missing training log {}", logs_path.display())));
            }
            let logged: Vec<usize> = read_train_logs(&logs_path)?.iter().map(|row| row.epoch_nr).collect();
            let expected: Vec<usize> = (1..start).collect();
            if logged != expected {
                return Err(Error::ResumeMismatch(format!(
                    "training log holds epochs {:?}, expected 1..={}", logged, start - 1
                )));
            }
        }
        Ok(())
    }

    fn open_train_logs(options: &FitOptions, paths: &ModelPaths) -> Result<Option<csv::Writer<File>>> {
        if !options.train_logs_to_file {
            return Ok(None);
        }
        let logs_path = paths.train_logs();
        // header is written once, a resumed run appends below it
        if options.starting_epoch_nr == 1 {
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(&logs_path)?;
            writer.write_record(["epoch_nr", "train_loss", "time_spent"])?;
            writer.flush()?;
            Ok(Some(writer))
        } else {
            let f = OpenOptions::new().append(true).open(&logs_path)?;
            Ok(Some(csv::WriterBuilder::new().has_headers(false).from_writer(f)))
        }
    }

    /// Trains epochs `starting_epoch_nr..=n_epochs + starting_epoch_nr - 1`, writing the
    /// vocabulary, the `.conf` file, intermediate snapshots, the log and one `.model` per epoch.
    pub fn fit(&mut self, options: &FitOptions) -> Result<Vec<EpochLog>> {

        let config = self.model.config().clone();
        let paths = ModelPaths::new(&options.output_dir, &config.model_name, &options.dataset_name);
        self.check_resume(options, &paths)?;

        std::fs::create_dir_all(&options.output_dir)?;
        self.tokenizer.save_words(&paths.words())?;
        self.tokenizer.save_word_counts(&paths.word_counts())?;

        let start = options.starting_epoch_nr;
        let end_epoch_nr = options.n_epochs + start - 1;
        ModelTrainingConf {
            corpus_size: self.tokenizer.corpus_size(),
            vocab_size: self.tokenizer.vocab_size(),
            embedding_dim: config.embedding_dim,
            batch_size: config.batch_size,
            n_epochs: end_epoch_nr,
            learning_rate: config.learning_rate,
            min_learning_rate: config.min_learning_rate,
            max_window_size: config.max_window_size,
            num_negative_samples: config.num_negative_samples,
        }
        .write(&paths.training_conf())?;

        let mut train_logs = Trainer::open_train_logs(options, &paths)?;
        debug!("{:?}", config);
        info!(
            "training {} on {} texts, vocab size {}, epochs {}..={}",
            paths.model_id(), options.num_texts, self.tokenizer.vocab_size(), start, end_epoch_nr
        );

        let mut history = Vec::with_capacity(options.n_epochs);
        for epoch_nr in start..=end_epoch_nr {

            let my_time = Instant::now();
            info!("starting epoch {} / {}", epoch_nr, end_epoch_nr);

            let mut progress_params = DisplayProgress::new();
            let mut schedule = SnapshotSchedule::new(options.intermediate_embedding_weights_saves);
            let batches = SkipGramBatches::new(
                &options.text_files,
                options.num_texts,
                &self.tokenizer,
                config.max_window_size,
                config.batch_size,
                config.sampling_factor,
                &mut self.data_rng,
            );

            for (pp, batch) in batches.enumerate() {
                let batch = batch?;

                for sub_epoch_nr in schedule.due(batch.progress) {
                    save_embedding_weights(&self.model, &paths.intermediate_embedding_weights(epoch_nr, sub_epoch_nr))?;
                }

                let progress = overall_progress(epoch_nr, batch.progress, end_epoch_nr);
                let lr = learning_rate(progress, config.learning_rate, config.min_learning_rate);
                let scale_before = self.loss_scale.scale();
                let outcome = self.model.train_step(&batch.targets, &batch.contexts, lr, &mut self.loss_scale, &mut self.rng)?;
                progress_params.record(outcome.applied, outcome.mean_loss);
                if self.loss_scale.scale() > scale_before {
                    info!("loss scale raised to {}", self.loss_scale.scale());
                }

                if pp % PROGRESS_LOG_INTERVAL == 0 && pp > 0 {
                    info!(
                        "epoch {}, {:.1}%, loss: {:.5}, lr: {:.7}",
                        epoch_nr, batch.progress * 100.0, progress_params.mean_loss(), lr
                    );
                }
            }

            for sub_epoch_nr in schedule.finish() {
                save_embedding_weights(&self.model, &paths.intermediate_embedding_weights(epoch_nr, sub_epoch_nr))?;
            }

            let row = EpochLog {
                epoch_nr,
                train_loss: progress_params.mean_loss(),
                time_spent: my_time.elapsed().as_secs_f64(),
            };
            if progress_params.n_batches == 0 {
                warn!("epoch {} applied no batches, corpus smaller than one batch?", epoch_nr);
            }
            if progress_params.n_skipped > 0 {
                warn!("epoch {}: {} batches skipped by the loss scale", epoch_nr, progress_params.n_skipped);
            }
            if let Some(writer) = train_logs.as_mut() {
                writer.serialize(&row)?;
                writer.flush()?;
            }

            let checkpoint_path = paths.checkpoint(epoch_nr);
            self.snapshot(epoch_nr).save(&checkpoint_path)?;
            self.completed_epoch_nr = Some(epoch_nr);

            info!(
                "finished epoch {}, loss is {}, took: {:.1} seconds, saved {}",
                epoch_nr, row.train_loss, row.time_spent, checkpoint_path.display()
            );
            history.push(row);
        }

        Ok(history)
    }
}

fn save_embedding_weights(model: &Word2Vec, file_path: &Path) -> Result<()> {
    files_handling::save_output(file_path, &model.embedding_weights())?;
    debug!("saved embedding weights to {}", file_path.display());
    Ok(())
}


#[cfg(test)]
mod tests {

    use super::*;
    use std::fs;

    #[test]
    fn learning_rate_decays_to_the_floor() {
        assert_eq!(learning_rate(0.0, 0.025, 0.0001), 0.025);
        assert!((learning_rate(1.0, 0.025, 0.0001) - 0.0001).abs() < 1e-9);
        assert!((learning_rate(0.5, 0.02, 0.0) - 0.01).abs() < 1e-7);

        let mut previous = f32::INFINITY;
        for i in 0..=1000 {
            let lr = learning_rate(i as f64 / 1000.0, 0.025, 0.0001);
            assert!(lr <= previous);
            assert!(lr >= 0.0001);
            previous = lr;
        }
        // out of range progress is clamped
        assert!(learning_rate(3.0, 0.025, 0.0001) >= 0.0001);
    }

    #[test]
    fn progress_spans_all_epochs() {
        assert_eq!(overall_progress(1, 0.0, 4), 0.0);
        assert_eq!(overall_progress(2, 0.5, 4), 0.375);
        assert_eq!(overall_progress(4, 1.0, 4), 1.0);
        // resumed run: epochs 3..=4
        assert_eq!(overall_progress(3, 0.0, 4), 0.5);
    }

    fn run_schedule(n: usize, progress: &[f64]) -> Vec<usize> {
        let mut schedule = SnapshotSchedule::new(n);
        let mut written = Vec::new();
        for p in progress {
            written.extend(schedule.due(*p));
        }
        written.extend(schedule.finish());
        written
    }

    #[test]
    fn every_snapshot_is_written_exactly_once() {
        for n in [1, 2, 5] {
            for n_batches in [1, 2, 3, 4, 5, 7, 10, 99] {
                // progress reaching 1.0 on the last batch
                let full: Vec<f64> = (1..=n_batches).map(|i| i as f64 / n_batches as f64).collect();
                // progress stopping short of 1.0, as when the trailing texts fill no full batch
                let short: Vec<f64> = (1..=n_batches).map(|i| i as f64 / (n_batches + 2) as f64).collect();
                for progress in [full, short] {
                    assert_eq!(run_schedule(n, &progress), (1..=n).collect::<Vec<_>>(), "n={} batches={}", n, n_batches);
                }
            }
        }
    }

    #[test]
    fn last_snapshot_waits_for_the_end_of_the_epoch() {
        let mut schedule = SnapshotSchedule::new(2);
        assert!(schedule.due(0.2).is_empty());
        assert_eq!(schedule.due(0.5), vec![1]);
        assert!(schedule.due(1.0).is_empty());
        assert_eq!(schedule.finish(), vec![2]);
        assert!(schedule.finish().is_empty());

        // a jump over several thresholds writes each of them once
        let mut schedule = SnapshotSchedule::new(5);
        assert_eq!(schedule.due(0.65), vec![1, 2, 3]);
        assert_eq!(schedule.finish(), vec![4, 5]);

        assert!(run_schedule(0, &[0.5, 1.0]).is_empty());
    }

    fn toy_trainer(dir: &Path) -> (Trainer, FitOptions) {
        let corpus = dir.join("corpus.txt");
        fs::write(&corpus, "a b c a b\nc a b d\nd a b c\n").unwrap();
        let text_files = vec![corpus];
        let tokenizer = Tokenizer::build(&text_files, None, 1).unwrap();
        let config = Word2VecConfig {
            embedding_dim: 4,
            batch_size: 4,
            num_negative_samples: 2,
            sampling_factor: 0.0,
            ..Word2VecConfig::default()
        };
        let options = FitOptions {
            text_files,
            num_texts: 3,
            dataset_name: "toy".to_string(),
            n_epochs: 1,
            output_dir: dir.join("out"),
            starting_epoch_nr: 1,
            intermediate_embedding_weights_saves: 2,
            train_logs_to_file: true,
        };
        (Trainer::new(tokenizer, config).unwrap(), options)
    }

    #[test]
    fn fit_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, options) = toy_trainer(dir.path());
        let history = trainer.fit(&options).unwrap();

        assert_eq!(history.len(), 1);
        assert!(history[0].train_loss.is_finite());
        assert_eq!(trainer.completed_epoch_nr(), Some(1));

        let paths = ModelPaths::new(&options.output_dir, "word2vec", "toy");
        assert!(paths.training_conf().is_file());
        assert!(paths.checkpoint(1).is_file());
        assert!(paths.intermediate_embedding_weights(1, 1).is_file());
        assert!(paths.intermediate_embedding_weights(1, 2).is_file());
        assert!(!paths.intermediate_embedding_weights(1, 3).exists());
        assert_eq!(fs::read_to_string(paths.words()).unwrap(), "a\nb\nc\nd");

        let logs = fs::read_to_string(paths.train_logs()).unwrap();
        assert!(logs.starts_with("epoch_nr,train_loss,time_spent\n1,"));
        assert_eq!(ModelTrainingConf::read(&paths.training_conf()).unwrap().vocab_size, 4);
    }

    #[test]
    fn inconsistent_resume_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, mut options) = toy_trainer(dir.path());

        options.starting_epoch_nr = 0;
        assert!(matches!(trainer.fit(&options), Err(Error::Config(_))));

        // a fresh model cannot start at epoch 2
        options.starting_epoch_nr = 2;
        assert!(matches!(trainer.fit(&options), Err(Error::ResumeMismatch(_))));

        options.starting_epoch_nr = 1;
        trainer.fit(&options).unwrap();
        let paths = ModelPaths::new(&options.output_dir, "word2vec", "toy");

        // checkpoint of epoch 1, but asked to start at epoch 3
        let mut resumed = Trainer::resume(&paths.checkpoint(1)).unwrap();
        options.starting_epoch_nr = 3;
        assert!(matches!(resumed.fit(&options), Err(Error::ResumeMismatch(_))));

        // log without the epoch 1 row
        fs::write(paths.train_logs(), "epoch_nr,train_loss,time_spent\n").unwrap();
        options.starting_epoch_nr = 2;
        assert!(matches!(resumed.fit(&options), Err(Error::ResumeMismatch(_))));
    }

    #[test]
    fn snapshot_restores_the_same_model() {
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, options) = toy_trainer(dir.path());
        trainer.fit(&options).unwrap();

        let paths = ModelPaths::new(&options.output_dir, "word2vec", "toy");
        let resumed = Trainer::resume(&paths.checkpoint(1)).unwrap();
        assert_eq!(resumed.completed_epoch_nr(), Some(1));
        assert_eq!(resumed.model().weights(), trainer.model().weights());
        assert_eq!(resumed.tokenizer().words(), trainer.tokenizer().words());
        assert_eq!(resumed.snapshot(1), trainer.snapshot(1));
    }
}
