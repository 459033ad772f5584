use crate::config::files_handling::open_text;
use crate::error::Result;
use crate::vocab::Tokenizer;

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::PathBuf;


/// Counts the texts (newline delimited lines) in `text_files`.
pub fn count_lines(text_files: &[PathBuf]) -> Result<usize> {
    let mut total = 0;
    for path in text_files {
        for line in open_text(path)?.lines() {
            line?;
            total += 1;
        }
    }
    Ok(total)
}

/// One training batch: parallel target/context ids and the fraction of the epoch's
/// texts consumed when the batch was completed.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub targets: Vec<usize>,
    pub contexts: Vec<usize>,
    pub progress: f64,
}

/// Streams fixed size batches of skip-gram (target, context) pairs over a set of text files.
pub struct SkipGramBatches<'a> {
    tokenizer: &'a Tokenizer,
    files: std::slice::Iter<'a, PathBuf>,
    lines: Option<Box<dyn BufRead + Send>>,
    num_texts: usize,
    texts_consumed: usize,
    max_window_size: usize,
    batch_size: usize,
    keep_probs: Option<Vec<f64>>,
    pending: VecDeque<(usize, usize)>,
    rng: &'a mut StdRng,
    exhausted: bool,
}

impl<'a> SkipGramBatches<'a> {

    pub fn new(
        text_files: &'a [PathBuf],
        num_texts: usize,
        tokenizer: &'a Tokenizer,
        max_window_size: usize,
        batch_size: usize,
        sampling_factor: f64,
        rng: &'a mut StdRng,
    ) -> SkipGramBatches<'a> {

        // subsampling of frequent words, keep probability min(1, sqrt(t/f) + t/f)
        let keep_probs = if sampling_factor > 0.0 {
            let total = tokenizer.word_counts().iter().sum::<u64>().max(1) as f64;
            Some(
                tokenizer
                    .word_counts()
                    .iter()
                    .map(|count| {
                        let ratio = sampling_factor / (*count as f64 / total);
                        (ratio.sqrt() + ratio).min(1.0)
                    })
                    .collect(),
            )
        } else {
            None
        };

        Self {
            tokenizer,
            files: text_files.iter(),
            lines: None,
            num_texts: num_texts.max(1),
            texts_consumed: 0,
            max_window_size: max_window_size.max(1),
            batch_size: batch_size.max(1),
            keep_probs,
            pending: VecDeque::new(),
            rng,
            exhausted: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if self.lines.is_none() {
                match self.files.next() {
                    Some(path) => self.lines = Some(open_text(path)?),
                    None => return Ok(None),
                }
            }
            if let Some(reader) = self.lines.as_mut() {
                let mut line = String::new();
                if reader.read_line(&mut line)? > 0 {
                    return Ok(Some(line));
                }
            }
            self.lines = None;
        }
    }

    fn push_pairs(&mut self, line: &str) {

        let mut ids = self.tokenizer.texts_to_ids(line);
        if let Some(keep_probs) = &self.keep_probs {
            let rng = &mut *self.rng;
            ids.retain(|id| rng.gen::<f64>() < keep_probs[*id]);
        }

        let n = ids.len();
        for i in 0..n {
            // dynamic window, b is drawn uniformly from 1..=max_window_size
            let b = self.rng.gen_range(1..=self.max_window_size);
            let start = i.saturating_sub(b);
            let end = (i + b).min(n - 1);
            for j in start..=end {
                if j != i {
                    self.pending.push_back((ids[i], ids[j]));
                }
            }
        }
    }

    fn progress(&self) -> f64 {
        (self.texts_consumed as f64 / self.num_texts as f64).min(1.0)
    }
}

impl<'a> Iterator for SkipGramBatches<'a> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        while self.pending.len() < self.batch_size {
            match self.next_line() {
                Ok(Some(line)) => {
                    self.texts_consumed += 1;
                    self.push_pairs(&line);
                }
                Ok(None) => {
                    // the trailing partial batch is dropped, batches have a fixed shape
                    self.exhausted = true;
                    return None;
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let (targets, contexts) = self.pending.drain(..self.batch_size).unzip();
        Some(Ok(Batch { targets, contexts, progress: self.progress() }))
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use rand::SeedableRng;
    use std::fs;

    fn corpus(dir: &std::path::Path) -> (Vec<PathBuf>, Tokenizer) {
        let path = dir.join("corpus.txt");
        fs::write(&path, "a b c d\nb c\nd a b\nc\n").unwrap();
        let files = vec![path];
        let tokenizer = Tokenizer::build(&files, None, 1).unwrap();
        (files, tokenizer)
    }

    #[test]
    fn counts_texts() {
        let dir = tempfile::tempdir().unwrap();
        let (files, _) = corpus(dir.path());
        assert_eq!(count_lines(&files).unwrap(), 4);
    }

    #[test]
    fn window_of_one_yields_neighbour_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let (files, tokenizer) = corpus(dir.path());
        let mut rng = StdRng::seed_from_u64(1);

        let batches = SkipGramBatches::new(&files, 4, &tokenizer, 1, 2, 0.0, &mut rng)
            .collect::<Result<Vec<Batch>>>()
            .unwrap();

        // line pairs: 6 + 2 + 4 + 0 = 12, six full batches
        assert_eq!(batches.len(), 6);
        let id = |w: &str| tokenizer.word_to_int(w).unwrap();
        assert_eq!(batches[0].targets, vec![id("a"), id("b")]);
        assert_eq!(batches[0].contexts, vec![id("b"), id("a")]);

        for batch in &batches {
            assert_eq!(batch.targets.len(), 2);
            assert_eq!(batch.contexts.len(), 2);
        }
        let progress: Vec<f64> = batches.iter().map(|b| b.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn trailing_partial_batch_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (files, tokenizer) = corpus(dir.path());
        let mut rng = StdRng::seed_from_u64(1);

        let batches = SkipGramBatches::new(&files, 4, &tokenizer, 1, 5, 0.0, &mut rng)
            .collect::<Result<Vec<Batch>>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn pairs_stay_within_max_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.txt");
        let line = (0..50).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        fs::write(&path, &line).unwrap();
        let files = vec![path];
        let tokenizer = Tokenizer::build(&files, None, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let position = |id: usize| tokenizer.words()[id][1..].parse::<i64>().unwrap();
        for batch in SkipGramBatches::new(&files, 1, &tokenizer, 3, 4, 0.0, &mut rng) {
            let batch = batch.unwrap();
            for (t, c) in batch.targets.iter().zip(&batch.contexts) {
                let distance = (position(*t) - position(*c)).abs();
                assert!((1..=3).contains(&distance));
            }
        }
    }

    #[test]
    fn missing_file_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, tokenizer) = corpus(dir.path());
        let files = vec![dir.path().join("missing.txt")];
        let mut rng = StdRng::seed_from_u64(1);
        let mut batches = SkipGramBatches::new(&files, 1, &tokenizer, 2, 2, 0.0, &mut rng);
        assert!(matches!(batches.next(), Some(Err(_))));
        assert!(batches.next().is_none());
    }
}
