// imports
use crate::config::files_handling::{self, open_text};
use crate::error::{Error, Result};

use rayon::prelude::*;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::info;


/// Fixed vocabulary of a training run. Ids are dense, ordered by descending count.
#[derive(Clone, Debug)]
pub struct Tokenizer {
    words: Vec<String>,
    word_counts: Vec<u64>,
    word_to_int: HashMap<String, usize>,
    corpus_size: u64,
}

impl Tokenizer {

    // tokens are taken as they are, case included
    fn accumulate(line: &str, token2count: &mut HashMap<String, u64>) -> u64 {

        let mut n_tokens = 0;

        // accumulate occurrences of words - how many times each token appears in the corpus
        for tok in Tokenizer::tokenize(line) {
            *token2count.entry(tok.to_owned()).or_insert(0) += 1;
            n_tokens += 1;
        }
        n_tokens
    }

    fn count_file(file_path: &Path) -> Result<(HashMap<String, u64>, u64)> {

        // read corpus lines and count appearances of tokens
        let mut token2count: HashMap<String, u64> = HashMap::new();
        let mut n_tokens = 0;
        for line in open_text(file_path)?.lines() {
            n_tokens += Tokenizer::accumulate(&line?, &mut token2count);
        }
        Ok((token2count, n_tokens))
    }

    fn build_vocab(token2count: HashMap<String, u64>, vocab_size: Option<usize>, min_word_count: u64) -> Vec<(String, u64)> {

        // keep the most common tokens, most frequent first; ties are ordered by the word itself
        // so that the id assignment does not depend on hash map iteration order
        let mut tup = token2count
            .into_iter()
            .filter(|(_, count)| *count >= min_word_count.max(1))
            .collect::<Vec<(String, u64)>>();
        tup.sort_by(|(w1, c1), (w2, c2)| c2.cmp(c1).then_with(|| w1.cmp(w2)));

        if let Some(vocab_size) = vocab_size {
            tup.truncate(vocab_size);
        }
        tup
    }

    fn from_sorted(tup: Vec<(String, u64)>, corpus_size: u64) -> Tokenizer {
        let (words, word_counts): (Vec<String>, Vec<u64>) = tup.into_iter().unzip();
        let word_to_int = words.iter().enumerate().map(|(i, w)| (w.clone(), i)).collect();
        Self { words, word_counts, word_to_int, corpus_size }
    }

    /// Counts the words of `text_files` (in parallel, one file per task) and keeps the
    /// `vocab_size` most frequent ones with at least `min_word_count` occurrences.
    pub fn build(text_files: &[PathBuf], vocab_size: Option<usize>, min_word_count: u64) -> Result<Tokenizer> {

        let per_file = text_files
            .par_iter()
            .map(|path| Tokenizer::count_file(path))
            .collect::<Result<Vec<_>>>()?;

        let mut token2count: HashMap<String, u64> = HashMap::new();
        let mut corpus_size = 0;
        for (counts, n_tokens) in per_file {
            corpus_size += n_tokens;
            for (tok, count) in counts {
                *token2count.entry(tok).or_insert(0) += count;
            }
        }

        let n_unique = token2count.len();
        let tup = Tokenizer::build_vocab(token2count, vocab_size, min_word_count);
        if tup.is_empty() {
            return Err(Error::config("corpus yields an empty vocabulary"));
        }

        info!("using {} most common tokens out of {}, corpus size {}", tup.len(), n_unique, corpus_size);
        Ok(Tokenizer::from_sorted(tup, corpus_size))
    }

    /// Rebuilds a tokenizer from words and counts, e.g. from a checkpoint.
    pub fn from_parts(words: Vec<String>, word_counts: Vec<u64>, corpus_size: u64) -> Result<Tokenizer> {
        if words.len() != word_counts.len() {
            return Err(Error::config(format!(
                "{} words but {} word counts", words.len(), word_counts.len()
            )));
        }
        if words.is_empty() {
            return Err(Error::config("empty vocabulary"));
        }
        if let Some(i) = word_counts.iter().position(|c| *c == 0) {
            return Err(Error::config(format!("word `{}` has a zero count", words[i])));
        }
        let tup = words.into_iter().zip(word_counts).collect();
        Ok(Tokenizer::from_sorted(tup, corpus_size))
    }

    /// Loads the words / word counts files written during training.
    /// The corpus size is not part of those files and is estimated as the sum of counts.
    pub fn load(words_file: &Path, word_counts_file: &Path) -> Result<Tokenizer> {
        let words = files_handling::read_input::<Vec<String>>(words_file)?;
        let word_counts = files_handling::read_input::<Vec<u64>>(word_counts_file)?;
        let corpus_size = word_counts.iter().sum();
        Tokenizer::from_parts(words, word_counts, corpus_size)
    }

    pub fn save_words(&self, file_path: &Path) -> Result<()> {
        files_handling::save_output(file_path, self.words.as_slice())
    }

    pub fn save_word_counts(&self, file_path: &Path) -> Result<()> {
        files_handling::save_output(file_path, self.word_counts.as_slice())
    }

    /// Maps a raw line of text to word ids, dropping out of vocabulary words.
    pub fn texts_to_ids(&self, line: &str) -> Vec<usize> {
        Tokenizer::tokenize(line)
            .filter_map(|tok| self.word_to_int.get(tok).copied())
            .collect()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn word_counts(&self) -> &[u64] {
        &self.word_counts
    }

    pub fn word_to_int(&self, word: &str) -> Option<usize> {
        self.word_to_int.get(word).copied()
    }

    pub fn vocab_size(&self) -> usize {
        self.words.len()
    }

    pub fn corpus_size(&self) -> u64 {
        self.corpus_size
    }
}


// defines the behavior needed for tokenizing a corpus
trait Tokenize {
    fn tokenize(sequence: &str) -> std::str::SplitWhitespace<'_>;
}

impl Tokenize for Tokenizer {
    // simple tokenizer by splitting on whitespace
    fn tokenize(sequence: &str) -> std::str::SplitWhitespace<'_> {
        sequence.split_whitespace()
    }
}


#[cfg(test)]
mod tests {

    use std::collections::HashMap;
    use std::fs;
    use super::*;

    // counts and ids for a small golden example that was computed by hand

    #[test]
    fn vocab_test() {

        let sentences = [
            "what you say makes a lot of sense to me , you are right",
            "are you playing basketball just for fun or are you a pro ?"
        ];

        let mut token2count: HashMap<String, u64> = HashMap::new();
        let mut corpus_size = 0;
        for line in sentences {
            corpus_size += Tokenizer::accumulate(line, &mut token2count);
        }
        assert_eq!(corpus_size, 27);

        // you: 4, are: 3, a: 2, everything else once
        let tup = Tokenizer::build_vocab(token2count, Some(3), 1);
        let tokenizer = Tokenizer::from_sorted(tup, corpus_size);

        assert_eq!(tokenizer.words(), &["you", "are", "a"]);
        assert_eq!(tokenizer.word_counts(), &[4, 3, 2]);
        assert_eq!(tokenizer.word_to_int("are"), Some(1));
        assert_eq!(tokenizer.word_to_int("basketball"), None);
        assert_eq!(tokenizer.texts_to_ids("  are you a pro"), vec![1, 0, 2]);
    }

    #[test]
    fn tokens_keep_their_case() {
        let mut token2count: HashMap<String, u64> = HashMap::new();
        let n_tokens = Tokenizer::accumulate(" The the\tTHE  the ", &mut token2count);
        assert_eq!(n_tokens, 4);

        let tup = Tokenizer::build_vocab(token2count, None, 1);
        assert_eq!(tup, vec![("the".to_string(), 2), ("THE".to_string(), 1), ("The".to_string(), 1)]);

        let tokenizer = Tokenizer::from_sorted(tup, n_tokens);
        assert_eq!(tokenizer.texts_to_ids("the The tHe"), vec![0, 2]);
    }

    #[test]
    fn min_word_count_and_all_words() {
        let mut token2count: HashMap<String, u64> = HashMap::new();
        Tokenizer::accumulate("b a c a b a", &mut token2count);

        let all = Tokenizer::build_vocab(token2count.clone(), None, 1);
        assert_eq!(all, vec![("a".to_string(), 3), ("b".to_string(), 2), ("c".to_string(), 1)]);

        let frequent = Tokenizer::build_vocab(token2count, Some(10), 2);
        assert_eq!(frequent, vec![("a".to_string(), 3), ("b".to_string(), 2)]);
    }

    #[test]
    fn build_from_files_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("part_0.txt");
        let second = dir.path().join("part_1.txt");
        fs::write(&first, "the cat sat\nthe dog\n").unwrap();
        fs::write(&second, "the cat ran\n").unwrap();

        let tokenizer = Tokenizer::build(&[first, second], None, 1).unwrap();
        assert_eq!(tokenizer.corpus_size(), 8);
        assert_eq!(&tokenizer.words()[..2], &["the", "cat"]);
        assert_eq!(&tokenizer.word_counts()[..2], &[3, 2]);

        let words_path = dir.path().join("words.txt");
        let counts_path = dir.path().join("word_counts.txt");
        tokenizer.save_words(&words_path).unwrap();
        tokenizer.save_word_counts(&counts_path).unwrap();

        let reloaded = Tokenizer::load(&words_path, &counts_path).unwrap();
        assert_eq!(reloaded.words(), tokenizer.words());
        assert_eq!(reloaded.word_counts(), tokenizer.word_counts());
    }

    #[test]
    fn misaligned_parts_are_rejected() {
        let words = vec!["a".to_string(), "b".to_string()];
        assert!(Tokenizer::from_parts(words.clone(), vec![1], 1).is_err());
        assert!(Tokenizer::from_parts(words, vec![1, 0], 1).is_err());
    }

    #[test]
    fn empty_corpus_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, "\n\n").unwrap();
        assert!(matches!(Tokenizer::build(&[empty], None, 1), Err(Error::Config(_))));
    }
}
