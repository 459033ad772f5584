use crate::ann::{normalize, normalize_rows, ApproxNN, Query};
use crate::error::{Error, Result};

use ndarray::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info};

/// Cosine similarity queries over L2 normalized embeddings, optionally served by an
/// approximate nearest neighbour index built over (a prefix of) the same rows.
pub struct Similarity {
    w: Array2<f32>,
    t2i: HashMap<String, usize>,
    i2t: Vec<String>,
    approx_nn: Option<ApproxNN>,
}

impl Similarity {

    pub fn new(words: Vec<String>, w: ArrayView2<f32>, approx_nn: Option<ApproxNN>) -> Result<Similarity> {

        if words.len() != w.nrows() {
            return Err(Error::config(format!("{} words for {} embedding rows", words.len(), w.nrows())));
        }
        if let Some(index) = &approx_nn {
            if index.dim() != w.ncols() || index.len() > w.nrows() {
                return Err(Error::IndexMismatch {
                    what: "shape",
                    expected: format!("at most {} items of dimension {}", w.nrows(), w.ncols()),
                    found: format!("{} items of dimension {}", index.len(), index.dim()),
                });
            }
        }

        // need to normalize w so each entry norm l2 is 1
        let w = normalize_rows(w);
        let t2i = words.iter().enumerate().map(|(i, t)| (t.clone(), i)).collect();

        Ok(Self { w, t2i, i2t: words, approx_nn })
    }

    pub fn extract_vec_from_word(&self, token: &str) -> Result<Array1<f32>> {
        match self.t2i.get(token) {
            Some(i) => Ok(self.w.row(*i).to_owned()),
            None => Err(Error::config(format!("token: {} is not in the vocabulary", token))),
        }
    }

    /// The `k` words most cosine-similar to `vec`, best first.
    pub fn find_k_most_similar(&self, vec: ArrayView1<f32>, k: usize) -> Result<Vec<(String, f32)>> {

        if vec.len() != self.w.ncols() {
            return Err(Error::config(format!("vector of dimension {} for embeddings of dimension {}", vec.len(), self.w.ncols())));
        }
        let unit = normalize(vec);

        let ids: Vec<usize> = match &self.approx_nn {
            Some(index) => index.search_ids(Query::Vector(unit.view()), k)?,
            None => {
                // multiply all vectors by the query vector, of size vocab size
                let scores = self.w.dot(&unit);
                let mut indexed_scores: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
                // sort by most similar in descending order
                indexed_scores.sort_by(|(i, s), (j, t)| t.total_cmp(s).then_with(|| i.cmp(j)));
                indexed_scores.into_iter().take(k).map(|(i, _)| i).collect()
            }
        };

        Ok(ids
            .into_iter()
            .map(|i| (self.i2t[i].clone(), self.w.row(i).dot(&unit)))
            .collect())
    }

    /// `b - a + c` for the analogy "a is to b as c is to ?".
    pub fn extract_analogy_vec(&self, inputs: [&str; 3]) -> Result<Array1<f32>> {
        let a = self.extract_vec_from_word(inputs[0])?;
        let b = self.extract_vec_from_word(inputs[1])?;
        let c = self.extract_vec_from_word(inputs[2])?;
        Ok(b - a + c)
    }

    pub fn extract_analogies(&self, inputs: [&str; 3], k: usize) -> Result<Vec<(String, f32)>> {
        let analogy = self.extract_analogy_vec(inputs)?;
        self.find_k_most_similar(analogy.view(), k)
    }

    /// Share of analogies `[a, b, c, d]` whose `d` is among the `top_n` answers, the
    /// three inputs excluded. Analogies with unknown words are skipped; NaN when none is left.
    pub fn evaluate_word_analogies(&self, analogies: &[[&str; 4]], top_n: usize) -> Result<f64> {

        let mut evaluated = 0usize;
        let mut correct = 0usize;
        for quad in analogies {
            if quad.iter().any(|word| !self.t2i.contains_key(*word)) {
                debug!("skipping analogy {:?}, not in vocabulary", quad);
                continue;
            }
            let source = [quad[0], quad[1], quad[2]];
            let answers = self.extract_analogies(source, top_n + source.len())?;
            let hit = answers
                .iter()
                .filter(|(word, _)| !source.contains(&word.as_str()))
                .take(top_n)
                .any(|(word, _)| word == quad[3]);
            evaluated += 1;
            if hit {
                correct += 1;
            }
        }

        info!("{} of {} analogies evaluated, {} correct", evaluated, analogies.len(), correct);
        if evaluated == 0 {
            return Ok(f64::NAN);
        }
        Ok(correct as f64 / evaluated as f64)
    }
}
