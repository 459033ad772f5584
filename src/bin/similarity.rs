use std::{env, io::BufRead, path::Path, process};
use tracing::error;
use word2vec_trainer::ann::{AnnBackendKind, Metric};
use word2vec_trainer::{files_handling, load_model_training_output_with, Error, Result, Similarity, TrainingOutputOptions};

const USAGE: &str =
    "usage: <a|b> <inputs file> <output dir> <model name> <dataset name> [trees|partitions [euclidean|angular]]";


// checks on trained vectors: the K most similar words to a given word,
// or the K most similar words to an analogy combination.
// treated as binary executable so it can be ran independently from training

fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {

    // arguments to this executable should be:
    // a letter selector: "a" for analogies, "b" for word similarity
    // path to input based on selector (quads or singles)
    // training output dir, model name, dataset name
    // optionally the backend of an index built over the same weights (the last one in
    // the output dir is used) and the metric it was built with, euclidean by default
    // example: ... a Input/analogies.txt Output word2vec enwiki partitions angular
    let args: Vec<String> = env::args().collect();
    if !(6..=8).contains(&args.len()) {
        return Err(Error::Config(USAGE.to_string()));
    }
    let selector = args[1].as_str();
    let index = index_args(&args[6..])?;

    let options = TrainingOutputOptions {
        trees_index: matches!(index, Some((AnnBackendKind::Trees, _))),
        partitions_index: matches!(index, Some((AnnBackendKind::Partitions, _))),
        ann_metric: index.map(|(_, metric)| metric).unwrap_or(Metric::Euclidean),
        ..Default::default()
    };
    let output = load_model_training_output_with(Path::new(&args[3]), &args[4], &args[5], &options)?;
    let w = output.last_embedding_weights.to_f32()?;
    let approx_nn = match index {
        Some((kind, _)) => {
            let found = match kind {
                AnnBackendKind::Trees => output.trees_index,
                AnnBackendKind::Partitions => output.partitions_index,
            };
            Some(found.ok_or_else(|| Error::Config(format!("no {} index for {}_{} in {}", kind, args[4], args[5], args[3])))?)
        }
        None => None,
    };
    let sim_obj = Similarity::new(output.words, w.view(), approx_nn)?;

    let lines = files_handling::open_text(Path::new(&args[2]))?
        .lines()
        .collect::<std::io::Result<Vec<String>>>()?;

    match selector {
        // each line holds quartets separated by a space, e.g. king queen man woman
        "a" => {
            let inputs = lines
                .iter()
                .map(|line| line.split_whitespace().collect::<Vec<&str>>())
                .collect::<Vec<Vec<&str>>>();
            run_analogies(&inputs, 10, &sim_obj)
        }
        // one token per line
        "b" => run_similarity(&lines, 10, &sim_obj),
        _ => Err(Error::Config(format!("unrecognized pattern in first argument {}", selector))),
    }
}

// optional trailing backend and metric
fn index_args(args: &[String]) -> Result<Option<(AnnBackendKind, Metric)>> {
    match args {
        [] => Ok(None),
        [kind] => Ok(Some((kind.parse()?, Metric::Euclidean))),
        [kind, metric] => Ok(Some((kind.parse()?, metric.parse()?))),
        _ => Err(Error::Config(USAGE.to_string())),
    }
}

fn run_analogies(inputs: &[Vec<&str>], k: usize, similarity_object: &Similarity) -> Result<()> {

    // a is to b as c is to ? translates to b - a + c
    let mut quads = Vec::with_capacity(inputs.len());
    for input in inputs {

        if input.len() != 4 {
            return Err(Error::Config(format!("expected 4 words per analogy, got {:?}", input)));
        }
        let source = [input[0], input[1], input[2]];
        let target = input[3];
        quads.push([input[0], input[1], input[2], input[3]]);

        let analogies = match similarity_object.extract_analogies(source, k) {
            Ok(analogies) => analogies,
            Err(e) => {
                println!("{}\n", e);
                continue;
            }
        };
        let mut found_target = false;
        for (i, (analogy, score)) in analogies.iter().enumerate() {
            println!("{} : {} - {} + {} ? {} = {}", i, source[1], source[0], source[2], analogy, score);
            if analogy == target {
                found_target = true;
                println!("found target '{}' analogy in place {}", target, 1 + i);
            }
        }
        if !found_target {
            println!("target '{}' was not found within the first {} analogies", target, k);
        }
        println!();
    }

    let accuracy = similarity_object.evaluate_word_analogies(&quads, 1)?;
    println!("top-1 accuracy (inputs excluded): {}", accuracy);
    Ok(())
}

fn run_similarity(inputs: &[String], k: usize, similarity_object: &Similarity) -> Result<()> {

    for token in inputs.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {

        println!("searching {} most similar words to {}", k, token);
        let vec = similarity_object.extract_vec_from_word(token)?;
        let similarities = similarity_object.find_k_most_similar(vec.view(), k)?;
        for (i, (similar_token, score)) in similarities.iter().enumerate() {
            println!("{} : {} ? {} = {}", i, token, similar_token, score);
        }
        println!();
    }
    Ok(())
}
