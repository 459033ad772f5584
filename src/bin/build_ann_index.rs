use std::process;
use tracing::error;
use word2vec_trainer::Run;

// builds an approximate nearest neighbour index over the last embedding weights of a
// training run. the single argument is a json file, for example:
// {
//   "model_training_output_dir": "Output", "model_name": "word2vec", "dataset_name": "enwiki",
//   "vocab_size": 10000, "output_dir": "Output",
//   "ann": { "backend": "trees", "n_trees": 50 }
// }
fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = Run::run_build_ann_index() {
        error!("{}", e);
        process::exit(1);
    }
}
