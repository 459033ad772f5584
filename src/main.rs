use std::process;
use tracing::error;
use word2vec_trainer::Run;

fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = Run::run() {
        error!("{}", e);
        process::exit(1);
    }
}
