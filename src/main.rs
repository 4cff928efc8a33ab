use clap::Parser;
use std::process;

mod cli;

fn main() {
    env_logger::init();
    let settings = cli::Settings::parse();
    if let Err(e) = cli::run(&settings) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
