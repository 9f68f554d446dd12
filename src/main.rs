use clap::Parser;
use tracing_subscriber::EnvFilter;

use beamgen_lib::cli;

#[derive(Parser)]
#[command(name = "beamgen")]
#[command(about = "Iterative image-refinement search engine")]
struct Args {
    #[command(subcommand)]
    command: cli::Commands,
}

fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("beamgen=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = cli::run(args.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
