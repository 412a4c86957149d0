mod cmd;
mod config;
mod error;

use clap::Parser;
use config::{Cli, Commands, Effective};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let args = match cli.command {
        Commands::Run(args) => args,
        Commands::Suites => {
            cmd::suites::list();
            return;
        }
    };

    let eff = match Effective::new(&args) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match cmd::run::run(eff).await {
        Ok(summary) if summary.aborted > 0 => std::process::exit(2),
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
