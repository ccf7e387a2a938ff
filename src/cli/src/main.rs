//! kra CLI entry point.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use kra_cli::commands::{dispatch, load_config, log_filter, Cli};
use kra_cli::signal::{wait_for_interrupts, INTERRUPTED_EXIT};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli, &config))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if wait_for_interrupts(tokio::signal::ctrl_c, cancel).await {
                eprintln!("Interrupted");
                std::process::exit(INTERRUPTED_EXIT);
            }
        }
    });

    if let Err(e) = dispatch(cli, config, cancel).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
