use anyhow::Context;
use clap::Parser;
use tracing::error;

use fleet_core::cli::{self, Cli, Commands};
use fleet_core::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref()).context("loading configuration")?;
    let _log_guard = logging::init(&config.logging).context("initializing logging")?;

    let result = match &cli.command {
        Commands::Run { node_id } => {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = std::sync::Mutex::new(Some(tx));
            ctrlc::set_handler(move || {
                if let Some(tx) = tx.lock().ok().and_then(|mut tx| tx.take()) {
                    let _ = tx.send(());
                }
            })
            .context("installing Ctrl+C handler")?;
            cli::run_node(&config, node_id.clone(), rx).await
        }
        command => cli::execute(&config, command).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result.map_err(anyhow::Error::from)
}
