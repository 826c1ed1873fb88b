use anyhow::Result;
use clap::Parser;
use log::{error, info};

use outbound_sync::cli::Cli;
use outbound_sync::config::AppConfig;
use outbound_sync::error::SyncError;
use outbound_sync::runner::RunController;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;

    // Log to file, truncated on each run.
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&config.log_file)?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    info!("Starting outbound-sync");

    let controller = RunController::new(config);
    match controller.run(&cli).await {
        Ok(summary) => {
            info!(
                "Completed run {} for {} in {:?}",
                summary.run_id, summary.customer, summary.duration
            );
            if summary.report.has_failures() {
                error!(
                    "{} resource(s) failed during run {}",
                    summary.report.failure_count(),
                    summary.run_id
                );
            }
            Ok(())
        }
        Err(err) => {
            error!("Run failed at {} stage: {}", err.stage(), err);
            let code = match err {
                SyncError::HandshakeConnect { .. }
                | SyncError::HandshakeTimeout { .. }
                | SyncError::HandshakeMarker { .. } => 2,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}
