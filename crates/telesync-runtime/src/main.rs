//! telesync: client-side telemetry sync binary.
//! Outbound queue, delivery courier and inbound stream aggregation in one process.

use clap::Parser;

mod cli;
mod cmd_consent;
mod cmd_queue;
mod config;
mod run;

use config::SyncConfig;

/// `TELESYNC_LOG`, then `RUST_LOG`, then the config file, then `info`.
fn log_filter(config: &SyncConfig) -> String {
    std::env::var("TELESYNC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .or_else(|| config.logging.filter.clone())
        .unwrap_or_else(|| "info".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let mut config = SyncConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter(&config)))
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        cli::Command::Run(_) => {
            tracing::info!("telesync starting");
            run::run_sync(config).await?;
        }
        cli::Command::Enqueue(opts) => {
            cmd_queue::cmd_enqueue(&config, &opts.file, opts.priority)?;
        }
        cli::Command::Flush(_) => {
            cmd_queue::cmd_flush(&config).await?;
        }
        cli::Command::Pending(opts) => {
            cmd_queue::cmd_pending(&config, opts.limit)?;
        }
        cli::Command::Consent(opts) => {
            cmd_consent::cmd_consent(&config, &opts.participant, &opts.scopes).await?;
        }
    }

    Ok(())
}
