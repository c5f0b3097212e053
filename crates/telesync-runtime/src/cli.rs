//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use telesync_core::Scope;

use crate::config::SyncConfig;

#[derive(Parser)]
#[command(name = "telesync", about = "Client-side telemetry sync")]
pub struct Cli {
    /// Config file (default: ./telesync.toml when present)
    #[arg(long, short = 'c', global = true, env = "TELESYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Outbound queue database path
    #[arg(long, global = true, env = "TELESYNC_DB")]
    pub db_path: Option<PathBuf>,

    /// Backend base URL for delivery and consent
    #[arg(long, global = true, env = "TELESYNC_BASE_URL")]
    pub base_url: Option<String>,

    /// API key sent as `x-api-key`
    #[arg(long, global = true, env = "TELESYNC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest, aggregate and flush until Ctrl-C
    Run(RunOpts),
    /// Enqueue envelopes from a JSONL file
    Enqueue(EnqueueOpts),
    /// Flush one batch and exit
    Flush(FlushOpts),
    /// Print pending records as JSON lines
    Pending(PendingOpts),
    /// Record a participant's consent scopes
    Consent(ConsentOpts),
}

#[derive(clap::Args)]
pub struct RunOpts {
    /// Telemetry WebSocket URL
    #[arg(long, env = "TELESYNC_STREAM_URL")]
    pub stream_url: Option<String>,

    /// Session to subscribe to
    #[arg(long)]
    pub session_id: Option<String>,

    /// Flush interval in milliseconds
    #[arg(long)]
    pub flush_interval_ms: Option<u64>,

    /// JSONL file replayed into the outbound queue
    #[arg(long)]
    pub replay: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct EnqueueOpts {
    /// JSONL file with one envelope per line
    pub file: PathBuf,

    /// Queue priority (lower is sent first)
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
}

#[derive(clap::Args)]
pub struct FlushOpts {
    #[arg(long)]
    pub batch_size: Option<usize>,
}

#[derive(clap::Args)]
pub struct PendingOpts {
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

#[derive(clap::Args)]
pub struct ConsentOpts {
    #[arg(long)]
    pub participant: String,

    /// Granted scope; repeat for several
    #[arg(long = "scope", required = true)]
    pub scopes: Vec<Scope>,
}

impl Cli {
    /// Flags and their env vars win over file values.
    pub fn apply_overrides(&self, config: &mut SyncConfig) {
        if let Some(db_path) = &self.db_path {
            config.outbound.db_path = db_path.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.outbound.base_url = base_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.outbound.api_key = Some(api_key.clone());
            config.inbound.api_key = Some(api_key.clone());
        }
        match &self.command {
            Command::Run(opts) => {
                if let Some(url) = &opts.stream_url {
                    config.inbound.url = Some(url.clone());
                }
                if let Some(session_id) = &opts.session_id {
                    config.inbound.session_id = session_id.clone();
                }
                if let Some(ms) = opts.flush_interval_ms {
                    config.outbound.flush_interval_ms = ms;
                }
                if let Some(replay) = &opts.replay {
                    config.source.replay_path = Some(replay.clone());
                }
            }
            Command::Flush(opts) => {
                if let Some(batch_size) = opts.batch_size {
                    config.outbound.batch_size = batch_size;
                }
            }
            Command::Enqueue(_) | Command::Pending(_) | Command::Consent(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "telesync",
            "--db-path",
            "/tmp/q.db",
            "run",
            "--stream-url",
            "ws://127.0.0.1:9/streams/ws",
            "--session-id",
            "sess-2",
            "--flush-interval-ms",
            "250",
        ])
        .unwrap();
        let mut config = SyncConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.outbound.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.outbound.flush_interval_ms, 250);
        assert_eq!(config.inbound.url.as_deref(), Some("ws://127.0.0.1:9/streams/ws"));
        assert_eq!(config.inbound.session_id, "sess-2");
    }

    #[test]
    fn consent_parses_repeated_scopes() {
        let cli = Cli::try_parse_from([
            "telesync", "consent", "--participant", "p-1", "--scope", "wearables", "--scope", "text",
        ])
        .unwrap();
        let Command::Consent(opts) = cli.command else {
            panic!("expected consent");
        };
        assert_eq!(opts.scopes, vec![Scope::Wearables, Scope::Text]);
    }

    #[test]
    fn unknown_scope_is_rejected() {
        assert!(
            Cli::try_parse_from(["telesync", "consent", "--participant", "p", "--scope", "dreams"])
                .is_err()
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["telesync", "flush", "--batch-size", "7", "--base-url", "http://h"])
            .unwrap();
        let mut config = SyncConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.outbound.batch_size, 7);
        assert_eq!(config.outbound.base_url, "http://h");
    }
}
