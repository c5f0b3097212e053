//! `telesync consent`: grant scopes for a participant.

use telesync_core::Scope;
use telesync_queue::ConsentClient;

use crate::config::SyncConfig;
use crate::run::http_client;

pub async fn cmd_consent(
    config: &SyncConfig,
    participant: &str,
    scopes: &[Scope],
) -> anyhow::Result<()> {
    let client = ConsentClient::new(http_client()?, config.consent_url())
        .with_api_key(config.outbound.api_key.clone());
    client.grant(participant, scopes).await?;
    let names: Vec<&str> = scopes.iter().map(|s| s.as_str()).collect();
    println!("granted {} for {participant}", names.join(","));
    Ok(())
}
