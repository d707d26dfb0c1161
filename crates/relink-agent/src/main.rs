#![warn(missing_docs)]
//! relink beacon agent.
//!
//! Loads a TOML profile, builds the transport context once and drives the
//! init/beacon loop. Giving up when every destination is dead is this
//! loop's decision; the transport itself only reports it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relink_transport::cipher::{ChaCha20Cipher, NullCipher, PayloadCipher};
use relink_transport::config::TransportConfig;
use relink_transport::identity::NoImpersonation;
use relink_transport::Transport;

#[derive(Debug, Parser)]
#[command(name = "relink-agent", about = "relink beacon agent")]
struct Args {
    /// Path to the TOML profile.
    #[arg(long, default_value = "relink.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Profile {
    /// Seconds between beacons (default: 5).
    #[serde(default = "default_beacon_interval")]
    beacon_interval_secs: u64,
    /// Payload cipher keys; plaintext when absent.
    cipher: Option<CipherKeys>,
    transport: TransportConfig,
}

#[derive(Debug, Deserialize)]
struct CipherKeys {
    /// 64 hex chars (256-bit key).
    key: String,
    /// 24 hex chars (96-bit IV).
    iv: String,
}

fn default_beacon_interval() -> u64 {
    5
}

fn build_cipher(keys: Option<&CipherKeys>) -> anyhow::Result<Arc<dyn PayloadCipher>> {
    let Some(keys) = keys else {
        return Ok(Arc::new(NullCipher));
    };

    let key: [u8; 32] = hex::decode(&keys.key)
        .context("cipher key is not valid hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("cipher key must be 32 bytes"))?;
    let iv: [u8; 12] = hex::decode(&keys.iv)
        .context("cipher iv is not valid hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("cipher iv must be 12 bytes"))?;

    Ok(Arc::new(ChaCha20Cipher::new(key, iv)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading profile {}", args.config.display()))?;
    let profile: Profile = toml::from_str(&raw).context("parsing profile")?;

    let cipher = build_cipher(profile.cipher.as_ref())?;
    let agent_id = profile.transport.agent_id;
    let mut transport = Transport::new(profile.transport, cipher, Arc::new(NoImpersonation))?;

    tracing::info!(agent_id, "connecting to controller");
    let hello = agent_id.to_le_bytes().to_vec();
    if let Err(e) = transport.init(&hello).await {
        bail!("controller handshake failed: {e}");
    }
    tracing::info!("session established");

    let interval = Duration::from_secs(profile.beacon_interval_secs);
    loop {
        match transport.send(&hello, true).await {
            Ok(Some(response)) if !response.is_empty() => {
                tracing::info!(bytes = response.len(), "controller responded");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "beacon failed");
                if !transport.hosts_alive() {
                    tracing::error!("every configured host is dead, giving up");
                    break;
                }
            }
        }

        if transport.supports_recv() {
            match transport.recv().await {
                Ok(Some(job)) => tracing::info!(bytes = job.len(), "received job"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "pipe receive failed"),
            }
        }

        tokio::time::sleep(interval).await;
    }

    Ok(())
}
