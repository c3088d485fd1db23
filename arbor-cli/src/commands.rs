//! Subcommand implementations. Each returns what `main` prints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use arbor_core::config::Config;
use arbor_core::shutdown::wait_for_signal;
use arbor_core::{Address, Node, Subnet};
use serde_json::json;
use tracing::{info, warn};

/// Expand `~` and environment variables in a user supplied path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("expanding {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Read a config file, then apply `ARBOR_*` overrides.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(raw) = path else {
        return Config::from_env().context("loading config from environment");
    };
    let path = expand_path(raw)?;
    let mut config = Config::from_file(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    config.apply_env().context("applying environment overrides")?;
    config.validate().context("validating config")?;
    Ok(config)
}

/// A fresh config with new keys, as TOML or JSON.
pub fn genconf(json: bool) -> Result<String> {
    let config = Config::generate();
    if json {
        Ok(serde_json::to_string_pretty(&config)?)
    } else {
        Ok(toml::to_string_pretty(&config)?)
    }
}

/// Write a fresh config to `path`, refusing to overwrite.
pub fn genconf_to_file(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    Config::generate()
        .save_to_file(path)
        .with_context(|| format!("writing {}", path.display()))
}

/// Address, subnet and public keys for the keys in `config`.
pub fn address(config: &Config, json: bool) -> Result<String> {
    if config.node.box_private_key.is_empty() {
        anyhow::bail!("config has no box_private_key; generate one with `arbor genconf`");
    }
    let keys = config.node_keys()?;
    let address = Address::for_key(&keys.box_keys.public);
    let subnet = Subnet::for_key(&keys.box_keys.public);

    if json {
        let out = json!({
            "address": address.to_string(),
            "subnet": subnet.to_string(),
            "box_public_key": keys.box_keys.public.to_hex(),
            "signing_public_key": keys.sig_keys.public.to_hex(),
            "node_id": keys.node_id().to_hex(),
        });
        return Ok(serde_json::to_string_pretty(&out)?);
    }
    Ok(format!(
        "address: {}\nsubnet: {}\nbox public key: {}\nsigning public key: {}",
        address,
        subnet,
        keys.box_keys.public.to_hex(),
        keys.sig_keys.public.to_hex(),
    ))
}

/// Start a node and keep it up until SIGINT/SIGTERM.
pub async fn run(config: Config, status_interval: Duration) -> Result<()> {
    if config.metrics.enabled {
        arbor_core::metrics::init_metrics();
    }
    if config.node.box_private_key.is_empty() {
        warn!("No keys configured, using ephemeral keys for this run");
    }

    let node = Node::start(config).await.context("starting node")?;
    let me = node.self_info();
    info!(
        address = %me.address,
        subnet = %me.subnet,
        key = %me.box_key.to_hex(),
        "Node running"
    );

    let mut status = tokio::time::interval(status_interval);
    status.tick().await;
    let signal = wait_for_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            r = &mut signal => {
                if let Err(e) = r {
                    warn!(error = %e, "Signal handler failed");
                }
                break;
            }
            _ = status.tick() => log_status(&node).await,
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn log_status(node: &Node) {
    let me = node.self_info();
    let peers = node.peers().await.map(|p| p.len()).unwrap_or_default();
    let sessions = node.sessions().await.map(|s| s.len()).unwrap_or_default();
    let dht = node.dht().await.map(|d| d.entries.len()).unwrap_or_default();
    info!(
        root = %me.root.to_hex(),
        coords = ?me.coords,
        peers,
        sessions,
        dht_entries = dht,
        "Status"
    );
}
