//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the event store.
    pub store_root: PathBuf,
    /// Relays holding app, release and stack events.
    pub relays_catalog: Vec<String>,
    /// Relays queried for author profiles. Falls back to the catalog
    /// relays when unset.
    pub relays_profile: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Optional platform filter for app listings (`f` tag value).
    pub platform: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let relays_catalog = csv_strings(env::var("RELAYS_CATALOG").unwrap_or_default());
        let mut relays_profile = csv_strings(env::var("RELAYS_PROFILE").unwrap_or_default());
        if relays_profile.is_empty() {
            relays_profile = relays_catalog.clone();
        }
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let platform = env::var("PLATFORM_TAG").ok().filter(|s| !s.is_empty());
        Ok(Self {
            store_root,
            relays_catalog,
            relays_profile,
            tor_socks,
            platform,
        })
    }
}

/// Serializes tests that touch process environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
