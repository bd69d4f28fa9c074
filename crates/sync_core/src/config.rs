use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::SyncError;

pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

pub const DEFAULT_METADATA_RELAYS: &[&str] = &["wss://purplepag.es", "wss://relay.damus.io"];

const ENV_PREFIX: &str = "SYNC__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub database_url: String,
    pub relays: Vec<String>,
    pub metadata_relays: Vec<String>,
    /// Backfill look-back window. `0` disables the window.
    pub backfill_max_age_secs: u64,
    pub dedup_capacity: usize,
    pub debounce_ms: u64,
    pub key_package_min_count: usize,
    pub rotation_cooldown_secs: u64,
    pub client_name: String,
    /// Un-mark a failed batch's ids so a redelivery in the same session is ingested again.
    pub forget_failed_batches: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/sync.db".into(),
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            metadata_relays: DEFAULT_METADATA_RELAYS
                .iter()
                .map(|r| r.to_string())
                .collect(),
            backfill_max_age_secs: 7 * 24 * 60 * 60,
            dedup_capacity: 1000,
            debounce_ms: 100,
            key_package_min_count: 3,
            rotation_cooldown_secs: 30,
            client_name: "relay-sync".into(),
            forget_failed_batches: true,
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rotation_cooldown(&self) -> Duration {
        Duration::from_secs(self.rotation_cooldown_secs)
    }

    /// Metadata relays followed by the default relays, without repeats.
    pub fn lookup_relays(&self) -> Vec<String> {
        let mut relays = self.metadata_relays.clone();
        for relay in &self.relays {
            if !relays.contains(relay) {
                relays.push(relay.clone());
            }
        }
        relays
    }
}

/// Defaults, then the TOML file at `path` if it exists, then `SYNC__*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> SyncSettings {
    let mut settings = match path {
        Some(path) => read_file(path).unwrap_or_default(),
        None => SyncSettings::default(),
    };
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.relays = normalize_relays(&settings.relays);
    settings.metadata_relays = normalize_relays(&settings.metadata_relays);
    settings
}

fn read_file(path: &Path) -> Option<SyncSettings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "settings file not read");
            return None;
        }
    };
    match toml::from_str::<SyncSettings>(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring invalid settings file");
            None
        }
    }
}

pub(crate) fn apply_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_ascii_uppercase()));

    if let Some(v) = var("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = var("relays") {
        settings.relays = split_list(&v);
    }
    if let Some(v) = var("metadata_relays") {
        settings.metadata_relays = split_list(&v);
    }
    if let Some(v) = var("client_name") {
        settings.client_name = v;
    }
    parse_into(var("backfill_max_age_secs"), "backfill_max_age_secs", &mut settings.backfill_max_age_secs);
    parse_into(var("dedup_capacity"), "dedup_capacity", &mut settings.dedup_capacity);
    parse_into(var("debounce_ms"), "debounce_ms", &mut settings.debounce_ms);
    parse_into(var("key_package_min_count"), "key_package_min_count", &mut settings.key_package_min_count);
    parse_into(var("rotation_cooldown_secs"), "rotation_cooldown_secs", &mut settings.rotation_cooldown_secs);
    parse_into(var("forget_failed_batches"), "forget_failed_batches", &mut settings.forget_failed_batches);
}

fn parse_into<T: std::str::FromStr>(raw: Option<String>, field: &str, slot: &mut T) {
    let Some(raw) = raw else { return };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(field, value = %raw, "ignoring invalid settings override"),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn validate_relay_url(raw: &str) -> Result<String, SyncError> {
    let url = Url::parse(raw).map_err(|err| SyncError::InvalidRelayUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(raw.trim_end_matches('/').to_string()),
        other => Err(SyncError::InvalidRelayUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Drops invalid or repeated relay urls, keeping first-seen order.
pub fn normalize_relays(relays: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(relays.len());
    for raw in relays {
        match validate_relay_url(raw) {
            Ok(url) if !out.contains(&url) => out.push(url),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "dropping relay"),
        }
    }
    out
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
