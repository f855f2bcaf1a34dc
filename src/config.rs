//! Configuration loading.
//!
//! Both processes read a JSON file once at startup and then apply
//! environment variable overrides. Nothing is hot-reloaded.
//!
//! - [`RelayConfig`]: listen address, allow-list, liveness timing
//! - [`AgentConfig`]: relay endpoint, geofence rules, client timing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::constants;
use crate::geofence::GeofenceRule;
use crate::signature::{self, SignatureError};

/// Returns the configuration directory path, creating it if necessary.
///
/// `GEOTRIGGER_CONFIG_DIR` overrides the platform config dir
/// (e.g. `~/.config/geotrigger` on Linux).
pub fn config_dir() -> Result<PathBuf> {
    let dir = if let Ok(custom_dir) = env::var("GEOTRIGGER_CONFIG_DIR") {
        PathBuf::from(custom_dir)
    } else {
        dirs::config_dir()
            .context("Could not determine config directory")?
            .join("geotrigger")
    };
    fs::create_dir_all(&dir).context("Failed to create config directory")?;
    Ok(dir)
}

/// Serde adapter for durations written as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Configuration for the relay hub.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Socket address to listen on.
    pub bind_addr: String,
    /// Base64 public key of the location publisher.
    pub publisher_key: String,
    /// Base64 public keys of the consuming agents.
    pub agent_keys: Vec<String>,
    /// Require a valid payload signature on every relayed frame.
    pub require_signed_payloads: bool,
    /// Deadline for the `register` frame.
    #[serde(rename = "registrationTimeoutMs", with = "millis")]
    pub registration_timeout: Duration,
    /// Maximum silence from an authenticated connection.
    #[serde(rename = "livenessWindowMs", with = "millis")]
    pub liveness_window: Duration,
    /// Interval of the coarse liveness sweep.
    #[serde(rename = "sweepIntervalMs", with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: constants::DEFAULT_BIND_ADDR.to_string(),
            publisher_key: String::new(),
            agent_keys: Vec::new(),
            require_signed_payloads: false,
            registration_timeout: constants::REGISTRATION_TIMEOUT,
            liveness_window: constants::LIVENESS_WINDOW,
            sweep_interval: constants::LIVENESS_SWEEP_INTERVAL,
        }
    }
}

impl RelayConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => read_json(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind_addr) = env::var("GEOTRIGGER_BIND_ADDR") {
            self.bind_addr = bind_addr;
        }

        if let Ok(key) = env::var("GEOTRIGGER_PUBLISHER_KEY") {
            self.publisher_key = key;
        }

        if let Ok(keys) = env::var("GEOTRIGGER_AGENT_KEYS") {
            self.agent_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Check that the allow-list is complete and every key decodes.
    pub fn validate(&self) -> Result<()> {
        if self.publisher_key.is_empty() {
            anyhow::bail!("Relay config is missing publisherKey");
        }
        if self.agent_keys.is_empty() {
            anyhow::bail!("Relay config needs at least one agent key");
        }
        for key in std::iter::once(&self.publisher_key).chain(&self.agent_keys) {
            signature::decode_public_key(key)
                .with_context(|| format!("Invalid public key in allow-list: {key}"))?;
        }
        if self.liveness_window.is_zero()
            || self.registration_timeout.is_zero()
            || self.sweep_interval.is_zero()
        {
            anyhow::bail!("Relay timeouts must be non-zero");
        }
        Ok(())
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Configuration for the automation agent.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Relay endpoint (`ws://`, `wss://`, `http://` or `https://`).
    #[serde(default)]
    pub relay_url: String,
    /// Geofence rules, one scheduling loop each.
    #[serde(alias = "rules")]
    pub scripts: Vec<GeofenceRule>,
    /// Base64 public key of the location publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_key: Option<String>,
    /// Drop location frames whose payload signature does not verify
    /// against `publisher_key`.
    #[serde(default)]
    pub verify_location_signatures: bool,
    /// Skip a tick while the rule's previous action is still running.
    #[serde(default)]
    pub skip_overlapping_actions: bool,
    /// Cadence of outbound heartbeats.
    #[serde(
        rename = "heartbeatIntervalMs",
        with = "millis",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval: Duration,
    /// Fixed delay between reconnect attempts.
    #[serde(
        rename = "reconnectDelayMs",
        with = "millis",
        default = "default_reconnect_delay"
    )]
    pub reconnect_delay: Duration,
}

fn default_heartbeat_interval() -> Duration {
    constants::HEARTBEAT_INTERVAL
}

fn default_reconnect_delay() -> Duration {
    constants::RECONNECT_DELAY
}

impl AgentConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = read_json(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON string without environment overrides.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse agent config")?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("GEOTRIGGER_RELAY_URL") {
            self.relay_url = url;
        }

        if let Ok(key) = env::var("GEOTRIGGER_PUBLISHER_KEY") {
            self.publisher_key = Some(key);
        }

        self.relay_url = crate::ws::http_to_ws_scheme(&self.relay_url);
    }

    /// Check rules and signature settings.
    pub fn validate(&self) -> Result<()> {
        if self.relay_url.is_empty() {
            anyhow::bail!("Agent config is missing relayUrl (or GEOTRIGGER_RELAY_URL)");
        }
        for (index, rule) in self.scripts.iter().enumerate() {
            rule.validate()
                .with_context(|| format!("Invalid rule #{index} ({})", rule.path))?;
        }
        if self.verify_location_signatures && self.publisher_key.is_none() {
            anyhow::bail!("verifyLocationSignatures requires publisherKey");
        }
        if let Some(key) = &self.publisher_key {
            signature::decode_public_key(key).context("Invalid publisherKey")?;
        }
        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeatIntervalMs must be non-zero");
        }
        Ok(())
    }

    /// Decoded publisher key, if configured.
    pub fn publisher_verifying_key(
        &self,
    ) -> Result<Option<ed25519_dalek::VerifyingKey>, SignatureError> {
        self.publisher_key
            .as_deref()
            .map(signature::decode_public_key)
            .transpose()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}
