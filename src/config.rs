//! Configuration loading and persistence.
//!
//! Settings come from `config.json` in the config directory, then from
//! `WLBROKER_*` environment variables. Missing fields fall back to the
//! defaults in [`crate::constants`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::{Path, PathBuf}};

use crate::constants;
use crate::manager::ManagerSettings;

/// Broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Socket the daemon listens on. Defaults to the runtime directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Compositor socket name or absolute path. Defaults to `WAYLAND_DISPLAY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wayland_display: Option<String>,
    /// Minimum gap between broadcasts, in milliseconds.
    pub debounce_ms: u64,
    /// Actor queue length.
    pub queue_capacity: usize,
    /// Per-subscriber queue length.
    pub subscriber_capacity: usize,
    /// How often an idle worker polls the compositor, in milliseconds.
    pub idle_poll_ms: u64,
    /// Bound on compositor acknowledgements, in seconds.
    pub ack_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            wayland_display: None,
            debounce_ms: millis(constants::DEFAULT_DEBOUNCE),
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            subscriber_capacity: constants::DEFAULT_SUBSCRIBER_CAPACITY,
            idle_poll_ms: millis(constants::DEFAULT_IDLE_INTERVAL),
            ack_timeout_secs: constants::DEFAULT_ACK_TIMEOUT.as_secs(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `WLBROKER_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("WLBROKER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("wlbroker")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.json` from `dir`, or defaults if the file is absent.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(constants::CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config: {}", config_path.display()))
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Write `config.json` into `dir` with owner-only permissions.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(constants::CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `WLBROKER_*` overrides read through `lookup`.
    ///
    /// Unparseable numbers are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup("WLBROKER_SOCKET") {
            self.socket_path = Some(PathBuf::from(socket));
        }

        if let Some(display) = lookup("WLBROKER_WAYLAND_DISPLAY") {
            self.wayland_display = Some(display);
        }

        parse_into(&lookup, "WLBROKER_DEBOUNCE_MS", &mut self.debounce_ms);
        parse_into(&lookup, "WLBROKER_QUEUE_CAPACITY", &mut self.queue_capacity);
        parse_into(&lookup, "WLBROKER_SUBSCRIBER_CAPACITY", &mut self.subscriber_capacity);
        parse_into(&lookup, "WLBROKER_IDLE_POLL_MS", &mut self.idle_poll_ms);
        parse_into(&lookup, "WLBROKER_ACK_TIMEOUT_SECS", &mut self.ack_timeout_secs);
    }

    /// Core tuning derived from this configuration.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            queue_capacity: self.queue_capacity.max(1),
            subscriber_capacity: self.subscriber_capacity.max(1),
            debounce: Duration::from_millis(self.debounce_ms),
            idle_interval: Duration::from_millis(self.idle_poll_ms.max(1)),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        }
    }

    /// Value of field `key` as JSON, if there is such a field.
    pub fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let fields = serde_json::to_value(self)?;
        Ok(fields.get(key).cloned())
    }

    /// Set field `key` from `raw`, which is read as JSON and otherwise
    /// taken as a plain string.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let serde_json::Value::Object(mut fields) = serde_json::to_value(&*self)? else {
            anyhow::bail!("config is not an object");
        };
        let known = serde_json::to_value(Self::default())?
            .as_object()
            .is_some_and(|defaults| defaults.contains_key(key))
            || matches!(key, "socket_path" | "wayland_display");
        if !known {
            anyhow::bail!("Unknown config key '{key}'");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
        *self = serde_json::from_value(serde_json::Value::Object(fields))
            .with_context(|| format!("Invalid value for '{key}': {raw}"))?;
        Ok(())
    }

    /// Path of the daemon socket.
    pub fn socket_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.socket_path {
            return Ok(path.clone());
        }
        let dir = match dirs::runtime_dir() {
            Some(dir) => dir,
            None => Self::config_dir()?,
        };
        Ok(dir.join(constants::SOCKET_NAME))
    }
}

fn parse_into<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring {key}={raw:?}: not a number"),
        }
    }
}
