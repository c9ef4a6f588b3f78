use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::apply::{ApplyMode, OnError};
use crate::capture::CaptureMode;
use crate::datastore::DatastoreDescriptor;
use crate::mapping::{ConflictResolution, TableMapping};
use crate::retry::RetryConfig;
use crate::{Error, Result};

const ENV_PREFIX: &str = "CDC_RELAY";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub datastores: Vec<DatastoreDescriptor>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Dotted paths of fields present in the source but not understood.
    #[serde(skip)]
    pub unknown_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            control_addr: default_control_addr(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub tables: Vec<TableMapping>,
    /// Maximum events per apply batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time a partial batch waits before it is applied.
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: f64,
    /// Lag above which the subscription reports itself as lagging.
    #[serde(default = "default_latency_tolerance_secs")]
    pub latency_tolerance_secs: u64,
    /// Capacity of the bounded queue between capture and apply.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_capture_page_size")]
    pub capture_page_size: usize,
}

impl ChannelConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_timeout_secs.max(0.0))
    }

    pub fn latency_tolerance(&self) -> Duration {
        Duration::from_secs(self.latency_tolerance_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub name: String,
    pub channel: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub apply_mode: ApplyMode,
    /// Policy for tables whose mapping does not set one.
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    /// Name of the resolver registered with the engine for `custom`.
    #[serde(default)]
    pub custom_resolver: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub on_error: OnError,
    /// Forces a capture mode instead of choosing by source capability.
    #[serde(default)]
    pub capture_mode: Option<CaptureMode>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::from_settings(settings)
    }

    /// Parses a TOML document, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let raw: serde_json::Value = settings
            .clone()
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        let known = serde_json::to_value(&config)?;
        let mut unknown = Vec::new();
        collect_unknown_fields(&raw, &known, "", &mut unknown);
        config.unknown_fields = unknown;

        Ok(config)
    }

    /// Logs every field that was not understood. Never fatal.
    pub fn warn_unknown_fields(&self) {
        for field in &self.unknown_fields {
            warn!(field = %field, "Ignoring unknown configuration field");
        }
    }

    /// Checks names and cross references between sections.
    pub fn validate(&self) -> Result<()> {
        let mut datastores = HashSet::new();
        for datastore in &self.datastores {
            if !datastores.insert(datastore.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate datastore name '{}'",
                    datastore.name
                )));
            }
        }

        let mut channels = HashSet::new();
        for channel in &self.channels {
            if !channels.insert(channel.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            for datastore in [&channel.source, &channel.target] {
                if !datastores.contains(datastore.as_str()) {
                    return Err(Error::Config(format!(
                        "channel '{}' references unknown datastore '{}'",
                        channel.name, datastore
                    )));
                }
            }
            if channel.batch_size == 0 {
                return Err(Error::Config(format!(
                    "channel '{}': batch_size must be at least 1",
                    channel.name
                )));
            }
            if channel.queue_capacity == 0 {
                return Err(Error::Config(format!(
                    "channel '{}': queue_capacity must be at least 1",
                    channel.name
                )));
            }
            if channel.capture_page_size == 0 {
                return Err(Error::Config(format!(
                    "channel '{}': capture_page_size must be at least 1",
                    channel.name
                )));
            }
        }

        let mut subscriptions = HashSet::new();
        for subscription in &self.subscriptions {
            if !subscriptions.insert(subscription.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate subscription name '{}'",
                    subscription.name
                )));
            }
            let channel = self.channel(&subscription.channel).ok_or_else(|| {
                Error::Config(format!(
                    "subscription '{}' references unknown channel '{}'",
                    subscription.name, subscription.channel
                ))
            })?;
            if subscription.retry.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "subscription '{}': retry.max_attempts must be at least 1",
                    subscription.name
                )));
            }
            let uses_custom = subscription.conflict_resolution == ConflictResolution::Custom
                || channel
                    .tables
                    .iter()
                    .any(|t| t.conflict_resolution == Some(ConflictResolution::Custom));
            if uses_custom && subscription.custom_resolver.is_none() {
                return Err(Error::Config(format!(
                    "subscription '{}' uses custom conflict resolution without custom_resolver",
                    subscription.name
                )));
            }
        }

        Ok(())
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn subscription(&self, name: &str) -> Option<&SubscriptionConfig> {
        self.subscriptions.iter().find(|s| s.name == name)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.shutdown_timeout_secs)
    }
}

fn collect_unknown_fields(
    raw: &serde_json::Value,
    known: &serde_json::Value,
    path: &str,
    out: &mut Vec<String>,
) {
    use serde_json::Value;

    match (raw, known) {
        (Value::Object(raw), Value::Object(known)) => {
            for (key, value) in raw {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                match known.get(key) {
                    Some(known_value) => collect_unknown_fields(value, known_value, &child, out),
                    None => out.push(child),
                }
            }
        }
        (Value::Array(raw), Value::Array(known)) => {
            for (index, (value, known_value)) in raw.iter().zip(known.iter()).enumerate() {
                collect_unknown_fields(value, known_value, &format!("{}[{}]", path, index), out);
            }
        }
        _ => {}
    }
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_control_addr() -> String {
    "127.0.0.1:7480".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_timeout_secs() -> f64 {
    1.0
}

fn default_latency_tolerance_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_capture_page_size() -> usize {
    500
}
