//! Settings types. Every field has a default so a partial settings file
//! deserializes cleanly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoomSettings {
    pub server: ServerSettings,
    pub sync: SyncSettings,
    pub queue: QueueSettings,
    pub agent: AgentSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Directory holding `loom.db`. A leading `~` expands to `$HOME`.
    pub data_dir: String,
    /// Outbound frames buffered per connection before it is marked lagged.
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7411,
            data_dir: "~/.loom".to_string(),
            max_send_queue: 256,
            request_timeout_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("loom.db")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Catch-up, liveness and history paging.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// A reconnecting client idle for longer than this gets a full resync.
    pub staleness_secs: u64,
    pub ping_interval_secs: u64,
    pub max_missed_pings: u32,
    pub catch_up_page_size: u32,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            staleness_secs: 3600,
            ping_interval_secs: 30,
            max_missed_pings: 3,
            catch_up_page_size: 500,
            history_default_limit: 50,
            history_max_limit: 500,
        }
    }
}

impl SyncSettings {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// 0 disables the limit.
    pub max_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { max_size: 10 }
    }
}

/// External agent program. `None` selects the built-in echo backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ratio: f64,
    /// How long a sent prompt may stay unconfirmed before it is failed and
    /// its text restored.
    pub pending_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub max_missed_keepalives: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.2,
            pending_timeout_secs: 60,
            keepalive_interval_secs: 20,
            max_missed_keepalives: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. `info` or `loom_server=debug`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) => home_dir().join(rest.trim_start_matches('/')),
        None => PathBuf::from(path),
    }
}
