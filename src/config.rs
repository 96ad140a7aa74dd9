use crate::compensation::CompensationParameters;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SERVER_QUEUE: &str = "mocomp_driver.server_queue";
pub const DEFAULT_CLIENT_QUEUE: &str = "mocomp_driver.client_queue";
pub const DEFAULT_MAX_MESSAGES: usize = 100;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 50;

fn default_queue_dir() -> PathBuf {
    std::env::temp_dir().join("mocomp")
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("opening config {}", path.display()))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).with_context(|| format!("parsing config {}", path.display()))
}

/// Driver-side settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub queue_name: String,
    pub max_messages: usize,
    pub receive_timeout_ms: u64,
    /// Directory holding the datagram queue sockets
    pub queue_dir: PathBuf,
    pub status_path: Option<PathBuf>,
    pub status_interval_ms: u64,
    pub parameters: CompensationParameters,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_SERVER_QUEUE.to_string(),
            max_messages: DEFAULT_MAX_MESSAGES,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            queue_dir: default_queue_dir(),
            status_path: None,
            status_interval_ms: 1000,
            parameters: CompensationParameters::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        load_json(path)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Control-client settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_queue: String,
    /// Reply queue name prefix; pid and a timestamp are appended
    pub client_queue_prefix: String,
    pub max_messages: usize,
    pub receive_timeout_ms: u64,
    /// None waits for a reply until disconnect
    pub reply_timeout_ms: Option<u64>,
    pub queue_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_queue: DEFAULT_SERVER_QUEUE.to_string(),
            client_queue_prefix: DEFAULT_CLIENT_QUEUE.to_string(),
            max_messages: DEFAULT_MAX_MESSAGES,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            reply_timeout_ms: None,
            queue_dir: default_queue_dir(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        load_json(path)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }
}
