/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8787";
const DEFAULT_PORT: u16 = 8787;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the chat server (`/chats` and `/messages` live under it)
    pub server_url: String,

    /// Directory holding the persisted identity file
    pub data_dir: PathBuf,

    /// Chat-list polling interval
    pub chat_poll_interval: Duration,

    /// Message polling interval for the selected chat
    pub message_poll_interval: Duration,

    /// Consecutive failed ticks before a loop is reported as degraded
    pub failure_escalation_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            data_dir: PathBuf::from(".hushline"),
            chat_poll_interval: Duration::from_secs(5),
            message_poll_interval: Duration::from_secs(3),
            failure_escalation_threshold: 3,
        }
    }
}

impl Config {
    /// Pull `--server <url>` and `--data-dir <path>` out of `args`, returning the
    /// remaining positional arguments untouched.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut rest = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--server" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--server requires a URL argument".to_string())
                    })?;
                    config.server_url = url.clone();
                    i += 2;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = PathBuf::from(path);
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("HUSHLINE_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(dir) = std::env::var("HUSHLINE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if !config.server_url.starts_with("http://") && !config.server_url.starts_with("https://")
        {
            return Err(ChatError::Config(format!(
                "Server URL must start with http:// or https://, got {}",
                config.server_url
            )));
        }
        config.server_url = config.server_url.trim_end_matches('/').to_string();

        Ok((config, rest))
    }
}

/// Chat server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listening address
    pub listen_addr: SocketAddr,

    /// Directory for the sled database
    pub data_dir: PathBuf,

    /// A participant seen within this window counts as online
    pub online_window: Duration,

    /// Length of generated chat codes
    pub chat_code_len: usize,

    /// Re-rolls allowed when a generated chat code collides
    pub max_code_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_dir: PathBuf::from(".hushline/server"),
            online_window: Duration::from_secs(300),
            chat_code_len: 8,
            max_code_attempts: 16,
        }
    }
}

impl ServerConfig {
    /// Create config from command line arguments: `[port] [--data-dir <path>]`
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut port: Option<u16> = None;
        let mut data_dir: Option<PathBuf> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                other => {
                    port = Some(other.parse::<u16>().map_err(|_| {
                        ChatError::Config("Port must be a valid number (0-65535)".to_string())
                    })?);
                    i += 1;
                }
            }
        }

        if let Some(p) = std::env::var("HUSHLINE_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            port = Some(p);
        }

        let defaults = Self::default();
        Ok(Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(DEFAULT_PORT))),
            data_dir: data_dir.unwrap_or(defaults.data_dir.clone()),
            ..defaults
        })
    }
}
