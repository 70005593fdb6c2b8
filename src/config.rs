// Runtime configuration, read from a TOML file at startup. A missing or
// unparseable file is never fatal; the server logs a warning and runs with
// defaults, which clients can adjust over the wire.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
pub const DEFAULT_RECORDING_LENGTH: u32 = 1000;
pub const DEFAULT_READ_INTERVAL: u32 = 10;
/// Largest chunk of data, in seconds, a client may request at once.
pub const DEFAULT_MAX_CHUNK_SIZE: f64 = 10.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Port on which remote clients connect.
    pub port: u16,

    /// Port of the HTTP status server.
    pub http_port: u16,

    /// Maximum number of simultaneously connected clients.
    pub max_connections: usize,

    /// Default recording length, seconds.
    pub recording_length: u32,

    /// Default interval between reads from the data source, milliseconds.
    pub read_interval: u32,

    /// Maximum data-request chunk size, seconds.
    pub max_chunk_size: f64,

    /// Directory for new recordings; defaults to the user's Desktop.
    pub save_directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            http_port: DEFAULT_HTTP_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            recording_length: DEFAULT_RECORDING_LENGTH,
            read_interval: DEFAULT_READ_INTERVAL,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            save_directory: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults if the file
    /// is missing or invalid.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    "No configuration file found at {:?}! Using defaults for all values.",
                    path
                );
                return Self::default();
            }
        };
        match toml::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid configuration file {:?} ({}), using defaults.", path, e);
                Self::default()
            }
        }
    }

    /// The directory new recordings are saved into.
    pub fn save_directory(&self) -> PathBuf {
        if let Some(dir) = &self.save_directory {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join("Desktop"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
