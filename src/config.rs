

//! Server configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};


/// The configuration of one server process. The core consumes the
/// folders and the chunk size; the listening and time-out values are
/// enforced by the transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {

    /// Listening address of the transport.
    pub address: String,

    /// Listening port of the transport.
    pub port: u16,

    /// Root directory of the image repository. A leading `/` on a
    /// requested target is stripped before concatenation.
    pub images_folder: PathBuf,

    /// Where to keep cache-model checkpoints and persisted image
    /// indexes. Nothing is persisted when unset.
    pub caching_folder: Option<PathBuf>,

    /// Upper bound on the size of one response chunk.
    pub max_chunk_size: usize,

    /// Maximum number of simultaneous connections.
    pub max_connections: usize,

    /// Connection receive/send time-out, in seconds. Zero disables it.
    pub com_time_out: u64,

    /// Whether to log every request line.
    pub log_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0".to_owned(),
            port: 8080,
            images_folder: PathBuf::from("."),
            caching_folder: None,
            max_chunk_size: 65_536,
            max_connections: 1000,
            com_time_out: 30,
            log_requests: false,
        }
    }
}

impl ServerConfig {

    /// Loads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        ServerConfig::parse(&text)
    }

    /// Parses a TOML configuration.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|error| Error::internal(format!("configuration: {}", error)))
    }
}
