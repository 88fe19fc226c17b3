//! Daemon configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/sluice/sluice.toml`
//! - Windows: `%APPDATA%/sluice/sluice.toml`

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_protocol::constants::DEFAULT_CHUNK_SIZE;
use sluice_transfer::{DEFAULT_HIGH_WATER_MARK, Destinations, RenamePolicy, UploadOptions};

/// Either one upload directory or a map of destination key to directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadDir {
    Single(PathBuf),
    Keyed(BTreeMap<String, PathBuf>),
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-upload byte limit; unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,

    /// Accepted MIME types; empty accepts everything.
    #[serde(default)]
    pub accepts: Vec<String>,

    /// Chunk size announced to peers.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Pause before each chunk request, in milliseconds.
    #[serde(default)]
    pub transmission_delay_ms: u64,

    /// Replace existing files instead of skipping the transfer.
    #[serde(default)]
    pub overwrite: bool,

    /// Stored-name rule. `{name}` is replaced by the generated name; a
    /// value without it is used verbatim for every upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,

    /// Buffered bytes at which a sink asks the peer to wait.
    #[serde(default = "default_high_water_mark")]
    pub sink_high_water_mark: usize,

    /// Kept last: a keyed map is written as a TOML table.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: UploadDir,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8765
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_upload_dir() -> UploadDir {
    UploadDir::Single(data_dir().join("uploads"))
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_file_size: None,
            accepts: Vec::new(),
            chunk_size: default_chunk_size(),
            transmission_delay_ms: 0,
            overwrite: false,
            rename: None,
            sink_high_water_mark: default_high_water_mark(),
            upload_dir: default_upload_dir(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform default), creating
    /// a default file if none exists.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(config_path);
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration read");
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Upload options for the transfer layer.
    pub fn upload_options(&self) -> UploadOptions {
        let destinations = match &self.upload_dir {
            UploadDir::Single(dir) => Destinations::Single(dir.clone()),
            UploadDir::Keyed(map) => Destinations::Keyed(map.clone()),
        };
        let rename = match &self.rename {
            None => RenamePolicy::Identity,
            Some(rule) if rule.contains("{name}") => RenamePolicy::Template(rule.clone()),
            Some(rule) => RenamePolicy::Static(rule.clone()),
        };

        UploadOptions {
            max_file_size: self.max_file_size,
            accepts: self.accepts.clone(),
            chunk_size: self.chunk_size,
            transmission_delay: Duration::from_millis(self.transmission_delay_ms),
            overwrite: self.overwrite,
            rename,
            destinations,
            sink_high_water_mark: self.sink_high_water_mark,
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    config_dir().join("sluice.toml")
}

fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("sluice")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("sluice")
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        config_dir()
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".local").join("share").join("sluice")
    }
}
