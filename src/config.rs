//! Server configuration.
//!
//! The binary front end loads a JSON file and hands the parsed
//! `ServerConfig` to the core; every knob has a default so partial files
//! work.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::TileResult;

fn default_max_queue_size() -> usize {
    64
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_keep_tile() -> u8 {
    12
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("cache")
}

fn default_prerender_level() -> u8 {
    12
}

fn default_parse_timeout() -> u64 {
    750
}

fn default_style_source() -> PathBuf {
    PathBuf::from("styles")
}

fn default_style() -> String {
    "default".into()
}

/// Configuration consumed by the core.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Worker pool size. `0` selects the hardware parallelism.
    #[serde(default)]
    pub num_threads: usize,

    /// Capacity of the user-request FIFO; overflow answers 503.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of tiles retained in memory.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Zoom ceiling for disk spillover of evicted tiles.
    #[serde(default = "default_cache_keep_tile")]
    pub cache_keep_tile: u8,

    /// Root directory of the disk spillover.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Zoom ceiling for recursive prerendering.
    #[serde(default = "default_prerender_level")]
    pub prerender_level: u8,

    /// Wall-clock budget per stylesheet parse, in milliseconds.
    #[serde(default = "default_parse_timeout", rename = "parse_timeout")]
    pub parse_timeout_ms: u64,

    /// Directory watched for `*.mapcss` stylesheets.
    #[serde(default = "default_style_source")]
    pub style_source: PathBuf,

    /// Stylesheet substituted for requests without a known style.
    #[serde(default = "default_style", rename = "path_to_default_style")]
    pub default_style: String,

    /// Image served whenever a request cannot be answered properly.
    #[serde(default, rename = "path_to_default_tile")]
    pub default_tile_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            max_queue_size: default_max_queue_size(),
            cache_size: default_cache_size(),
            cache_keep_tile: default_cache_keep_tile(),
            cache_path: default_cache_path(),
            prerender_level: default_prerender_level(),
            parse_timeout_ms: default_parse_timeout(),
            style_source: default_style_source(),
            default_style: default_style(),
            default_tile_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> TileResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Worker pool size with the `0 = auto` rule resolved, minimum 1.
    pub fn worker_threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_queue_size, 64);
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.parse_timeout_ms, 750);
        assert_eq!(config.default_style, "default");
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server.json");
        fs::write(
            &path,
            r#"{"num_threads": 2, "max_queue_size": 8, "path_to_default_style": "osm"}"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.num_threads, 2);
        assert_eq!(config.worker_threads(), 2);
        assert_eq!(config.max_queue_size, 8);
        assert_eq!(config.default_style, "osm");
        // untouched keys keep defaults
        assert_eq!(config.cache_keep_tile, 12);
    }

    #[test]
    fn test_load_rejects_malformed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }
}
