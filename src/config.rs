// src/config.rs
//
// =============================================================================
// BBSYNCER: CONFIGURATION
// =============================================================================
//
// TOML config with per-key defaults; every key is optional. Search order:
//   1. explicit --config path
//   2. /etc/bbsyncer/bbsyncer.toml
//   3. ./config/bbsyncer.toml (repo-local fallback for development)
//   4. built-in defaults

use std::path::{Path, PathBuf};

use serde::Deserialize;

const SYSTEM_CONFIG_PATH: &str = "/etc/bbsyncer/bbsyncer.toml";
const LOCAL_CONFIG_PATH: &str = "config/bbsyncer.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Serial
    pub serial_baud: u32,
    /// Empty = auto-detect /dev/ttyACM*.
    pub serial_port: String,
    pub serial_timeout: f64,

    // Storage
    pub storage_path: PathBuf,
    pub min_free_space_mb: u64,

    // Sync behaviour
    pub erase_after_sync: bool,
    pub flash_chunk_size: u32,
    pub erase_timeout_sec: u64,
    pub flash_read_compression: bool,

    // LED
    pub led_backend: String,
    pub led_gpio_pin: u32,

    // Web server / hotspot
    pub web_port: u16,
    pub hotspot_ssid: String,
    pub hotspot_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial_baud: 115_200,
            serial_port: String::new(),
            serial_timeout: 5.0,
            storage_path: PathBuf::from("/mnt/bbsyncer-logs"),
            min_free_space_mb: 200,
            erase_after_sync: true,
            flash_chunk_size: 16_384,
            erase_timeout_sec: 120,
            // Compression off by default: reliability beats throughput on
            // the slow link, and some FCs mis-size compressed chunks.
            flash_read_compression: false,
            led_backend: "sysfs".to_string(),
            led_gpio_pin: 17,
            web_port: 80,
            hotspot_ssid: "BF-Blackbox".to_string(),
            hotspot_password: "fpvpilot".to_string(),
        }
    }
}

impl Config {
    /// Load config, falling back through the search order to defaults.
    /// A present-but-broken file is logged and skipped.
    pub fn load(explicit_path: Option<&Path>) -> Config {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = explicit_path {
            candidates.push(path.to_path_buf());
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));
        candidates.push(PathBuf::from(LOCAL_CONFIG_PATH));

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            log::debug!("Loading config from {}", candidate.display());
            match Self::load_file(&candidate) {
                Ok(cfg) => return cfg,
                Err(e) => log::warn!("Failed to load config {}: {}", candidate.display(), e),
            }
        }

        log::debug!("Using default config (no config file found)");
        Config::default()
    }

    pub fn load_file(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
