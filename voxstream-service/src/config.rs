//! Service configuration — a JSON file plus environment variable overrides.
//!
//! Follows `dictum-app`'s settings pattern (`AppSettings`/`normalize`/
//! `load_settings`/`save_settings`): a `#[serde(default)]` struct read from
//! disk, normalized in place, then selectively overridden by `VOXSTREAM_*`
//! environment variables, rather than introducing a new config format (no
//! example in the retrieval pack reaches for `toml`).
//!
//! Validation failures are reported to the caller rather than panicking —
//! the Supervisor refuses to start on an invalid config (spec "Configuration
//! errors": refuse to start, report to standard error).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use voxstream_core::{PoolConfig, SegmenterConfig, TranslatorConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CaptureConfig {
    pub preferred_input_device: Option<String>,
    pub sample_rate: u32,
    pub frame_size_ms: u64,
    pub ring_capacity_sec: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            sample_rate: 16_000,
            frame_size_ms: 20,
            ring_capacity_sec: 10.0,
        }
    }
}

impl CaptureConfig {
    /// Frames per capture chunk, derived rather than stored twice.
    pub fn chunk_frames(&self) -> usize {
        (self.sample_rate as u64 * self.frame_size_ms / 1000) as usize
    }

    pub fn ring_capacity_samples(&self) -> usize {
        (self.sample_rate as f64 * self.ring_capacity_sec) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VadConfig {
    pub threshold: f32,
    pub hangover_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            hangover_frames: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct TranslationBackendConfig {
    pub name: String,
    pub endpoint: String,
    pub requests_per_sec: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub backends: Vec<TranslationBackendConfig>,
    pub translator: TranslatorConfig,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backends: Vec::new(),
            translator: TranslatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HubConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_subscribers: usize,
    pub history_cap: usize,
    pub subscriber_queue: usize,
    pub slow_client_grace_sec: u64,
    pub shutdown_drain_sec: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8765,
            max_subscribers: 32,
            history_cap: 100,
            subscriber_queue: 256,
            slow_client_grace_sec: 30,
            shutdown_drain_sec: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub keep_segments: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keep_segments: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
    pub pool: PoolConfig,
    pub translation: TranslationConfig,
    pub hub: HubConfig,
    pub persistence: PersistenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            vad: VadConfig::default(),
            segmenter: SegmenterConfig::default(),
            pool: PoolConfig::default(),
            translation: TranslationConfig::default(),
            hub: HubConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Config {
    /// Clamp/normalize fields that accept a range, mirroring
    /// `AppSettings::normalize`. Does not reject anything — `validate`
    /// handles hard failures.
    pub fn normalize(&mut self) {
        self.capture.sample_rate = self.capture.sample_rate.clamp(8_000, 48_000);
        self.capture.preferred_input_device = self
            .capture
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.vad.threshold = self.vad.threshold.clamp(0.0, 1.0);
        self.segmenter.sample_rate = self.capture.sample_rate;
        self.hub.max_subscribers = self.hub.max_subscribers.max(1);
        self.hub.history_cap = self.hub.history_cap.max(1);
        self.hub.subscriber_queue = self.hub.subscriber_queue.max(1);
        self.pool.workers = self.pool.workers.max(1);
    }

    /// Hard validation. A `Config` that fails here must not be started —
    /// the caller prints the error and exits rather than limping along with
    /// a contradictory setup (spec "Configuration errors").
    pub fn validate(&self) -> Result<(), String> {
        if self.capture.chunk_frames() == 0 {
            return Err("capture.frameSizeMs too small for capture.sampleRate".to_string());
        }
        if self.segmenter.silence_threshold_ms == 0 {
            return Err("segmenter.silenceThresholdMs must be nonzero".to_string());
        }
        if self.translation.enabled && self.translation.backends.is_empty() {
            return Err("translation.enabled is true but translation.backends is empty".to_string());
        }
        for backend in &self.translation.backends {
            if backend.endpoint.is_empty() {
                return Err(format!("translation backend '{}' has an empty endpoint", backend.name));
            }
        }
        if self.hub.port == 0 {
            return Err("hub.port must be nonzero".to_string());
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("voxstream")
            .join("sessions")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxstream")
            .join("sessions")
    }
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("voxstream")
            .join("config.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("voxstream")
            .join("config.json")
    }
}

/// Load `Config` from `path`, falling back to defaults if the file is
/// absent or unparsable, then apply environment overrides and normalize.
/// Missing-file is not an error (first run); a present-but-invalid file is
/// silently treated as absent, same as `dictum-app`'s `load_settings` — the
/// validation step downstream is what actually gates startup.
pub fn load_config(path: &Path) -> Config {
    let mut config = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Config>(&raw).ok())
        .unwrap_or_default();
    apply_env_overrides(&mut config);
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &Config) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

/// Environment overrides for the handful of settings worth tweaking without
/// editing the config file (container deployments, quick experiments).
fn apply_env_overrides(config: &mut Config) {
    if let Ok(addr) = std::env::var("VOXSTREAM_HUB_BIND") {
        config.hub.bind_address = addr;
    }
    if let Ok(port) = std::env::var("VOXSTREAM_HUB_PORT") {
        if let Ok(port) = port.parse() {
            config.hub.port = port;
        }
    }
    if let Ok(dir) = std::env::var("VOXSTREAM_DATA_DIR") {
        config.persistence.data_dir = PathBuf::from(dir);
    }
    if let Ok(device) = std::env::var("VOXSTREAM_INPUT_DEVICE") {
        config.capture.preferred_input_device = Some(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_translation_without_backends_fails_validation() {
        let mut config = Config::default();
        config.translation.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalize_syncs_segmenter_rate_to_capture_rate() {
        let mut config = Config::default();
        config.capture.sample_rate = 44_100;
        config.normalize();
        assert_eq!(config.segmenter.sample_rate, 44_100);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = load_config(Path::new("/nonexistent/voxstream-config-test.json"));
        assert_eq!(config.hub.port, 8765);
    }
}
