use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub ambient: AmbientConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
    /// Ambient mode name → playlist URL.
    #[serde(default = "default_modes")]
    pub modes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Call polling and scanner audio settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Prefix for calls that only carry a bare `filename`.
    #[serde(default = "default_audio_base_url")]
    pub audio_base_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How far back the first poll of a session reaches.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Calls this short or shorter are dropped.
    #[serde(default = "default_min_call_secs")]
    pub min_call_secs: f64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_scanner_volume")]
    pub default_volume: u8,
}

/// Ambient widget timing.  The play-attempt delays exist only because some
/// platforms silently drop the first autoplay request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientConfig {
    #[serde(default = "default_mode")]
    pub default_mode: String,
    #[serde(default = "default_play_attempt_delays_ms")]
    pub play_attempt_delays_ms: Vec<u64>,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_skip_delay_ms")]
    pub skip_delay_ms: u64,
    #[serde(default = "default_bind_initial_backoff_ms")]
    pub bind_initial_backoff_ms: u64,
    #[serde(default = "default_bind_max_backoff_ms")]
    pub bind_max_backoff_ms: u64,
    #[serde(default = "default_bind_max_attempts")]
    pub bind_max_attempts: u32,
    #[serde(default = "default_ambient_volume")]
    pub default_volume: u8,
}

/// Feed list source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsConfig {
    /// Local TOML file with `[[feed]]` tables.
    /// Defaults to `$XDG_CONFIG_HOME/scanner/feeds.toml`; the built-in list is
    /// used when it does not exist.
    #[serde(default = "default_feeds_toml")]
    pub feeds_toml: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            audio_base_url: default_audio_base_url(),
            poll_interval_secs: default_poll_interval_secs(),
            lookback_secs: default_lookback_secs(),
            min_call_secs: default_min_call_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            default_volume: default_scanner_volume(),
        }
    }
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            play_attempt_delays_ms: default_play_attempt_delays_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            skip_delay_ms: default_skip_delay_ms(),
            bind_initial_backoff_ms: default_bind_initial_backoff_ms(),
            bind_max_backoff_ms: default_bind_max_backoff_ms(),
            bind_max_attempts: default_bind_max_attempts(),
            default_volume: default_ambient_volume(),
        }
    }
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            feeds_toml: default_feeds_toml(),
        }
    }
}

fn default_log_file() -> PathBuf {
    platform::data_dir().join("scannerd.log")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_api_base_url() -> String {
    "https://api.openmhz.com".to_string()
}

fn default_audio_base_url() -> String {
    "https://s3.amazonaws.com/openmhz".to_string()
}

fn default_poll_interval_secs() -> u64 {
    8
}

/// Longest useful look-back window for a freshly selected feed.
pub const MAX_LOOKBACK_SECS: u64 = 24 * 60 * 60;

fn default_lookback_secs() -> u64 {
    120
}

fn default_min_call_secs() -> f64 {
    1.0
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_scanner_volume() -> u8 {
    80
}

fn default_mode() -> String {
    "ambient".to_string()
}

fn default_play_attempt_delays_ms() -> Vec<u64> {
    vec![100, 600, 1500]
}

fn default_settle_delay_ms() -> u64 {
    800
}

fn default_skip_delay_ms() -> u64 {
    1500
}

fn default_bind_initial_backoff_ms() -> u64 {
    200
}

fn default_bind_max_backoff_ms() -> u64 {
    5000
}

fn default_bind_max_attempts() -> u32 {
    30
}

fn default_ambient_volume() -> u8 {
    50
}

fn default_feeds_toml() -> PathBuf {
    platform::config_dir().join("feeds.toml")
}

fn default_modes() -> BTreeMap<String, String> {
    [
        ("ambient", "https://soundcloud.com/scanner-radio/sets/ambient"),
        ("synthwave", "https://soundcloud.com/scanner-radio/sets/synthwave"),
        ("zen", "https://soundcloud.com/scanner-radio/sets/zen"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Read `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.modes.contains_key(&self.ambient.default_mode) {
            anyhow::bail!(
                "ambient.default_mode '{}' has no entry in [modes]",
                self.ambient.default_mode
            );
        }
        if self.scanner.poll_interval_secs == 0 {
            anyhow::bail!("scanner.poll_interval_secs must be at least 1");
        }
        if self.scanner.lookback_secs > MAX_LOOKBACK_SECS {
            anyhow::bail!(
                "scanner.lookback_secs must be at most {} (got {})",
                MAX_LOOKBACK_SECS,
                self.scanner.lookback_secs
            );
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            scanner: ScannerConfig::default(),
            ambient: AmbientConfig::default(),
            feeds: FeedsConfig::default(),
            modes: default_modes(),
        }
    }
}
