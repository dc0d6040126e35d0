use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use armory_core::similarity::DEFAULT_EUCLIDEAN_SCALE;
use armory_core::{Metric, ReassignPolicy, SimilarityStrategy, Threshold};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/armory/armoryd.toml";

/// Daemon configuration: an optional TOML file, then `ARMORY_*`
/// environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub provider: ProviderConfig,
    pub similarity: SimilarityConfig,
    pub remote: RemoteConfig,
    /// Camera device for kiosk clients. The daemon never opens it.
    pub camera_device: String,
    /// Skip the remote template source entirely.
    pub offline: bool,
    /// How long a completed scan stays on screen before re-arming.
    pub reset_delay_ms: u64,
    /// Consecutive single-face frames required to trigger verification.
    pub debounce_frames: u32,
    /// Minimum face box side, in pixels.
    pub min_face_px: f32,
    pub reassign_policy: ReassignPolicy,
    /// Passphrase for at-rest template encryption.
    pub template_key: Option<String>,
    /// Recorded as the verifier on every transaction.
    pub verifier_identity: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Embedding space the provider's model produces.
    pub metric: Metric,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub strategy: Metric,
    pub euclidean_scale: f32,
    /// Per-strategy default when unset.
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the remote armory, e.g. `https://hq.example/api/face/`.
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8470)),
            db_path: default_data_dir().join("armory.db"),
            provider: ProviderConfig::default(),
            similarity: SimilarityConfig::default(),
            remote: RemoteConfig::default(),
            camera_device: "/dev/video0".to_string(),
            offline: false,
            reset_delay_ms: 3000,
            debounce_frames: 3,
            min_face_px: 100.0,
            reassign_policy: ReassignPolicy::default(),
            template_key: None,
            verifier_identity: "System".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000/api".to_string(),
            api_key: None,
            timeout_secs: 30,
            metric: Metric::Cosine,
        }
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            strategy: Metric::Cosine,
            euclidean_scale: DEFAULT_EUCLIDEAN_SCALE,
            threshold: None,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load `path` if it exists, then apply environment overrides.
    ///
    /// A missing file at the default path is not an error; a missing file
    /// the operator named explicitly is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `ARMORY_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Some(addr) = env_parse("ARMORY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("ARMORY_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("ARMORY_PROVIDER_URL") {
            self.provider.url = url;
        }
        if let Ok(key) = std::env::var("ARMORY_PROVIDER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        self.provider.timeout_secs = env_u64("ARMORY_PROVIDER_TIMEOUT_SECS", self.provider.timeout_secs);
        if let Some(metric) = env_metric("ARMORY_PROVIDER_METRIC") {
            self.provider.metric = metric;
        }
        if let Some(metric) = env_metric("ARMORY_SIMILARITY_STRATEGY") {
            self.similarity.strategy = metric;
        }
        self.similarity.euclidean_scale =
            env_f32("ARMORY_EUCLIDEAN_SCALE", self.similarity.euclidean_scale);
        if let Some(threshold) = env_parse("ARMORY_SIMILARITY_THRESHOLD") {
            self.similarity.threshold = Some(threshold);
        }
        if let Ok(url) = std::env::var("ARMORY_REMOTE_URL") {
            self.remote.url = Some(url);
        }
        if let Ok(token) = std::env::var("ARMORY_REMOTE_TOKEN") {
            self.remote.token = Some(token);
        }
        self.remote.timeout_secs = env_u64("ARMORY_REMOTE_TIMEOUT_SECS", self.remote.timeout_secs);
        if let Ok(device) = std::env::var("ARMORY_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Ok(v) = std::env::var("ARMORY_OFFLINE") {
            self.offline = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        self.reset_delay_ms = env_u64("ARMORY_RESET_DELAY_MS", self.reset_delay_ms);
        self.debounce_frames = env_u32("ARMORY_DEBOUNCE_FRAMES", self.debounce_frames);
        self.min_face_px = env_f32("ARMORY_MIN_FACE_PX", self.min_face_px);
        match std::env::var("ARMORY_REASSIGN_POLICY").as_deref() {
            Ok("auto_check_in") => self.reassign_policy = ReassignPolicy::AutoCheckIn,
            Ok("reject_fielded") => self.reassign_policy = ReassignPolicy::RejectFielded,
            Ok(other) => tracing::warn!(value = other, "ignoring unknown ARMORY_REASSIGN_POLICY"),
            Err(_) => {}
        }
        if let Ok(key) = std::env::var("ARMORY_TEMPLATE_KEY") {
            self.template_key = Some(key);
        }
        if let Ok(identity) = std::env::var("ARMORY_VERIFIER_IDENTITY") {
            self.verifier_identity = identity;
        }
    }

    /// Reject settings the engine would refuse at startup anyway, with
    /// messages that name the config keys.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.similarity.threshold {
            Threshold::new(t).context("similarity.threshold")?;
        }
        if self.similarity.strategy != self.provider.metric {
            anyhow::bail!(
                "similarity.strategy is {:?} but provider.metric is {:?}",
                self.similarity.strategy,
                self.provider.metric
            );
        }
        if self.similarity.euclidean_scale <= 0.0 {
            anyhow::bail!("similarity.euclidean_scale must be positive");
        }
        if self.debounce_frames == 0 {
            anyhow::bail!("debounce_frames must be at least 1");
        }
        Ok(())
    }

    pub fn strategy(&self) -> SimilarityStrategy {
        match self.similarity.strategy {
            Metric::Cosine => SimilarityStrategy::cosine(),
            Metric::Euclidean => SimilarityStrategy::euclidean(self.similarity.euclidean_scale),
        }
    }

    /// The remote template source, unless running offline or unconfigured.
    pub fn remote_url(&self) -> Option<&str> {
        if self.offline {
            return None;
        }
        self.remote.url.as_deref()
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("armory")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse(key).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parse(key).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_parse(key).unwrap_or(default)
}

fn env_metric(key: &str) -> Option<Metric> {
    match std::env::var(key).ok()?.to_ascii_lowercase().as_str() {
        "cosine" => Some(Metric::Cosine),
        "euclidean" => Some(Metric::Euclidean),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.reset_delay_ms, 3000);
        assert_eq!(config.debounce_frames, 3);
        assert_eq!(config.verifier_identity, "System");
        assert_eq!(config.reassign_policy, ReassignPolicy::AutoCheckIn);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
            db_path = "/var/lib/armory/armory.db"
            reassign_policy = "reject_fielded"

            [provider]
            url = "http://face.local:8000"
            api_key = "secret"
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/armory/armory.db"));
        assert_eq!(config.reassign_policy, ReassignPolicy::RejectFielded);
        assert_eq!(config.provider.url, "http://face.local:8000");
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
        assert_eq!(config.provider.timeout_secs, 30);
        assert_eq!(config.similarity.strategy, Metric::Cosine);
    }

    #[test]
    fn test_euclidean_file() {
        let file = write_config(
            r#"
            [provider]
            metric = "euclidean"

            [similarity]
            strategy = "euclidean"
            euclidean_scale = 0.8
            threshold = 0.3
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert!(matches!(config.strategy(), SimilarityStrategy::Euclidean(s) if s.scale == 0.8));
    }

    #[test]
    fn test_mixed_metrics_rejected() {
        let mut config = Config::default();
        config.similarity.strategy = Metric::Euclidean;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("provider.metric"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = Config::default();
        config.similarity.threshold = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offline_hides_remote() {
        let mut config = Config::default();
        config.remote.url = Some("https://hq.example/api/face/".into());
        assert_eq!(config.remote_url(), Some("https://hq.example/api/face/"));
        config.offline = true;
        assert_eq!(config.remote_url(), None);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }

    #[test]
    fn test_unknown_key_type_is_error() {
        let file = write_config("debounce_frames = \"three\"\n");
        assert!(Config::from_file(file.path()).is_err());
    }
}
