use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::replay::ReplayParams;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub replay: ReplayConfig,
    pub decode: DecodeConfig,
    pub cache: CacheConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

/// Defaults for new replay jobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub host: String,
    pub port: u16,
    pub delay_ms: u64,
    pub override_rxpk: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// JSON map of DevAddr to session keys
    pub credentials: PathBuf,
    pub builtin_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub uploads_enabled: bool,
    pub node_binary: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl ReplayConfig {
    pub fn params(&self) -> ReplayParams {
        ReplayParams {
            host: self.host.clone(),
            port: self.port,
            delay_ms: self.delay_ms,
            override_rxpk: self.override_rxpk,
        }
    }
}

impl DecodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `None` when uploaded decoders are switched off
    pub fn upload_dir(&self) -> Option<PathBuf> {
        self.uploads_enabled.then(|| self.upload_dir.clone())
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        let params = ReplayParams::default();
        Self {
            host: params.host,
            port: params.port,
            delay_ms: params.delay_ms,
            override_rxpk: params.override_rxpk,
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            credentials: PathBuf::from("data/credentials.json"),
            builtin_dir: PathBuf::from("decoders"),
            upload_dir: PathBuf::from("data/decoders"),
            uploads_enabled: true,
            node_binary: "node".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 * 60 }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1700".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[replay]
host = "10.0.0.5"
delay_ms = 50

[decode]
uploads_enabled = false
timeout_ms = 250
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.replay.host, "10.0.0.5");
        assert_eq!(config.replay.port, 1700);
        assert_eq!(config.replay.params().delay_ms, 50);
        assert_eq!(config.decode.upload_dir(), None);
        assert_eq!(config.decode.timeout(), Duration::from_millis(250));
        assert_eq!(config.decode.node_binary, "node");
        assert_eq!(config.cache.ttl(), Duration::from_secs(1800));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[replay]\nport = \"not a number\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
