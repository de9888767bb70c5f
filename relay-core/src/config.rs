use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read relay config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse relay config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

impl ConfigError {
    /// The config file the error refers to.
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub ingest: IngestSection,
    pub encoder: EncoderSection,
    pub scheduler: SchedulerSection,
    pub provider: ProviderSection,
}

impl RelayConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.registry_file)
    }

    pub fn media_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_dir)
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.tokens_dir)
    }

    /// The single fixed timezone every schedule decision runs in.
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.system.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    pub fn local_now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.timezone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
    pub timezone_label: String,
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub media_dir: String,
    pub registry_file: String,
    pub tokens_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    pub rtmp_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub binary: String,
    pub log_level: String,
    pub preset: String,
    pub tune: String,
    pub warmup_delay_seconds: u64,
    pub stop_grace_seconds: u64,
}

impl EncoderSection {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_secs(self.warmup_delay_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    pub tick_interval_seconds: u64,
}

impl SchedulerSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub enabled: bool,
    pub api_base: String,
    pub request_timeout_seconds: u64,
    pub default_privacy: String,
}

impl ProviderSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

pub fn load_relay_config<P: AsRef<Path>>(path: P) -> ConfigResult<RelayConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml");
        let config = load_relay_config(path).expect("config should parse");
        assert_eq!(config.system.node_name, "relay-primary");
        assert_eq!(config.system.timezone_label, "WIB");
        assert_eq!(config.system.utc_offset_minutes, 420);
        assert_eq!(config.encoder.preset, "veryfast");
        assert_eq!(config.encoder.stop_grace(), Duration::from_secs(2));
        assert!(config.ingest.rtmp_base.starts_with("rtmp://"));
    }

    #[test]
    fn paths_resolve_against_base_dir() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml");
        let config = load_relay_config(path).expect("config should parse");
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/opt/relay/streams.json")
        );
        assert_eq!(config.resolve_path("/abs/file"), PathBuf::from("/abs/file"));
    }

    #[test]
    fn load_errors_carry_the_offending_path() {
        let missing = Path::new("/nonexistent/relay.toml");
        match load_relay_config(missing) {
            Err(ConfigError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected Io error, got {other:?}"),
        }

        let dir = tempfile::TempDir::new().unwrap();
        let broken = dir.path().join("relay.toml");
        std::fs::write(&broken, "[system\n").unwrap();
        match load_relay_config(&broken) {
            Err(error @ ConfigError::Parse { .. }) => assert_eq!(error.path(), broken),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn timezone_is_fixed_offset() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml");
        let config = load_relay_config(path).expect("config should parse");
        assert_eq!(config.timezone().local_minus_utc(), 7 * 3600);
    }
}
