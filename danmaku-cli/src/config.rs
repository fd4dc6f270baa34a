use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use danmaku::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

const APP_DIR: &str = "danmaku";

/// Settings loaded from `config.toml`.
///
/// ```toml
/// credentials = "/home/me/.config/danmaku/credentials.json"
///
/// [client]
/// heartbeat_interval_secs = 30
///
/// [client.reconnect]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Credential file; defaults to the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<PathBuf>,

    #[serde(default)]
    pub client: ClientConfig,
}

impl AppConfig {
    /// Load from `path`, or from the default location when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let config = toml::from_str::<Self>(&text)
            .with_context(|| format!("invalid TOML in {}", path.display()))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Credential file to use: CLI flag, then config file, then default.
    pub fn credentials_path(&self, cli: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = &self.credentials {
            return Ok(path.clone());
        }
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join("credentials.json"))
            .context("unable to locate OS config directory, pass --credentials")
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "credentials = \"/tmp/creds.json\"\n\n[client]\nheartbeat_interval_secs = 15\n\n[client.reconnect]\nmax_attempts = 2"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.credentials, Some(PathBuf::from("/tmp/creds.json")));
        assert_eq!(config.client.heartbeat_interval_secs, 15);
        assert_eq!(config.client.reconnect.max_attempts, 2);
        assert_eq!(config.client.drain_timeout_ms, ClientConfig::default().drain_timeout_ms);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_credentials_path_precedence() {
        let config = AppConfig {
            credentials: Some(PathBuf::from("/from/config.json")),
            ..Default::default()
        };
        assert_eq!(
            config.credentials_path(Some(Path::new("/from/cli.json"))).unwrap(),
            PathBuf::from("/from/cli.json")
        );
        assert_eq!(
            config.credentials_path(None).unwrap(),
            PathBuf::from("/from/config.json")
        );
    }
}
