//! CLI configuration
//!
//! Stores the access token and tunnel defaults in ~/.iap-tunnel/config.json

use anyhow::{Context, Result};
use iap_auth::{async_trait, BearerToken, CredentialError, CredentialSource};
use iap_tunnel::SettingsProvider;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often re-authorization looks for a new token
const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Bearer token presented to the relay
    pub access_token: Option<String>,

    /// Relay endpoint, e.g. wss://tunnel.cloudproxy.app
    pub endpoint: Option<String>,

    /// Address local listeners bind to
    pub bind_address: Option<IpAddr>,

    pub max_local_connections: Option<usize>,

    /// Timeouts and intervals, in seconds
    pub connect_timeout: Option<f64>,
    pub reauth_timeout: Option<f64>,
    pub idle_grace_period: Option<f64>,
    pub drain_timeout: Option<f64>,
    pub keep_alive_interval: Option<f64>,
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

impl SettingsProvider for CliConfig {
    fn max_local_connections(&self) -> Option<usize> {
        self.max_local_connections
    }

    fn connect_timeout(&self) -> Option<Duration> {
        seconds(self.connect_timeout)
    }

    fn reauth_timeout(&self) -> Option<Duration> {
        seconds(self.reauth_timeout)
    }

    fn idle_grace_period(&self) -> Option<Duration> {
        seconds(self.idle_grace_period)
    }

    fn drain_timeout(&self) -> Option<Duration> {
        seconds(self.drain_timeout)
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        seconds(self.keep_alive_interval)
    }
}

/// Configuration manager
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for ~/.iap-tunnel/config.json
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::at(home.join(".iap-tunnel").join("config.json")))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, or the defaults when there is no file yet
    pub fn load(&self) -> Result<CliConfig> {
        if !self.path.exists() {
            return Ok(CliConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", self.path))
    }

    pub fn save(&self, config: &CliConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.path, json).context(format!("Failed to write config file: {:?}", self.path))
    }

    pub fn set_token(&self, token: String) -> Result<()> {
        let mut config = self.load()?;
        config.access_token = Some(token);
        self.save(&config)
    }

    pub fn clear_token(&self) -> Result<()> {
        let mut config = self.load()?;
        config.access_token = None;
        self.save(&config)
    }

    pub fn set_endpoint(&self, endpoint: String) -> Result<()> {
        let mut config = self.load()?;
        config.endpoint = Some(endpoint);
        self.save(&config)
    }

    pub fn get_token(&self) -> Result<Option<String>> {
        Ok(self.load()?.access_token)
    }
}

/// Token from the command line or the config file
///
/// Re-authorization asks the user to store a fresh token with
/// `iap-tunnel config set-token` and waits until one shows up.
#[derive(Debug)]
pub struct ConfigCredentialSource {
    manager: ConfigManager,
    current: Mutex<Option<String>>,
}

impl ConfigCredentialSource {
    pub fn new(manager: ConfigManager, token: Option<String>) -> Self {
        Self {
            manager,
            current: Mutex::new(token),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stored_token(&self) -> Option<String> {
        match self.manager.get_token() {
            Ok(token) => token.filter(|token| !token.is_empty()),
            Err(e) => {
                warn!("Cannot read token from {:?}: {:#}", self.manager.path(), e);
                None
            }
        }
    }
}

#[async_trait]
impl CredentialSource for ConfigCredentialSource {
    async fn access_token(&self) -> Result<BearerToken, CredentialError> {
        let current = self.current().clone();
        let token = match current {
            Some(token) => token,
            None => {
                let token = self.stored_token().ok_or_else(|| {
                    CredentialError::Unavailable(
                        "no access token; pass --token or run `iap-tunnel config set-token`"
                            .to_string(),
                    )
                })?;
                *self.current() = Some(token.clone());
                token
            }
        };
        Ok(BearerToken::new(token))
    }

    async fn reauthorize(&self) -> Result<bool, CredentialError> {
        let stale = self.current().clone();
        warn!(
            "Access token rejected as expired. Store a new one with `iap-tunnel config set-token <TOKEN>` (watching {:?})",
            self.manager.path()
        );

        loop {
            if let Some(token) = self.stored_token() {
                if Some(&token) != stale.as_ref() {
                    info!("Picked up new access token");
                    *self.current() = Some(token);
                    return Ok(true);
                }
            }
            debug!("Waiting for a new access token");
            tokio::time::sleep(TOKEN_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ConfigManager {
        ConfigManager::at(dir.path().join("nested").join("config.json"))
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(manager(&dir).load().unwrap(), CliConfig::default());
    }

    #[test]
    fn test_token_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.set_token("abc".to_string()).unwrap();
        manager.set_endpoint("wss://relay.test".to_string()).unwrap();
        assert_eq!(manager.get_token().unwrap().as_deref(), Some("abc"));
        assert_eq!(manager.load().unwrap().endpoint.as_deref(), Some("wss://relay.test"));

        manager.clear_token().unwrap();
        assert_eq!(manager.get_token().unwrap(), None);
    }

    #[test]
    fn test_settings_provider_reads_seconds() {
        let config: CliConfig = serde_json::from_str(
            r#"{ "max_local_connections": 3, "idle_grace_period": 1.5, "drain_timeout": -1 }"#,
        )
        .unwrap();

        assert_eq!(config.max_local_connections(), Some(3));
        assert_eq!(config.idle_grace_period(), Some(Duration::from_millis(1500)));
        assert_eq!(config.drain_timeout(), None);
        assert_eq!(config.connect_timeout(), None);
    }

    #[tokio::test]
    async fn test_flag_token_wins_over_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.set_token("from-file".to_string()).unwrap();

        let source = ConfigCredentialSource::new(manager, Some("from-flag".to_string()));
        assert_eq!(source.access_token().await.unwrap().secret(), "from-flag");
    }

    #[tokio::test]
    async fn test_no_token_anywhere_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let source = ConfigCredentialSource::new(manager(&dir), None);
        assert!(matches!(
            source.access_token().await,
            Err(CredentialError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reauthorize_picks_up_new_token() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.set_token("old".to_string()).unwrap();

        let source = ConfigCredentialSource::new(manager.clone(), None);
        assert_eq!(source.access_token().await.unwrap().secret(), "old");

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            manager.set_token("new".to_string()).unwrap();
        });

        assert!(source.reauthorize().await.unwrap());
        writer.await.unwrap();
        assert_eq!(source.access_token().await.unwrap().secret(), "new");
    }
}
