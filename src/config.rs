use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::managers::Account;

/// Provider type of the built-in local source; it never gets an online miner.
pub const LOCAL_PROVIDER: &str = "local";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Directory holding the `<tarname>-online-miner-<provider>` helpers.
    #[serde(default = "default_libexec_dir")]
    pub libexec_dir: PathBuf,
    #[serde(default = "default_package_tarname")]
    pub package_tarname: String,
    /// Registered item providers. One online miner is created per entry
    /// except `local`.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    /// Delay before a successfully refreshed provider is refreshed again.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Directory for the private bus socket. Defaults to the OS temp dir.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    #[serde(default = "default_offset_step")]
    pub offset_step: u32,
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Online accounts to seed the source manager with.
    #[serde(default)]
    pub accounts: Vec<Account>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrackerConfig {
    /// Bus name of the Tracker3 endpoint holding the photos.
    #[serde(default = "default_tracker_dbus_service")]
    pub dbus_service: String,
    /// Bus to find the endpoint on. The session bus when unset.
    #[serde(default)]
    pub bus_address: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let cfg: Config = serde_yaml::from_slice(&data)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.package_tarname.trim().is_empty(),
            "package-tarname must not be empty"
        );
        ensure!(self.offset_step > 0, "offset-step must be positive");
        ensure!(
            !self.tracker.dbus_service.trim().is_empty(),
            "tracker.dbus-service must not be empty"
        );
        ensure!(
            !self.refresh_interval.is_zero(),
            "refresh-interval must be greater than zero"
        );
        for provider in &self.providers {
            ensure!(
                !provider.is_empty()
                    && provider
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                "invalid provider name {provider:?}"
            );
        }
        Ok(())
    }

    /// Providers that get an online miner, in configuration order.
    pub fn online_providers(&self) -> impl Iterator<Item = &str> {
        self.providers
            .iter()
            .map(String::as_str)
            .filter(|p| *p != LOCAL_PROVIDER)
    }

    /// Listen address of the private bus server.
    pub fn bus_listen_address(&self) -> String {
        let tmp = self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
        format!("unix:tmpdir={}", tmp.display())
    }

    pub fn online_miner_path(&self, provider_type: &str) -> PathBuf {
        self.libexec_dir.join(format!(
            "{}-online-miner-{}",
            self.package_tarname, provider_type
        ))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libexec_dir: default_libexec_dir(),
            package_tarname: default_package_tarname(),
            providers: default_providers(),
            refresh_interval: default_refresh_interval(),
            tmp_dir: None,
            offset_step: default_offset_step(),
            tracker: TrackerConfig::default(),
            accounts: Vec::new(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            dbus_service: default_tracker_dbus_service(),
            bus_address: None,
        }
    }
}

fn default_libexec_dir() -> PathBuf {
    PathBuf::from("/usr/libexec")
}

fn default_package_tarname() -> String {
    "gnome-photos".to_string()
}

fn default_providers() -> Vec<String> {
    ["facebook", "flickr", "google", LOCAL_PROVIDER]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_offset_step() -> u32 {
    50
}

fn default_tracker_dbus_service() -> String {
    "org.freedesktop.Tracker3.Miner.Files".to_string()
}
