use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Settings shared by the check loops, adjustable at runtime.
///
/// Supervisors and workers re-read these on every pass, so a changed value
/// takes effect within one reconciliation interval without a restart. The
/// exceptions are `ssh_client`, `web_port` and `web_workers_count`, which are
/// only read at startup.
pub type SharedSettings = Arc<RwLock<Settings>>;

/// All tunable knobs of the engine, persisted as one JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Max concurrent SSH liveness checks
    pub ssh_tasks_count: usize,
    /// Hard timeout for one SSH liveness check (seconds)
    pub ssh_test_timeout: u64,
    /// Sleep between two liveness checks of the same SSH (seconds)
    pub ssh_recheck_interval: u64,
    /// Delete an SSH as soon as it is observed dead
    pub ssh_auto_delete_died: bool,
    /// SSH client binary driven for tunnels (plink-compatible flags)
    pub ssh_client: String,
    /// Max concurrent port health/probe/connect operations
    pub port_tasks_count: usize,
    /// Never re-assign an SSH a port has already used
    pub use_unique_ssh: bool,
    /// Periodically tear down tunnels so each port changes its exit IP
    pub auto_reset_ports: bool,
    /// Tunnel age at which rotation kicks in (seconds)
    pub port_reset_interval: u64,
    /// Delete the SSH (instead of just detaching it) when a port rotates
    pub port_reset_delete_ssh: bool,
    /// Flag the SSH dead when a port's egress probe dies, so the
    /// replacement assignment picks a different one
    pub port_auto_replace_died_ssh: bool,
    /// Pull new SSH records from the external store feed
    pub sshstore_enabled: bool,
    /// API key for the store feed
    pub sshstore_api_key: String,
    /// Country filter for the store feed
    pub sshstore_country: String,
    /// Max records inserted per feed fetch
    pub sshstore_limit: usize,
    /// Sleep between two feed fetches (seconds)
    pub sshstore_interval: u64,
    /// Port the API surface listens on
    pub web_port: u16,
    /// Worker count for the API surface
    pub web_workers_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_tasks_count: 20,
            ssh_test_timeout: 30,
            ssh_recheck_interval: 60,
            ssh_auto_delete_died: false,
            ssh_client: "plink".to_string(),
            port_tasks_count: 20,
            use_unique_ssh: false,
            auto_reset_ports: false,
            port_reset_interval: 60,
            port_reset_delete_ssh: false,
            port_auto_replace_died_ssh: true,
            sshstore_enabled: false,
            sshstore_api_key: String::new(),
            sshstore_country: "US".to_string(),
            sshstore_limit: 100,
            sshstore_interval: 60,
            web_port: 6080,
            web_workers_count: 5,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read settings file: {e}")))?;

        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create settings dir: {e}")))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write settings file: {e}")))?;

        Ok(())
    }

    /// Load settings, writing the defaults first if the file does not exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let settings = Settings::default();
            settings.to_file(path)?;
            Ok(settings)
        }
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.ssh_tasks_count == 0 {
            return Err(Error::Config("ssh_tasks_count must be at least 1".to_string()));
        }

        if self.port_tasks_count == 0 {
            return Err(Error::Config("port_tasks_count must be at least 1".to_string()));
        }

        if self.ssh_test_timeout == 0 {
            return Err(Error::Config("ssh_test_timeout must be at least 1s".to_string()));
        }

        if self.ssh_client.is_empty() {
            return Err(Error::Config("ssh_client cannot be empty".to_string()));
        }

        if self.sshstore_enabled && self.sshstore_api_key.is_empty() {
            return Err(Error::Config(
                "sshstore_api_key cannot be empty while the feed is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Wrap into the shared handle the workers re-read at runtime
    pub fn into_shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }
}
