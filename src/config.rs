//! Per-guild configuration
//!
//! Guild settings (role ids, log channel, snipe retention) live in a YAML
//! file and are loaded into a shared map at startup. A missing file is not an
//! error; the bot simply starts unconfigured.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Guild configuration file path
pub const CONFIG_FILE: &str = "data/warden.yaml";

fn default_true() -> bool {
    true
}

fn default_snipe_retention() -> u32 {
    10
}

/// Guild configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildConfig {
    /// The ID of the guild
    pub guild_id: u64,
    /// Role applied to muted members
    pub muted_role_id: u64,
    /// Regular member role, removed while muted and restored afterwards
    #[serde(default)]
    pub member_role_id: Option<u64>,
    /// Role granted by the verify command
    #[serde(default)]
    pub verified_role_id: Option<u64>,
    /// Channel for moderation log messages
    #[serde(default)]
    pub log_channel_id: Option<u64>,
    /// Rewrite display names that start with hoisting punctuation
    #[serde(default = "default_true")]
    pub dehoist_nicknames: bool,
    /// How many deleted messages to keep per channel
    #[serde(default = "default_snipe_retention")]
    pub snipe_retention: u32,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            muted_role_id: 0,
            member_role_id: None,
            verified_role_id: None,
            log_channel_id: None,
            dehoist_nicknames: true,
            snipe_retention: default_snipe_retention(),
        }
    }
}

/// Shared map of guild id to configuration
#[derive(Clone, Default)]
pub struct ConfigStore {
    inner: Arc<DashMap<u64, GuildConfig>>,
}

impl ConfigStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configurations from the YAML file.
    ///
    /// A missing or unreadable file yields an empty store so a fresh install
    /// can start without any setup.
    pub async fn load() -> Self {
        let store = Self::new();
        match tokio::fs::read_to_string(CONFIG_FILE).await {
            Ok(contents) => match serde_yaml::from_str::<Vec<GuildConfig>>(&contents) {
                Ok(configs) => {
                    for config in configs {
                        store.inner.insert(config.guild_id, config);
                    }
                }
                Err(e) => warn!("failed to parse {CONFIG_FILE}: {e}"),
            },
            Err(_) => warn!("{CONFIG_FILE} not found; starting unconfigured"),
        }
        store
    }

    /// Save all configurations back to the YAML file.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be created, the
    /// configurations cannot be serialized, or the file cannot be written.
    pub async fn save(&self) -> Result<(), crate::Error> {
        if let Some(dir) = std::path::Path::new(CONFIG_FILE).parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let configs: Vec<GuildConfig> = self
            .inner
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let yaml = serde_yaml::to_string(&configs)?;
        tokio::fs::write(CONFIG_FILE, yaml).await?;
        Ok(())
    }

    /// Get the configuration for a guild
    #[must_use]
    pub fn get(&self, guild_id: u64) -> Option<GuildConfig> {
        self.inner.get(&guild_id).map(|entry| entry.value().clone())
    }

    /// Insert or replace a guild's configuration
    pub fn set(&self, config: GuildConfig) {
        self.inner.insert(config.guild_id, config);
    }

    /// Number of configured guilds
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no guild is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
