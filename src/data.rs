//! Centralized data structure for the bot

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use poise::serenity_prelude as serenity;
use serenity::prelude::TypeMapKey;
use sqlx::SqlitePool;

use crate::config::ConfigStore;
use crate::expiry::{BanPunishment, BanStore, ExpiryScheduler, MutePunishment, MuteStore};
use crate::snipe::SnipeStore;

/// Shared bot state, cloned into every command invocation and event handler
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Allow storing Data in Serenity's type map so gateway event handlers can
// reach it.
impl TypeMapKey for Data {
    type Value = Data;
}

impl Data {
    /// Wrap the assembled inner state
    #[must_use]
    pub fn new(inner: DataInner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// The inner state holds live Discord and scheduler handles, none of which
// have useful Debug output; framework error logging only needs a marker.
impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data").finish_non_exhaustive()
    }
}

/// Everything the command handlers and gateway events need
pub struct DataInner {
    /// Database pool backing all stores
    pub pool: SqlitePool,
    /// Per-guild configuration
    pub configs: ConfigStore,
    /// Active timed mutes
    pub mutes: MuteStore,
    /// Active temporary bans
    pub bans: BanStore,
    /// Deleted-message history
    pub snipes: SnipeStore,
    /// Mute reversal logic, shared with the mute scheduler
    pub mute_source: Arc<MutePunishment>,
    /// Ban reversal logic, shared with the ban scheduler
    pub ban_source: Arc<BanPunishment>,
    /// Scheduler driving auto-unmute
    pub mute_scheduler: ExpiryScheduler,
    /// Scheduler driving auto-unban
    pub ban_scheduler: ExpiryScheduler,
}
