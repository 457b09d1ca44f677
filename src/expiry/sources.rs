//! Concrete punishment sources
//!
//! The store half of each source is SQLite; the reversal half talks to
//! Discord. Subjects that are no longer resolvable (left the guild, already
//! unbanned by hand) are stale targets, not errors: there is nothing left to
//! reverse and the row still gets cleared.

use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude::{GuildId, Http, HttpError, RoleId, UserId};
use tracing::info;

use crate::EXPIRY_TARGET;
use crate::config::ConfigStore;
use crate::expiry::{BanStore, ExpiryError, ExpiryResult, MuteStore, Punishment, PunishmentRow};

/// Whether a Discord API error means the target is simply gone
fn is_not_found(error: &poise::serenity_prelude::Error) -> bool {
    matches!(
        error,
        poise::serenity_prelude::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code == 404
    )
}

/// Auto-unmute source: `muted_users` rows reversed by removing the muted role
/// and, when the row says so, restoring the member role.
pub struct MutePunishment {
    store: MuteStore,
    http: Arc<Http>,
    configs: ConfigStore,
}

impl MutePunishment {
    #[must_use]
    pub fn new(store: MuteStore, http: Arc<Http>, configs: ConfigStore) -> Self {
        Self {
            store,
            http,
            configs,
        }
    }
}

#[async_trait]
impl Punishment for MutePunishment {
    fn kind(&self) -> &'static str {
        "mute"
    }

    async fn scan(&self) -> ExpiryResult<Vec<PunishmentRow>> {
        self.store.all().await
    }

    async fn contains(&self, subject: u64) -> ExpiryResult<bool> {
        self.store.contains(subject).await
    }

    async fn revert(&self, row: &PunishmentRow) -> ExpiryResult<()> {
        // Without the guild's role ids the mute cannot be reversed. This is
        // a real failure, unlike a stale target; the executor surfaces it.
        let Some(config) = self.configs.get(row.guild) else {
            return Err(ExpiryError::UnconfiguredGuild(row.guild));
        };

        let guild_id = GuildId::new(row.guild);
        let member = match guild_id.member(&self.http, UserId::new(row.subject)).await {
            Ok(member) => member,
            Err(e) if is_not_found(&e) => {
                info!(
                    target: EXPIRY_TARGET,
                    subject = row.subject,
                    guild = row.guild,
                    "subject left the guild; nothing to unmute"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        member
            .remove_role(&self.http, RoleId::new(config.muted_role_id))
            .await?;

        if row.restore_member_role {
            if let Some(member_role) = config.member_role_id {
                member.add_role(&self.http, RoleId::new(member_role)).await?;
            }
        }

        info!(
            target: EXPIRY_TARGET,
            subject = row.subject,
            guild = row.guild,
            restored_member_role = row.restore_member_role,
            "mute reversed"
        );
        Ok(())
    }

    async fn remove(&self, subject: u64) -> ExpiryResult<bool> {
        self.store.delete(subject).await
    }
}

/// Auto-unban source: `temp_bans` rows reversed by lifting the ban.
pub struct BanPunishment {
    store: BanStore,
    http: Arc<Http>,
}

impl BanPunishment {
    #[must_use]
    pub fn new(store: BanStore, http: Arc<Http>) -> Self {
        Self { store, http }
    }
}

#[async_trait]
impl Punishment for BanPunishment {
    fn kind(&self) -> &'static str {
        "ban"
    }

    async fn scan(&self) -> ExpiryResult<Vec<PunishmentRow>> {
        self.store.all().await
    }

    async fn contains(&self, subject: u64) -> ExpiryResult<bool> {
        self.store.contains(subject).await
    }

    async fn revert(&self, row: &PunishmentRow) -> ExpiryResult<()> {
        let guild_id = GuildId::new(row.guild);
        match guild_id.unban(&self.http, UserId::new(row.subject)).await {
            Ok(()) => {
                info!(
                    target: EXPIRY_TARGET,
                    subject = row.subject,
                    guild = row.guild,
                    "temporary ban lifted"
                );
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                info!(
                    target: EXPIRY_TARGET,
                    subject = row.subject,
                    guild = row.guild,
                    "ban already lifted; nothing to do"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, subject: u64) -> ExpiryResult<bool> {
        self.store.delete(subject).await
    }
}
