//! Gateway event handlers
//!
//! Captures deleted messages for the snipe history and rewrites hoisted
//! nicknames, in addition to the usual connection lifecycle logging.

use chrono::Utc;
use poise::serenity_prelude::{
    self as serenity, ChannelId, Context, EditMember, EventHandler, GuildId, GuildMemberUpdateEvent,
    Member, MessageId, Ready,
};
use tracing::{info, warn};

use crate::snipe::DeletedMessage;
use crate::{Data, EVENT_TARGET};

pub struct Handler;

/// Fallback nickname when a display name is nothing but hoisting punctuation
const DEHOIST_FALLBACK: &str = "Member";

/// Strip leading characters that sort a name above the member list.
///
/// Returns `None` when the name is already fine, otherwise the replacement.
fn dehoisted(display_name: &str) -> Option<String> {
    let trimmed = display_name.trim_start_matches(|c: char| !c.is_alphanumeric());
    if trimmed == display_name {
        return None;
    }
    if trimmed.is_empty() {
        Some(DEHOIST_FALLBACK.to_string())
    } else {
        Some(trimmed.to_string())
    }
}

/// Pull the shared bot state out of serenity's type map
async fn data_from(ctx: &Context) -> Option<Data> {
    ctx.data.read().await.get::<Data>().cloned()
}

/// Capture one deleted message from the gateway cache, if it is still there.
async fn capture_deleted(
    ctx: &Context,
    channel_id: ChannelId,
    message_id: MessageId,
    guild_id: Option<GuildId>,
) {
    let Some(data) = data_from(ctx).await else {
        return;
    };
    let Some(message) = ctx.cache.message(channel_id, message_id).map(|m| m.clone()) else {
        // Not cached, nothing to recall
        return;
    };
    if message.author.bot {
        return;
    }

    let retention = guild_id
        .and_then(|id| data.configs.get(id.get()))
        .map_or(10, |config| config.snipe_retention);

    let deleted = DeletedMessage {
        message_id: message_id.get(),
        channel_id: channel_id.get(),
        guild_id: guild_id.map(GuildId::get),
        author_id: message.author.id.get(),
        author_tag: message.author.tag(),
        content: message.content.to_string(),
        deleted_at: Utc::now(),
    };
    if let Err(e) = data.snipes.record(&deleted, retention).await {
        warn!(
            target: EVENT_TARGET,
            channel_id = channel_id.get(),
            "failed to record deleted message: {e}"
        );
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!("Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!("Cache ready! The bot is in {guild_count} guild(s)");
    }

    async fn message_delete(
        &self,
        ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        guild_id: Option<GuildId>,
    ) {
        capture_deleted(&ctx, channel_id, deleted_message_id, guild_id).await;
    }

    async fn message_delete_bulk(
        &self,
        ctx: Context,
        channel_id: ChannelId,
        multiple_deleted_messages_ids: Vec<MessageId>,
        guild_id: Option<GuildId>,
    ) {
        for message_id in multiple_deleted_messages_ids {
            capture_deleted(&ctx, channel_id, message_id, guild_id).await;
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        info!(
            target: EVENT_TARGET,
            user_id = new_member.user.id.get(),
            guild_id = new_member.guild_id.get(),
            "member joined"
        );
    }

    /// Rewrite hoisted nicknames as members change their profile.
    async fn guild_member_update(
        &self,
        ctx: Context,
        _old_if_available: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        if event.user.bot {
            return;
        }
        let Some(data) = data_from(&ctx).await else {
            return;
        };
        let dehoist_enabled = data
            .configs
            .get(event.guild_id.get())
            .is_some_and(|config| config.dehoist_nicknames);
        if !dehoist_enabled {
            return;
        }

        let display_name = event
            .nick
            .clone()
            .unwrap_or_else(|| event.user.name.clone());
        let Some(fixed) = dehoisted(&display_name) else {
            return;
        };

        let edit = EditMember::new()
            .nickname(&fixed)
            .audit_log_reason("Dehoisted display name");
        match event.guild_id.edit_member(&ctx.http, event.user.id, edit).await {
            Ok(_) => info!(
                target: EVENT_TARGET,
                user_id = event.user.id.get(),
                guild_id = event.guild_id.get(),
                nickname = %fixed,
                "dehoisted member"
            ),
            Err(e) => warn!(
                target: EVENT_TARGET,
                user_id = event.user.id.get(),
                guild_id = event.guild_id.get(),
                "failed to dehoist member: {e}"
            ),
        }
    }
}
