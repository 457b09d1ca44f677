//! Moderation command set
//!
//! Every command that mutates a punishment table signals the matching
//! scheduler afterwards, so the armed delay always tracks what the table
//! says is soonest.

use chrono::Utc;
use poise::serenity_prelude::{self as serenity, ChannelId, GuildId, RoleId};
use poise::{Context, command};
use tracing::{info, warn};

use crate::config::GuildConfig;
use crate::expiry::Punishment;
use crate::{COMMAND_TARGET, Data, Error, db};

/// Look up the invoking guild and its configuration
fn guild_config(ctx: &Context<'_, Data, Error>) -> Result<(GuildId, GuildConfig), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in a guild")?;
    let config = ctx
        .data()
        .configs
        .get(guild_id.get())
        .ok_or("This guild has no warden configuration yet")?;
    Ok((guild_id, config))
}

fn expiry_after(duration_secs: u64) -> Result<chrono::DateTime<Utc>, Error> {
    if duration_secs == 0 {
        return Err("Duration must be at least one second".into());
    }
    Ok(Utc::now() + chrono::Duration::seconds(i64::try_from(duration_secs)?))
}

/// Post a line to the guild's moderation log channel, if one is configured.
/// A failing post never fails the command itself.
async fn post_mod_log(ctx: &Context<'_, Data, Error>, config: &GuildConfig, line: &str) {
    let Some(channel) = config.log_channel_id else {
        return;
    };
    if let Err(e) = ChannelId::new(channel).say(ctx.http(), line).await {
        warn!(
            target: COMMAND_TARGET,
            channel_id = channel,
            "failed to post to the log channel: {e}"
        );
    }
}

/// Basic ping command
/// This command is used to check if the bot is responsive.
#[command(prefix_command, slash_command, guild_only)]
pub async fn ping(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    ctx.say("Pong!").await?;
    Ok(())
}

/// Mute a member for a fixed duration
///
/// The mute lifts automatically when it expires, restoring the member role
/// if the member held it.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn mute(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to mute"] user: serenity::User,
    #[description = "Duration in seconds"] duration_secs: u64,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    let (guild_id, config) = guild_config(&ctx)?;
    let expires_at = expiry_after(duration_secs)?;
    let data = ctx.data();

    let member = guild_id.member(ctx.http(), user.id).await?;
    let had_member_role = config
        .member_role_id
        .is_some_and(|id| member.roles.contains(&RoleId::new(id)));

    member
        .add_role(ctx.http(), RoleId::new(config.muted_role_id))
        .await?;
    if had_member_role {
        if let Some(member_role) = config.member_role_id {
            member
                .remove_role(ctx.http(), RoleId::new(member_role))
                .await?;
        }
    }

    data.mutes
        .insert(user.id.get(), guild_id.get(), had_member_role, expires_at)
        .await?;
    data.mute_scheduler.request_update();

    info!(
        target: COMMAND_TARGET,
        user_id = user.id.get(),
        guild_id = guild_id.get(),
        duration_secs,
        reason = reason.as_deref().unwrap_or("none"),
        "member muted"
    );
    let summary = format!(
        "Muted {} for {duration_secs}s{}",
        user.name,
        reason.map(|r| format!(" ({r})")).unwrap_or_default()
    );
    post_mod_log(&ctx, &config, &summary).await;
    ctx.say(summary).await?;
    Ok(())
}

/// Lift a mute early. The scheduler notices the row is gone on its next scan.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn unmute(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to unmute"] user: serenity::User,
) -> Result<(), Error> {
    let data = ctx.data();

    let Some(row) = data.mutes.get(user.id.get()).await? else {
        ctx.say(format!("{} is not muted", user.name)).await?;
        return Ok(());
    };

    data.mute_source.revert(&row).await?;
    data.mutes.delete(user.id.get()).await?;
    data.mute_scheduler.request_update();

    info!(
        target: COMMAND_TARGET,
        user_id = user.id.get(),
        "member unmuted manually"
    );
    ctx.say(format!("Unmuted {}", user.name)).await?;
    Ok(())
}

/// Ban a member for a fixed duration. The ban lifts automatically.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS"
)]
pub async fn tempban(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to ban"] user: serenity::User,
    #[description = "Duration in seconds"] duration_secs: u64,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    let (guild_id, config) = guild_config(&ctx)?;
    let expires_at = expiry_after(duration_secs)?;
    let data = ctx.data();

    let reason_text = reason
        .clone()
        .unwrap_or_else(|| format!("Temporary ban for {duration_secs}s"));
    guild_id
        .ban_with_reason(ctx.http(), user.id, 0, &reason_text)
        .await?;

    data.bans
        .insert(user.id.get(), guild_id.get(), expires_at)
        .await?;
    data.ban_scheduler.request_update();

    info!(
        target: COMMAND_TARGET,
        user_id = user.id.get(),
        guild_id = guild_id.get(),
        duration_secs,
        reason = reason.as_deref().unwrap_or("none"),
        "member temporarily banned"
    );
    let summary = format!("Banned {} for {duration_secs}s", user.name);
    post_mod_log(&ctx, &config, &summary).await;
    ctx.say(summary).await?;
    Ok(())
}

/// Lift a ban early, removing any pending auto-unban.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS"
)]
pub async fn unban(
    ctx: Context<'_, Data, Error>,
    #[description = "User to unban"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in a guild")?;
    let data = ctx.data();

    guild_id.unban(ctx.http(), user.id).await?;

    let had_row = data.bans.delete(user.id.get()).await?;
    if had_row {
        data.ban_scheduler.request_update();
    }

    info!(
        target: COMMAND_TARGET,
        user_id = user.id.get(),
        guild_id = guild_id.get(),
        was_temporary = had_row,
        "member unbanned manually"
    );
    ctx.say(format!("Unbanned {}", user.name)).await?;
    Ok(())
}

/// Kick a member from the guild.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "KICK_MEMBERS"
)]
pub async fn kick(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to kick"] user: serenity::User,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in a guild")?;

    let member = guild_id.member(ctx.http(), user.id).await?;
    let reason_text = reason.unwrap_or_else(|| "Kicked by moderator".to_string());
    member.kick_with_reason(ctx.http(), &reason_text).await?;

    info!(
        target: COMMAND_TARGET,
        user_id = user.id.get(),
        guild_id = guild_id.get(),
        reason = %reason_text,
        "member kicked"
    );
    if let Some(config) = ctx.data().configs.get(guild_id.get()) {
        post_mod_log(&ctx, &config, &format!("Kicked {} ({reason_text})", user.name)).await;
    }
    ctx.say(format!("Kicked {}", user.name)).await?;
    Ok(())
}

/// Grant a member the verified role.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_ROLES"
)]
pub async fn verify(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to verify"] user: serenity::User,
) -> Result<(), Error> {
    let (guild_id, config) = guild_config(&ctx)?;
    let Some(verified_role) = config.verified_role_id else {
        ctx.say("No verified role is configured for this guild")
            .await?;
        return Ok(());
    };

    let member = guild_id.member(ctx.http(), user.id).await?;
    member
        .add_role(ctx.http(), RoleId::new(verified_role))
        .await?;

    info!(
        target: COMMAND_TARGET,
        user_id = user.id.get(),
        guild_id = guild_id.get(),
        "member verified"
    );
    ctx.say(format!("Verified {}", user.name)).await?;
    Ok(())
}

/// Show the most recently deleted message(s) in this channel.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_MESSAGES"
)]
pub async fn snipe(
    ctx: Context<'_, Data, Error>,
    #[description = "How many messages to recall (1-5)"] count: Option<u32>,
) -> Result<(), Error> {
    let count = count.unwrap_or(1).clamp(1, 5);
    let entries = ctx
        .data()
        .snipes
        .latest(ctx.channel_id().get(), count)
        .await?;

    if entries.is_empty() {
        ctx.say("Nothing to snipe in this channel").await?;
        return Ok(());
    }

    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        lines.push(format!(
            "**{}** at {}: {}",
            entry.author_tag,
            entry.deleted_at.format("%H:%M:%S UTC"),
            entry.content
        ));
    }
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Set this guild's moderation configuration
///
/// Omitted optional settings keep their current value.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn configure(
    ctx: Context<'_, Data, Error>,
    #[description = "Role applied to muted members"] muted_role: serenity::RoleId,
    #[description = "Member role, removed while muted"] member_role: Option<serenity::RoleId>,
    #[description = "Role granted by verify"] verified_role: Option<serenity::RoleId>,
    #[description = "Channel for moderation log messages"] log_channel: Option<serenity::ChannelId>,
    #[description = "Rewrite hoisted display names"] dehoist_nicknames: Option<bool>,
    #[description = "Deleted messages kept per channel"] snipe_retention: Option<u32>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command only works in a guild")?;
    let data = ctx.data();

    let previous = data.configs.get(guild_id.get()).unwrap_or_default();
    data.configs.set(GuildConfig {
        guild_id: guild_id.get(),
        muted_role_id: muted_role.get(),
        member_role_id: member_role.map(RoleId::get).or(previous.member_role_id),
        verified_role_id: verified_role.map(RoleId::get).or(previous.verified_role_id),
        log_channel_id: log_channel.map(ChannelId::get).or(previous.log_channel_id),
        dehoist_nicknames: dehoist_nicknames.unwrap_or(previous.dehoist_nicknames),
        snipe_retention: snipe_retention.unwrap_or(previous.snipe_retention),
    });
    data.configs.save().await?;

    info!(
        target: COMMAND_TARGET,
        guild_id = guild_id.get(),
        "guild configuration updated"
    );
    ctx.say("Configuration saved").await?;
    Ok(())
}

/// Scheduler and store diagnostics.
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn status(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    let data = ctx.data();

    let db_ok = db::is_connected(&data.pool).await;
    let mute_count = data.mutes.count().await?;
    let ban_count = data.bans.count().await?;

    let describe = |scheduler: &crate::expiry::ExpiryScheduler| {
        let armed = match scheduler.armed_subject() {
            Some(subject) => format!("armed for {subject}"),
            None => "idle".to_string(),
        };
        format!(
            "{}: {armed}, last expiry ok: {}",
            scheduler.kind(),
            scheduler.last_expiry_ok()
        )
    };

    ctx.say(format!(
        "database connected: {db_ok}\n\
         active mutes: {mute_count}, active temp bans: {ban_count}\n\
         {}\n{}",
        describe(&data.mute_scheduler),
        describe(&data.ban_scheduler)
    ))
    .await?;
    Ok(())
}
