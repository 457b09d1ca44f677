//! Punishment rows and the capability trait the scheduler runs against
//!
//! The mute and ban instances are structurally identical; everything the
//! scheduler needs from a punishment type is captured here so the scheduler
//! itself is written once.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::expiry::ExpiryResult;

/// One active timed punishment, as stored in its table.
///
/// A row is created when the punishment is issued and destroyed when it is
/// reversed, either automatically on expiry or manually by a moderator.
/// `expires_at` is set once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentRow {
    /// The punished user id. Unique per row within a punishment-type table.
    pub subject: u64,
    /// Guild the punishment applies to.
    pub guild: u64,
    /// Absolute timestamp after which the punishment must be reversed.
    pub expires_at: DateTime<Utc>,
    /// Mute-specific restore flag: the subject held the member role before
    /// being muted and gets it back on reversal. Always false for bans.
    pub restore_member_role: bool,
}

impl PunishmentRow {
    /// Whether this row should be reversed now. `grace` widens the window so
    /// the startup pass can treat nearly-expired rows as already due.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.expires_at <= now + grace
    }
}

/// Capability set a punishment type provides to the scheduler.
#[async_trait]
pub trait Punishment: Send + Sync + 'static {
    /// Static label used in log context ("mute", "ban").
    fn kind(&self) -> &'static str;

    /// Full table scan of the active rows.
    async fn scan(&self) -> ExpiryResult<Vec<PunishmentRow>>;

    /// Whether a row for this subject currently exists.
    async fn contains(&self, subject: u64) -> ExpiryResult<bool>;

    /// Undo the punishment's effect on the platform.
    ///
    /// A subject that can no longer be resolved (left the guild, already
    /// unbanned by hand) is not an error: log it and return `Ok`.
    async fn revert(&self, row: &PunishmentRow) -> ExpiryResult<()>;

    /// Delete the row. Returns whether a row existed.
    async fn remove(&self, subject: u64) -> ExpiryResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let row = PunishmentRow {
            subject: 1,
            guild: 1,
            expires_at: now + Duration::milliseconds(500),
            restore_member_role: false,
        };

        // Not due without grace, due once the grace window covers it.
        assert!(!row.is_due(now, Duration::zero()));
        assert!(row.is_due(now, Duration::seconds(1)));

        // A past deadline is always due.
        let past = PunishmentRow {
            expires_at: now - Duration::seconds(5),
            ..row
        };
        assert!(past.is_due(now, Duration::zero()));
    }
}
