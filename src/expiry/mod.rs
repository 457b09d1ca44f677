//! Timed punishment expiry for warden
//!
//! This module owns everything that happens after a timed punishment is
//! issued: the punishment rows live in SQLite, and per punishment type a
//! scheduler keeps exactly one delay armed for the soonest-expiring row,
//! reversing punishments as they come due and catching up on anything that
//! expired while the process was down.

mod error;
mod punishment;
mod scheduler;
mod sources;
mod store;

pub use error::{ExpiryError, ExpiryResult};
pub use punishment::{Punishment, PunishmentRow};
pub use scheduler::ExpiryScheduler;
pub use sources::{BanPunishment, MutePunishment};
pub use store::{BanStore, MuteStore};

/// Signal consumed by a scheduler's driver task
#[derive(Debug, Clone, Copy)]
pub(crate) enum SchedulerSignal {
    /// The punishment table changed; re-scan and re-arm
    Update,
    /// Shut the scheduler down for good
    Stop,
}
