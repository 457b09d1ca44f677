//! Single-timer expiry scheduler
//!
//! One scheduler runs per punishment type. It keeps at most one delay armed,
//! always targeting the row with the minimum expiry timestamp, and reconciles
//! against the table whenever a command handler signals that the table
//! changed. All signals flow through one mpsc channel consumed by a single
//! driver task, so cancel-then-rearm sequences are totally ordered and two
//! delays can never be armed at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::EXPIRY_TARGET;
use crate::expiry::{ExpiryResult, Punishment, PunishmentRow, SchedulerSignal};

/// Startup grace: a row with less than this much time remaining is treated
/// as already due and reversed during the reconciliation pass.
const STARTUP_GRACE_SECS: i64 = 1;

/// Capacity of the update-signal channel. Signals carry no payload, so a
/// burst beyond this coalesces into fewer rescans with the same end state.
const SIGNAL_BUFFER: usize = 16;

/// Retry delay armed when the rescan after a fired timer fails. Keeps the
/// driver out of Idle while rows may still be in the table.
const SCAN_RETRY_SECS: i64 = 2;

/// Scheduler for one punishment type.
///
/// The armed delay is only a cache of what the table currently says is
/// soonest; the table is authoritative. Constructed once per punishment type
/// by the startup sequence and held in [`crate::Data`].
pub struct ExpiryScheduler {
    kind: &'static str,
    tx: Sender<SchedulerSignal>,
    armed: Arc<AtomicBool>,
    armed_subject: Arc<Mutex<Option<u64>>>,
    last_expiry_ok: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryScheduler {
    /// Run the startup reconciliation pass, then spawn the event-driven
    /// driver task in Idle or Armed accordingly.
    ///
    /// Every row already due (within the startup grace window) is reversed
    /// synchronously before this returns, so a restart catches up on
    /// punishments that expired while the process was down. Must complete
    /// before command handlers can issue new punishments.
    ///
    /// # Errors
    /// Returns an error if the initial table scan fails; without it the
    /// scheduler has no state to start from.
    pub async fn initialize<P: Punishment>(source: Arc<P>) -> ExpiryResult<Self> {
        let kind = source.kind();
        let armed = Arc::new(AtomicBool::new(false));
        let armed_subject = Arc::new(Mutex::new(None));
        let last_expiry_ok = Arc::new(AtomicBool::new(true));

        let grace = ChronoDuration::seconds(STARTUP_GRACE_SECS);
        let next = next_future_row(source.as_ref(), grace, &last_expiry_ok).await?;
        set_armed(&armed, &armed_subject, next.as_ref());
        info!(
            target: EXPIRY_TARGET,
            kind,
            armed = next.is_some(),
            "startup reconciliation complete"
        );

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let driver = tokio::spawn(drive(
            source,
            rx,
            next,
            Arc::clone(&armed),
            Arc::clone(&armed_subject),
            Arc::clone(&last_expiry_ok),
        ));

        Ok(Self {
            kind,
            tx,
            armed,
            armed_subject,
            last_expiry_ok,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Signal that the punishment table changed.
    ///
    /// Fire and forget: the driver cancels its current delay, re-scans the
    /// table and re-arms. Safe to call rapidly; a full channel means a rescan
    /// is already queued behind this mutation, which is enough.
    pub fn request_update(&self) {
        match self.tx.try_send(SchedulerSignal::Update) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                debug!(target: EXPIRY_TARGET, kind = self.kind, "update signal after shutdown");
            }
        }
    }

    /// Cancel the pending delay and terminate the driver task. Used only at
    /// process shutdown; the scheduler does not resume afterwards.
    pub async fn stop(&self) {
        if self.tx.send(SchedulerSignal::Stop).await.is_err() {
            // Driver already gone.
            return;
        }
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(target: EXPIRY_TARGET, kind = self.kind, error = %e, "driver task panicked");
            }
        }
    }

    /// Whether a delay is currently armed
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// The subject the armed delay targets, if any
    #[must_use]
    pub fn armed_subject(&self) -> Option<u64> {
        *self
            .armed_subject
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the most recent expiry execution completed without error
    #[must_use]
    pub fn last_expiry_ok(&self) -> bool {
        self.last_expiry_ok.load(Ordering::SeqCst)
    }

    /// Punishment-type label this scheduler runs for
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

/// Driver loop: Idle parks on the signal channel, Armed races the delay
/// against the next signal.
async fn drive<P: Punishment>(
    source: Arc<P>,
    mut rx: Receiver<SchedulerSignal>,
    mut next: Option<PunishmentRow>,
    armed: Arc<AtomicBool>,
    armed_subject: Arc<Mutex<Option<u64>>>,
    last_expiry_ok: Arc<AtomicBool>,
) {
    let kind = source.kind();
    loop {
        set_armed(&armed, &armed_subject, next.as_ref());

        let Some(target) = next.clone() else {
            // Idle: nothing to do until the table changes.
            match rx.recv().await {
                Some(SchedulerSignal::Update) => {
                    next = rescan(source.as_ref(), next, &last_expiry_ok).await;
                    continue;
                }
                Some(SchedulerSignal::Stop) | None => break,
            }
        };

        tokio::select! {
            () = time::sleep(until(target.expires_at)) => {
                set_armed(&armed, &armed_subject, None);
                execute_expiry(source.as_ref(), &target, &last_expiry_ok).await;
                // The row is gone (or being retried); pick the next
                // candidate. A failed scan here must not leave the driver
                // Idle while rows remain, so arm a short retry probe: firing
                // it is a no-op for the already-cleared subject and rescans.
                next = match next_future_row(
                    source.as_ref(),
                    ChronoDuration::zero(),
                    &last_expiry_ok,
                )
                .await
                {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(
                            target: EXPIRY_TARGET,
                            kind,
                            error = %e,
                            "rescan after expiry failed; retrying shortly"
                        );
                        Some(PunishmentRow {
                            expires_at: Utc::now() + ChronoDuration::seconds(SCAN_RETRY_SECS),
                            ..target
                        })
                    }
                };
            }
            signal = rx.recv() => {
                match signal {
                    Some(SchedulerSignal::Update) => {
                        next = rescan(source.as_ref(), next, &last_expiry_ok).await;
                    }
                    Some(SchedulerSignal::Stop) | None => break,
                }
            }
        }
    }

    set_armed(&armed, &armed_subject, None);
    debug!(target: EXPIRY_TARGET, kind, "scheduler driver stopped");
}

/// Re-scan the table for a new target. If the scan fails, keep the current
/// schedule rather than dropping it blindly; the next signal or fire retries.
async fn rescan<P: Punishment + ?Sized>(
    source: &P,
    current: Option<PunishmentRow>,
    last_expiry_ok: &AtomicBool,
) -> Option<PunishmentRow> {
    match next_future_row(source, ChronoDuration::zero(), last_expiry_ok).await {
        Ok(next) => next,
        Err(e) => {
            warn!(
                target: EXPIRY_TARGET,
                kind = source.kind(),
                error = %e,
                "table scan failed; keeping current schedule"
            );
            current
        }
    }
}

/// Scan the table, reverse every due row, and return the earliest remaining
/// future row (`None` when the table is empty).
///
/// Ties on the expiry timestamp resolve to the first row in scan order
/// (`min_by_key` keeps the first of equal minima). A row whose reversal
/// cannot clear its row is skipped for the remainder of this pass instead of
/// spinning; it is retried on the next signal or fire.
async fn next_future_row<P: Punishment + ?Sized>(
    source: &P,
    grace: ChronoDuration,
    last_expiry_ok: &AtomicBool,
) -> ExpiryResult<Option<PunishmentRow>> {
    let mut stuck: Vec<u64> = Vec::new();
    loop {
        let rows = source.scan().await?;
        let now = Utc::now();
        let candidate = rows
            .iter()
            .filter(|row| !stuck.contains(&row.subject))
            .min_by_key(|row| row.expires_at)
            .cloned();

        let Some(min) = candidate else {
            return Ok(None);
        };

        if min.is_due(now, grace) {
            if !execute_expiry(source, &min, last_expiry_ok).await {
                stuck.push(min.subject);
            }
            continue;
        }

        return Ok(Some(min));
    }
}

/// Expiry executor: reverse one punishment and clear its row.
///
/// Probes the table first so a delay that fires for a row already deleted out
/// from under it (manual reversal race) is a no-op. A failing reversal is
/// logged but never blocks the row's deletion, so a broken reversal cannot
/// leave an immortal row blocking the scheduler. Returns whether the row was
/// cleared; never propagates an error.
async fn execute_expiry<P: Punishment + ?Sized>(
    source: &P,
    row: &PunishmentRow,
    last_expiry_ok: &AtomicBool,
) -> bool {
    let kind = source.kind();

    match source.contains(row.subject).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                target: EXPIRY_TARGET,
                kind,
                subject = row.subject,
                "row already cleared; nothing to reverse"
            );
            return true;
        }
        Err(e) => {
            error!(target: EXPIRY_TARGET, kind, subject = row.subject, error = %e, "existence probe failed");
            last_expiry_ok.store(false, Ordering::SeqCst);
            return false;
        }
    }

    let mut ok = true;
    if let Err(e) = source.revert(row).await {
        error!(
            target: EXPIRY_TARGET,
            kind,
            subject = row.subject,
            error = %e,
            "reversal failed; clearing the row anyway"
        );
        ok = false;
    }

    if let Err(e) = source.remove(row.subject).await {
        error!(target: EXPIRY_TARGET, kind, subject = row.subject, error = %e, "failed to delete row");
        last_expiry_ok.store(false, Ordering::SeqCst);
        return false;
    }

    last_expiry_ok.store(ok, Ordering::SeqCst);
    if ok {
        info!(
            target: EXPIRY_TARGET,
            kind,
            subject = row.subject,
            guild = row.guild,
            "punishment expired and reversed"
        );
    }
    true
}

fn until(deadline: DateTime<Utc>) -> std::time::Duration {
    (deadline - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}

fn set_armed(armed: &AtomicBool, armed_subject: &Mutex<Option<u64>>, row: Option<&PunishmentRow>) {
    *armed_subject
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = row.map(|r| r.subject);
    armed.store(row.is_some(), Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::ExpiryError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    /// In-memory punishment source. Scan order is subject order, which makes
    /// tie-breaks deterministic.
    struct FakePunishment {
        rows: Mutex<BTreeMap<u64, PunishmentRow>>,
        reverted: Mutex<Vec<u64>>,
        fail_scan: AtomicBool,
    }

    impl FakePunishment {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(BTreeMap::new()),
                reverted: Mutex::new(Vec::new()),
                fail_scan: AtomicBool::new(false),
            })
        }

        fn insert_in(&self, subject: u64, from_now_ms: i64) {
            let row = PunishmentRow {
                subject,
                guild: 1,
                expires_at: Utc::now() + ChronoDuration::milliseconds(from_now_ms),
                restore_member_role: false,
            };
            self.rows.lock().unwrap().insert(subject, row);
        }

        fn remove_row(&self, subject: u64) {
            self.rows.lock().unwrap().remove(&subject);
        }

        fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }

        fn reverted(&self) -> Vec<u64> {
            self.reverted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Punishment for FakePunishment {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn scan(&self) -> ExpiryResult<Vec<PunishmentRow>> {
            if self.fail_scan.load(Ordering::SeqCst) {
                return Err(ExpiryError::Other("injected scan failure".to_string()));
            }
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }

        async fn contains(&self, subject: u64) -> ExpiryResult<bool> {
            Ok(self.rows.lock().unwrap().contains_key(&subject))
        }

        async fn revert(&self, row: &PunishmentRow) -> ExpiryResult<()> {
            self.reverted.lock().unwrap().push(row.subject);
            Ok(())
        }

        async fn remove(&self, subject: u64) -> ExpiryResult<bool> {
            Ok(self.rows.lock().unwrap().remove(&subject).is_some())
        }
    }

    async fn settle() {
        // Give the driver task a beat to drain signals and re-arm. Deadlines
        // are wall-clock timestamps, so these tests run on the real clock
        // with wide margins rather than tokio's paused clock.
        time::sleep(StdDuration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn scenario_a_nearly_due_row_is_reversed_at_startup() {
        let source = FakePunishment::new();
        source.insert_in(1, 50);

        // 50ms falls inside the startup grace window, so the reconciliation
        // pass reverses the row before initialize returns.
        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();

        assert_eq!(source.reverted(), vec![1]);
        assert_eq!(source.row_count(), 0);
        assert!(!scheduler.is_armed());
        assert!(scheduler.last_expiry_ok());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn scenario_b_deleting_the_armed_target_moves_to_the_next_row() {
        let source = FakePunishment::new();
        source.insert_in(1, 1500);
        source.insert_in(2, 2600);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        assert_eq!(scheduler.armed_subject(), Some(1));

        source.remove_row(1);
        scheduler.request_update();
        settle().await;
        assert_eq!(scheduler.armed_subject(), Some(2));

        // Past the first deadline: nothing must have fired.
        time::sleep(StdDuration::from_millis(1800)).await;
        assert!(source.reverted().is_empty());

        // Past the second deadline: exactly one reversal.
        time::sleep(StdDuration::from_millis(1600)).await;
        assert_eq!(source.reverted(), vec![2]);
        assert!(!scheduler.is_armed());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn scenario_c_idle_scheduler_arms_on_insert_and_fires() {
        let source = FakePunishment::new();
        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        assert!(!scheduler.is_armed());

        source.insert_in(7, 1500);
        scheduler.request_update();
        settle().await;
        assert!(scheduler.is_armed());
        assert_eq!(scheduler.armed_subject(), Some(7));

        time::sleep(StdDuration::from_millis(2300)).await;
        assert!(!scheduler.is_armed());
        assert_eq!(source.reverted(), vec![7]);
        assert_eq!(source.row_count(), 0);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn p1_armed_delay_always_targets_the_minimum() {
        let source = FakePunishment::new();
        source.insert_in(10, 30_000);
        source.insert_in(20, 10_000);
        source.insert_in(30, 20_000);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        assert_eq!(scheduler.armed_subject(), Some(20));

        // A new minimum takes over.
        source.insert_in(40, 5_000);
        scheduler.request_update();
        settle().await;
        assert_eq!(scheduler.armed_subject(), Some(40));

        // Deleting the armed target falls back to the next-soonest row.
        source.remove_row(40);
        source.remove_row(20);
        scheduler.request_update();
        settle().await;
        assert_eq!(scheduler.armed_subject(), Some(30));
        assert!(source.reverted().is_empty());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn p2_startup_reverses_exactly_the_due_rows() {
        let source = FakePunishment::new();
        source.insert_in(1, -5_000);
        source.insert_in(2, -100);
        source.insert_in(3, 10_000);
        source.insert_in(4, 20_000);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();

        let mut reverted = source.reverted();
        reverted.sort_unstable();
        assert_eq!(reverted, vec![1, 2]);
        assert_eq!(source.row_count(), 2);
        assert_eq!(scheduler.armed_subject(), Some(3));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn p2_startup_with_only_due_rows_ends_idle() {
        let source = FakePunishment::new();
        source.insert_in(1, -1_000);
        source.insert_in(2, -2_000);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();

        assert_eq!(source.reverted().len(), 2);
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.armed_subject(), None);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn p3_executing_a_cleared_row_is_a_no_op() {
        let source = FakePunishment::new();
        source.insert_in(5, -100);
        let row = source.rows.lock().unwrap().get(&5).cloned().unwrap();
        let flag = AtomicBool::new(true);

        assert!(execute_expiry(source.as_ref(), &row, &flag).await);
        assert_eq!(source.reverted(), vec![5]);

        // Second execution for the same, now-deleted row: no side effects.
        assert!(execute_expiry(source.as_ref(), &row, &flag).await);
        assert_eq!(source.reverted(), vec![5]);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn p4_update_bursts_converge_to_the_single_update_state() {
        let source = FakePunishment::new();
        source.insert_in(1, 10_000);
        source.insert_in(2, 20_000);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        for _ in 0..32 {
            scheduler.request_update();
        }
        settle().await;

        assert!(scheduler.is_armed());
        assert_eq!(scheduler.armed_subject(), Some(1));
        assert!(source.reverted().is_empty());
        assert_eq!(source.row_count(), 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn scan_failure_keeps_the_current_schedule() {
        let source = FakePunishment::new();
        source.insert_in(1, 10_000);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        assert_eq!(scheduler.armed_subject(), Some(1));

        source.fail_scan.store(true, Ordering::SeqCst);
        scheduler.request_update();
        settle().await;
        assert_eq!(scheduler.armed_subject(), Some(1));

        // Once the store recovers, the next update reconciles normally.
        source.fail_scan.store(false, Ordering::SeqCst);
        source.insert_in(2, 5_000);
        scheduler.request_update();
        settle().await;
        assert_eq!(scheduler.armed_subject(), Some(2));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn scan_failure_at_fire_time_retries_without_a_signal() {
        let source = FakePunishment::new();
        source.insert_in(1, 1500);
        source.insert_in(2, 1800);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        assert_eq!(scheduler.armed_subject(), Some(1));

        // Break the store before the first deadline fires.
        source.fail_scan.store(true, Ordering::SeqCst);
        time::sleep(StdDuration::from_millis(2000)).await;
        assert_eq!(source.reverted(), vec![1]);
        // The retry probe keeps the driver armed instead of going Idle.
        assert!(scheduler.is_armed());

        // Recover; the probe must reach the remaining row with no update.
        source.fail_scan.store(false, Ordering::SeqCst);
        time::sleep(StdDuration::from_millis(2500)).await;
        assert_eq!(source.reverted(), vec![1, 2]);
        assert_eq!(source.row_count(), 0);
        assert!(!scheduler.is_armed());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_disarms_and_ignores_later_updates() {
        let source = FakePunishment::new();
        source.insert_in(1, 10_000);

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        assert!(scheduler.is_armed());

        scheduler.stop().await;
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.armed_subject(), None);

        // Must not panic or resurrect the driver.
        scheduler.request_update();
        scheduler.stop().await;
        assert!(source.reverted().is_empty());
    }

    #[tokio::test]
    async fn tie_break_picks_the_first_row_in_scan_order() {
        let source = FakePunishment::new();
        let expires_at = Utc::now() + ChronoDuration::milliseconds(10_000);
        for subject in [3, 1, 2] {
            let row = PunishmentRow {
                subject,
                guild: 1,
                expires_at,
                restore_member_role: false,
            };
            source.rows.lock().unwrap().insert(subject, row);
        }

        let scheduler = ExpiryScheduler::initialize(source.clone()).await.unwrap();
        // Scan order is subject order for the fake, so the tie goes to 1.
        assert_eq!(scheduler.armed_subject(), Some(1));
        scheduler.stop().await;
    }
}
