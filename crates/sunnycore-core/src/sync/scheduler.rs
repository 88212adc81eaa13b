//! Scheduler (C10): the adaptive cadence engine of §4.10. Owns an
//! in-memory timer wheel keyed by `(user, source)`, computed from each
//! pair's `ActivityMetric`, and decides at every tick whether a poll is
//! due ("smart polling", §4.10 last paragraph).
//!
//! One timer entry per `(user, source)`, driven by a periodic tick plus
//! push-callback gaps, each owning a `CancellationToken` for clean
//! shutdown of its spawned task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{ActivityMetric, ChangeFrequency, Source};
use crate::store::RecordStore;

/// Lower/upper bounds on `next_interval_minutes` the adaptive table in
/// §4.10 can ever produce (120 max for `low`, 5 min floor once virtual-
/// mail activity has halved it).
pub const MAX_INTERVAL_MINUTES: f64 = 120.0;
pub const MIN_INTERVAL_MINUTES: f64 = 5.0;

/// Days of inactivity after which a `(user, source)` is suspended from
/// scheduled ticks until a push callback or explicit `resume` (§4.10).
pub const INACTIVITY_SUSPEND_DAYS: i64 = 14;

/// §4.10's interval table, keyed on how many items changed on the last
/// poll. Returns `(change_frequency, next_interval_minutes)` given the
/// previous interval (used only by the `low`/0-changes row, which decays
/// multiplicatively rather than snapping to a fixed value).
pub fn next_interval(items_changed: u64, prev_interval_minutes: u32) -> (ChangeFrequency, u32) {
    match items_changed {
        0 => {
            let grown = (prev_interval_minutes as f64 * 1.5).min(MAX_INTERVAL_MINUTES);
            (ChangeFrequency::Low, grown.round() as u32)
        }
        1..=5 => (ChangeFrequency::Medium, 30),
        6..=20 => (ChangeFrequency::High, 15),
        _ => (ChangeFrequency::High, 10),
    }
}

/// Applies the full §4.10 update: interval table, virtual-mail halving
/// (floor 5 minutes), and the rolling 24h counters. Called by the
/// Scheduler after every poll completes (successful or not — a failed
/// poll still updates `items_seen_total`/`last_activity_at` via its
/// caller passing `items_changed = 0`).
pub fn apply_poll_outcome(
    metric: &mut ActivityMetric,
    items_changed: u64,
    virtual_mail_activity_24h: bool,
    now: DateTime<Utc>,
) {
    let (frequency, mut interval) = next_interval(items_changed, metric.next_interval_minutes);

    if virtual_mail_activity_24h {
        interval = ((interval as f64) / 2.0).max(MIN_INTERVAL_MINUTES).round() as u32;
    }

    metric.items_seen_total += items_changed;
    metric.items_changed_last_24h = items_changed;
    metric.change_frequency = frequency;
    metric.next_interval_minutes = interval;
    metric.virtual_mail_activity_24h = virtual_mail_activity_24h;
    if items_changed > 0 {
        metric.last_activity_at = Some(now);
    }
}

/// Halves the stored `next_interval_minutes` for `(owner_id, source)`,
/// floored at `MIN_INTERVAL_MINUTES`. Called by the Watch Manager when a
/// Watch exhausts its renewal retries (§4.11: "the user's polling
/// interval for that source is halved until a human intervenes"), since
/// a dead push channel means the Scheduler can no longer rely on push
/// callbacks to catch changes promptly.
pub async fn halve_interval_for_watch_failure(
    store: &dyn RecordStore,
    owner_id: Uuid,
    source: Source,
) -> Result<u32, CoreError> {
    let mut metric = store.get_activity_metric(owner_id, source).await?;
    let halved = ((metric.next_interval_minutes as f64) / 2.0)
        .max(MIN_INTERVAL_MINUTES)
        .round() as u32;
    metric.next_interval_minutes = halved;
    store.save_activity_metric(&metric).await?;
    Ok(halved)
}

/// What the Scheduler decides for a single `(user, source)` entry at a
/// given tick instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Time since last poll ≥ `next_interval`, or a push-callback gap is
    /// pending: the Poller should run now.
    Due,
    /// Too soon since the last successful poll and no pending gap
    /// ("smart polling" no-op, §4.10 last paragraph).
    NotYet,
    /// 14 days with no activity and no resume/push since: no ticks fire
    /// until `resume` or a push callback (§4.10).
    Suspended,
}

/// Decides whether `(metric, last_poll)` is due at `now`, given whether a
/// push-callback gap is pending for this `(user, source)` (§4.10).
pub fn decide_tick(
    metric: &ActivityMetric,
    last_poll: Option<DateTime<Utc>>,
    push_gap_pending: bool,
    suspended: bool,
    now: DateTime<Utc>,
) -> TickDecision {
    if suspended && !push_gap_pending {
        return TickDecision::Suspended;
    }
    if push_gap_pending {
        return TickDecision::Due;
    }
    match last_poll {
        None => TickDecision::Due,
        Some(last) => {
            let elapsed = now - last;
            let due_at = chrono::Duration::minutes(metric.next_interval_minutes as i64);
            if elapsed >= due_at {
                TickDecision::Due
            } else {
                TickDecision::NotYet
            }
        }
    }
}

/// Per-`(user, source)` scheduling state the timer wheel tracks beyond
/// what's durable in `ActivityMetric`/`SyncCursor`: whether a user has
/// been explicitly suspended/resumed, and whether a push callback
/// arrived since the last tick (which forces `Due` regardless of the
/// adaptive interval).
#[derive(Debug, Clone, Default)]
struct Entry {
    manually_suspended: bool,
    push_gap_pending: bool,
}

/// The in-memory timer wheel. Sharded externally by `hash(user_id) mod N`
/// for scale per §5; a single `Scheduler` owns one shard's worth of
/// `(user, source)` entries. Holds no lock across an `await` — entries
/// are read/written under a `parking_lot::Mutex` only for the duration of
/// a synchronous decision, matching §5's "no lock held across suspension"
/// rule.
pub struct Scheduler {
    entries: Mutex<HashMap<(Uuid, Source), Entry>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// A push callback arrived for `(owner_id, source)`: the next tick
    /// for this pair is forced `Due` even if its adaptive interval
    /// hasn't elapsed, and any suspension is implicitly lifted (§4.10:
    /// "until a push callback... resumes them").
    pub fn notify_push(&self, owner_id: Uuid, source: Source) {
        let mut entries = self.entries.lock();
        let entry = entries.entry((owner_id, source)).or_default();
        entry.push_gap_pending = true;
        entry.manually_suspended = false;
    }

    /// Operator `suspend(user)` / §6 admin surface. Applies to all
    /// sources the caller schedules for this user (caller iterates
    /// sources).
    pub fn suspend(&self, owner_id: Uuid, source: Source) {
        self.entries
            .lock()
            .entry((owner_id, source))
            .or_default()
            .manually_suspended = true;
    }

    /// Operator `resume(user)` / §6 admin surface.
    pub fn resume(&self, owner_id: Uuid, source: Source) {
        self.entries
            .lock()
            .entry((owner_id, source))
            .or_default()
            .manually_suspended = false;
    }

    /// Decides and clears the pending-push-gap flag for one `(user,
    /// source)` tick, consulting the store for the metric and cursor's
    /// last-poll instant. Returns the decision; callers that get `Due`
    /// are responsible for actually invoking the Poller and then calling
    /// `record_poll_outcome`.
    pub async fn tick(
        &self,
        store: &dyn RecordStore,
        owner_id: Uuid,
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<TickDecision, CoreError> {
        let metric = store.get_activity_metric(owner_id, source).await?;
        let cursor = store.get_cursor(owner_id, source).await?;

        let (push_gap_pending, manually_suspended) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry((owner_id, source)).or_default();
            let gap = std::mem::take(&mut entry.push_gap_pending);
            (gap, entry.manually_suspended)
        };

        let inactive = metric.is_inactive(now);
        let suspended = manually_suspended || inactive;

        Ok(decide_tick(
            &metric,
            cursor.last_successful_poll,
            push_gap_pending,
            suspended,
            now,
        ))
    }

    /// Updates the stored `ActivityMetric` after a poll completes
    /// (successful or not — callers pass `items_changed = 0` and
    /// `virtual_mail_activity_24h` unchanged on failure so the interval
    /// still decays per the `low` row; a failed poll still "happened").
    pub async fn record_poll_outcome(
        &self,
        store: &dyn RecordStore,
        owner_id: Uuid,
        source: Source,
        items_changed: u64,
        virtual_mail_activity_24h: bool,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut metric = store.get_activity_metric(owner_id, source).await?;
        apply_poll_outcome(&mut metric, items_changed, virtual_mail_activity_24h, now);
        store.save_activity_metric(&metric).await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a coarse-grained periodic driver: every `tick_period`, calls
/// `on_tick` for bookkeeping (real deployments drive the actual
/// Poller/WatchManager fan-out from the caller's own loop; this helper
/// exists so `sunnycored`'s `serve` command has a single cancellable
/// `tokio::spawn` background task).
pub async fn run_timer_loop<F, Fut>(
    scheduler: Arc<Scheduler>,
    tick_period: Duration,
    mut on_tick: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    let cancel = scheduler.cancellation_token();
    let mut interval = tokio::time::interval(tick_period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("scheduler timer loop cancelled");
                break;
            }
            _ = interval.tick() => {
                on_tick().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    #[test]
    fn interval_table_matches_spec_rows() {
        assert_eq!(next_interval(0, 80).1, 120);
        assert_eq!(next_interval(0, 10).1, 15);
        assert_eq!(next_interval(3, 999).1, 30);
        assert_eq!(next_interval(10, 999).1, 15);
        assert_eq!(next_interval(21, 999).1, 10);
    }

    #[test]
    fn virtual_mail_activity_halves_interval_with_floor() {
        let mut metric = ActivityMetric::new(Uuid::new_v4(), Source::Mail);
        metric.next_interval_minutes = 30;
        apply_poll_outcome(&mut metric, 0, true, Utc::now());
        // 0 changes -> low -> 30*1.5=45, halved by virtual-mail = 22 (rounded)
        assert_eq!(metric.next_interval_minutes, 23);

        let mut metric2 = ActivityMetric::new(Uuid::new_v4(), Source::Mail);
        metric2.next_interval_minutes = 6;
        apply_poll_outcome(&mut metric2, 0, true, Utc::now());
        assert!(metric2.next_interval_minutes >= MIN_INTERVAL_MINUTES as u32);
    }

    #[test]
    fn fourteen_days_inactive_is_suspended() {
        let mut metric = ActivityMetric::new(Uuid::new_v4(), Source::Mail);
        metric.last_activity_at = Some(Utc::now() - chrono::Duration::days(20));
        assert!(metric.is_inactive(Utc::now()));

        let decision = decide_tick(&metric, None, false, true, Utc::now());
        assert_eq!(decision, TickDecision::Suspended);
    }

    #[test]
    fn push_gap_forces_due_even_when_suspended() {
        let metric = ActivityMetric::new(Uuid::new_v4(), Source::Mail);
        let decision = decide_tick(&metric, None, true, true, Utc::now());
        assert_eq!(decision, TickDecision::Due);
    }

    #[test]
    fn not_yet_due_before_interval_elapses() {
        let mut metric = ActivityMetric::new(Uuid::new_v4(), Source::Mail);
        metric.next_interval_minutes = 30;
        let last_poll = Some(Utc::now() - chrono::Duration::minutes(5));
        let decision = decide_tick(&metric, last_poll, false, false, Utc::now());
        assert_eq!(decision, TickDecision::NotYet);
    }

    #[tokio::test]
    async fn tick_consults_store_and_respects_suspend() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        let scheduler = Scheduler::new();

        let decision = scheduler
            .tick(&store, owner, Source::Mail, Utc::now())
            .await
            .unwrap();
        assert_eq!(decision, TickDecision::Due);

        scheduler
            .record_poll_outcome(&store, owner, Source::Mail, 0, false, Utc::now())
            .await
            .unwrap();

        let decision2 = scheduler
            .tick(&store, owner, Source::Mail, Utc::now())
            .await
            .unwrap();
        assert_eq!(decision2, TickDecision::NotYet);

        scheduler.suspend(owner, Source::Calendar);
        let decision3 = scheduler
            .tick(&store, owner, Source::Calendar, Utc::now())
            .await
            .unwrap();
        // last_successful_poll is None for a fresh cursor, but manual
        // suspend still wins over the "no prior poll" Due default.
        assert_eq!(decision3, TickDecision::Suspended);

        scheduler.resume(owner, Source::Calendar);
        let decision4 = scheduler
            .tick(&store, owner, Source::Calendar, Utc::now())
            .await
            .unwrap();
        assert_eq!(decision4, TickDecision::Due);
    }

    #[tokio::test]
    async fn push_notification_clears_after_one_tick() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        let scheduler = Scheduler::new();

        scheduler
            .record_poll_outcome(&store, owner, Source::Drive, 0, false, Utc::now())
            .await
            .unwrap();
        scheduler.notify_push(owner, Source::Drive);

        let decision = scheduler
            .tick(&store, owner, Source::Drive, Utc::now())
            .await
            .unwrap();
        assert_eq!(decision, TickDecision::Due);

        // Gap was consumed; immediately after, with no new poll, it's NotYet.
        let decision2 = scheduler
            .tick(&store, owner, Source::Drive, Utc::now())
            .await
            .unwrap();
        assert_eq!(decision2, TickDecision::NotYet);
    }
}
