//! Watch Manager (C11): the periodic renewal sweep of §4.11. Every
//! `watch_scan_interval_hours` (default 6h), scans Watches expiring
//! within `watch_renewal_lookahead_hours` (default 25h) and renews each
//! via `SetupWatch` then `StopWatch(old)`, atomically replacing the row.
//! A Watch that fails renewal three times running is marked inactive and
//! an alert fires; the affected `(user, source)`'s polling interval is
//! halved until a human intervenes.
//!
//! `WatchManagerHandle` is a handle struct owning a `CancellationToken`:
//! spawned once via `spawn_periodic`, `stop()`-ed on shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{Source, Watch};
use crate::providers::ProviderAdapter;
use crate::store::RecordStore;

use super::AlertSink;

/// Three consecutive renewal failures mark a Watch inactive (§4.11).
pub const MAX_RENEWAL_FAILURES: u32 = 3;

/// Outcome of attempting to renew one Watch, for observability/tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// `SetupWatch` succeeded; the old channel was stopped and the row
    /// atomically replaced.
    Renewed,
    /// `SetupWatch` failed; `renewal_failures` was incremented. Still
    /// below the three-strikes threshold.
    FailedRetrying { failures: u32 },
    /// `SetupWatch` failed for the third time running; the Watch is now
    /// `active = false` and an alert was raised.
    FailedExhausted,
}

pub struct WatchManager<'a> {
    store: &'a dyn RecordStore,
    adapters: &'a HashMap<Source, Box<dyn ProviderAdapter>>,
    alerts: &'a dyn AlertSink,
    lookahead_hours: i64,
}

impl<'a> WatchManager<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        adapters: &'a HashMap<Source, Box<dyn ProviderAdapter>>,
        alerts: &'a dyn AlertSink,
        lookahead_hours: i64,
    ) -> Self {
        Self {
            store,
            adapters,
            alerts,
            lookahead_hours,
        }
    }

    /// One sweep: finds every active Watch expiring within the
    /// lookahead window and attempts to renew it. Returns the outcomes,
    /// one per Watch visited, for callers that want to log/assert.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<RenewalOutcome>, CoreError> {
        let deadline = now + chrono::Duration::hours(self.lookahead_hours);
        let expiring = self.store.list_watches_expiring_before(deadline).await?;

        let mut outcomes = Vec::with_capacity(expiring.len());
        for watch in expiring {
            if !watch.active {
                continue;
            }
            outcomes.push(self.renew_one(watch).await?);
        }
        Ok(outcomes)
    }

    /// Forces renewal of a single Watch regardless of its expiry, for the
    /// `renew-watch(user, source)` admin command (§6).
    pub async fn force_renew(&self, owner_id: Uuid, source: Source) -> Result<RenewalOutcome, CoreError> {
        let watches = self.store.list_active_watches().await?;
        let Some(watch) = watches
            .into_iter()
            .find(|w| w.owner_id == owner_id && w.source == source)
        else {
            return Err(CoreError::fatal("no active watch for (user, source)"));
        };
        self.renew_one(watch).await
    }

    async fn renew_one(&self, old: Watch) -> Result<RenewalOutcome, CoreError> {
        let Some(adapter) = self.adapters.get(&old.source) else {
            return Err(CoreError::fatal("no adapter configured for source"));
        };

        match adapter
            .setup_watch(old.owner_id, old.resource_id.as_deref())
            .await
        {
            Ok(mut new_watch) => {
                // Old channel is stopped only after the new one exists,
                // so a crash between the two calls never leaves the user
                // with zero live watches (§4.11: "recoverable fault, not
                // a crash" — worst case is two live channels briefly).
                if let Err(e) = adapter.stop_watch(&old).await {
                    tracing::warn!(
                        watch_id = %old.id, error = %e,
                        "failed to stop old watch channel after renewal; provider will let it lapse"
                    );
                }
                new_watch.id = old.id;
                new_watch.renewal_failures = 0;
                self.store.save_watch(&new_watch).await?;
                Ok(RenewalOutcome::Renewed)
            }
            Err(e) if e.is_transient() => {
                let failures = old.renewal_failures + 1;
                if failures >= MAX_RENEWAL_FAILURES {
                    let mut failed = old.clone();
                    failed.active = false;
                    failed.renewal_failures = failures;
                    self.store.save_watch(&failed).await?;
                    // The push channel is dead; halve the polling interval
                    // for this (user, source) so pull-based sync picks up
                    // the slack until a human re-establishes the watch.
                    super::scheduler::halve_interval_for_watch_failure(
                        self.store,
                        old.owner_id,
                        old.source,
                    )
                    .await?;
                    self.alerts
                        .watch_renewal_failed(old.owner_id, old.source, failures)
                        .await;
                    Ok(RenewalOutcome::FailedExhausted)
                } else {
                    let mut retried = old.clone();
                    retried.renewal_failures = failures;
                    self.store.save_watch(&retried).await?;
                    Ok(RenewalOutcome::FailedRetrying { failures })
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Long-running handle around a periodic sweep task, mirroring
/// `jobs::watcher::DocWatcher`'s spawn/stop shape: `spawn` returns a
/// handle owning a `CancellationToken`; `stop` cancels it. Construction
/// takes owning (not borrowed) `Arc`s since the task outlives the
/// caller's stack frame.
pub struct WatchManagerHandle {
    cancel: CancellationToken,
}

impl WatchManagerHandle {
    /// Spawns the periodic sweep, running every `scan_interval` and
    /// invoking `sweep_fn` (typically a closure wrapping `WatchManager::
    /// sweep` over `Arc`-shared dependencies) until cancelled.
    pub fn spawn<F, Fut>(scan_interval: std::time::Duration, mut sweep_fn: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_clone.cancelled() => {
                        tracing::debug!("watch manager sweep cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        sweep_fn().await;
                    }
                }
            }
        });

        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Convenience constructor used by `sunnycored`'s `serve` command: wraps
/// `WatchManager::sweep` over `Arc`-shared store/adapters/alerts so the
/// spawned task can own its dependencies.
pub fn spawn_periodic(
    store: Arc<dyn RecordStore>,
    adapters: Arc<HashMap<Source, Box<dyn ProviderAdapter>>>,
    alerts: Arc<dyn AlertSink>,
    scan_interval: std::time::Duration,
    lookahead_hours: i64,
) -> WatchManagerHandle {
    WatchManagerHandle::spawn(scan_interval, move || {
        let store = store.clone();
        let adapters = adapters.clone();
        let alerts = alerts.clone();
        async move {
            let manager = WatchManager::new(&*store, &adapters, &*alerts, lookahead_hours);
            if let Err(e) = manager.sweep(Utc::now()).await {
                tracing::error!(error = %e, "watch manager sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fixture::FixtureAdapter;
    use crate::store::mem::MemStore;

    #[derive(Default)]
    struct RecordingAlerts {
        calls: parking_lot::Mutex<Vec<(Uuid, Source, u32)>>,
    }

    #[async_trait::async_trait]
    impl AlertSink for RecordingAlerts {
        async fn watch_renewal_failed(&self, owner_id: Uuid, source: Source, failures: u32) {
            self.calls.lock().push((owner_id, source, failures));
        }
    }

    async fn seed_watch(store: &MemStore, owner: Uuid, source: Source, expiry: DateTime<Utc>) -> Watch {
        let watch = Watch {
            id: Uuid::new_v4(),
            owner_id: owner,
            source,
            resource_id: None,
            channel_handle: "chan-1".to_string(),
            expiry,
            active: true,
            renewal_failures: 0,
        };
        store.save_watch(&watch).await.unwrap();
        watch
    }

    #[tokio::test]
    async fn sweep_renews_watch_expiring_within_lookahead() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        let old = seed_watch(&store, owner, Source::Mail, Utc::now() + chrono::Duration::hours(12)).await;

        let mut adapters: HashMap<Source, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Source::Mail, Box::new(FixtureAdapter::new(Source::Mail)));
        let alerts = RecordingAlerts::default();

        let manager = WatchManager::new(&store, &adapters, &alerts, 25);
        let outcomes = manager.sweep(Utc::now()).await.unwrap();
        assert_eq!(outcomes, vec![RenewalOutcome::Renewed]);

        let active = store.list_active_watches().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, old.id);
        assert!(active[0].expiry >= Utc::now() + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn sweep_ignores_watches_outside_lookahead() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        seed_watch(&store, owner, Source::Drive, Utc::now() + chrono::Duration::hours(48)).await;

        let mut adapters: HashMap<Source, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Source::Drive, Box::new(FixtureAdapter::new(Source::Drive)));
        let alerts = RecordingAlerts::default();

        let manager = WatchManager::new(&store, &adapters, &alerts, 25);
        let outcomes = manager.sweep(Utc::now()).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn three_failed_renewals_deactivate_and_alert() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        seed_watch(&store, owner, Source::Calendar, Utc::now() + chrono::Duration::hours(1)).await;

        let adapter = FixtureAdapter::new(Source::Calendar);
        adapter.fail_setup_watch(true);
        let mut adapters: HashMap<Source, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Source::Calendar, Box::new(adapter));
        let alerts = RecordingAlerts::default();

        let manager = WatchManager::new(&store, &adapters, &alerts, 25);

        let o1 = manager.sweep(Utc::now()).await.unwrap();
        assert_eq!(o1, vec![RenewalOutcome::FailedRetrying { failures: 1 }]);
        let o2 = manager.sweep(Utc::now()).await.unwrap();
        assert_eq!(o2, vec![RenewalOutcome::FailedRetrying { failures: 2 }]);
        let o3 = manager.sweep(Utc::now()).await.unwrap();
        assert_eq!(o3, vec![RenewalOutcome::FailedExhausted]);

        assert_eq!(alerts.calls.lock().len(), 1);
        let active = store.list_active_watches().await.unwrap();
        assert!(active.is_empty());

        let metric = store.get_activity_metric(owner, Source::Calendar).await.unwrap();
        assert_eq!(metric.next_interval_minutes, 15);
    }

    #[tokio::test]
    async fn force_renew_ignores_expiry() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        seed_watch(&store, owner, Source::Mail, Utc::now() + chrono::Duration::days(10)).await;

        let mut adapters: HashMap<Source, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Source::Mail, Box::new(FixtureAdapter::new(Source::Mail)));
        let alerts = RecordingAlerts::default();

        let manager = WatchManager::new(&store, &adapters, &alerts, 25);
        let outcome = manager.force_renew(owner, Source::Mail).await.unwrap();
        assert_eq!(outcome, RenewalOutcome::Renewed);
    }
}
