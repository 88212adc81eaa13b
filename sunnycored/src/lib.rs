//! Ingestion daemon and admin CLI for sunnycore (§6).
//!
//! Each one-shot admin subcommand is a synchronous function that spins
//! up its own short-lived tokio runtime and exits; `serve` is the one
//! long-running command, driving the background sync engine until
//! shutdown.

pub mod app;
pub mod cli;
pub mod error;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use sunnycore_core::model::Source;
use sunnycore_core::sync::poller::Poller;
use sunnycore_core::sync::scheduler::{run_timer_loop, TickDecision};
use sunnycore_core::sync::watch_manager::{spawn_periodic, WatchManager};
use sunnycore_core::sync::{AlertSink, TracingAlertSink};
use sunnycore_core::Config;
use sunnycore_core::Settings;

use crate::app::DaemonApp;
use crate::error::{from_provider_error, CliError};
use crate::worker::PipelineQueue;

const ALL_SOURCES: [Source; 3] = [Source::Mail, Source::Drive, Source::Calendar];

/// Initializes `tracing` + `tracing-subscriber` with env-filter,
/// defaulting to info level for this crate and its core library.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sunnycored=info,sunnycore_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn new_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().expect("failed to create tokio runtime")
}

fn exit(result: Result<(), CliError>) -> std::process::ExitCode {
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            std::process::ExitCode::from(e.exit_code())
        }
    }
}

async fn require_user(app: &DaemonApp, user: Uuid) -> Result<(), CliError> {
    app.store
        .get_user(user)
        .await
        .map_err(from_provider_error)?
        .ok_or_else(|| CliError::NotFound(format!("no such user: {user}")))?;
    Ok(())
}

async fn build_app() -> Result<DaemonApp, CliError> {
    let config = Config::load_or_default();
    let settings = Settings::load(&config.settings_file);
    app::build(&config, settings).await
}

/// `poll(user, source)`: force a tick now, bypassing the Scheduler's
/// adaptive cadence (§6).
pub fn poll(user: Uuid, source: Source) -> std::process::ExitCode {
    let rt = new_runtime();
    exit(rt.block_on(async move {
        let app = Arc::new(build_app().await?);
        require_user(&app, user).await?;

        let adapter = app
            .adapter_for(source)
            .ok_or_else(|| CliError::NotFound(format!("no adapter configured for {source}")))?;

        let queue = PipelineQueue::new(Arc::clone(&app));
        let poller = Poller::new(&*app.store, &queue);
        let outcome = poller.tick(user, adapter).await.map_err(from_provider_error)?;

        app.scheduler
            .record_poll_outcome(
                &*app.store,
                user,
                source,
                outcome.enqueued as u64,
                outcome.virtual_mail_activity,
                Utc::now(),
            )
            .await
            .map_err(from_provider_error)?;

        tracing::info!(%user, %source, enqueued = outcome.enqueued, virtual_mail_activity = outcome.virtual_mail_activity, "forced poll tick complete");
        Ok(())
    }))
}

/// `renew-watch(user, source)`: force a Watch renewal now, regardless of
/// expiry (§6).
pub fn renew_watch(user: Uuid, source: Source) -> std::process::ExitCode {
    let rt = new_runtime();
    exit(rt.block_on(async move {
        let app = build_app().await?;
        require_user(&app, user).await?;

        let alerts = TracingAlertSink;
        let manager = WatchManager::new(
            &*app.store,
            &app.adapters,
            &alerts,
            app.settings.watch_renewal_lookahead_hours,
        );

        let outcome = manager
            .force_renew(user, source)
            .await
            .map_err(from_provider_error)?;

        tracing::info!(%user, %source, ?outcome, "forced watch renewal complete");
        Ok(())
    }))
}

/// `reset-cursor(user, source)`: clears the stored history token so the
/// next poll re-scans recent history instead of resuming from the old
/// cursor (§6).
pub fn reset_cursor(user: Uuid, source: Source) -> std::process::ExitCode {
    let rt = new_runtime();
    exit(rt.block_on(async move {
        let app = build_app().await?;
        require_user(&app, user).await?;

        let mut cursor = app
            .store
            .get_cursor(user, source)
            .await
            .map_err(from_provider_error)?;
        cursor.history_token = None;
        app.store.save_cursor(&cursor).await.map_err(from_provider_error)?;

        tracing::info!(%user, %source, "cursor reset");
        Ok(())
    }))
}

/// `suspend(user)`: suspend scheduled polling for every source of this
/// user (§6). The Scheduler's in-memory suspension flags live only for
/// this process's lifetime; a long-running `serve` process is the one
/// whose suspension state actually matters, so this command's effect is
/// only durable if it talks to that same running process's Scheduler —
/// documented in DESIGN.md as the in-process-admin-surface limitation
/// this prototype accepts.
pub fn suspend(user: Uuid) -> std::process::ExitCode {
    set_suspension(user, true)
}

/// `resume(user)`: the inverse of `suspend` (§6).
pub fn resume(user: Uuid) -> std::process::ExitCode {
    set_suspension(user, false)
}

fn set_suspension(user: Uuid, suspended: bool) -> std::process::ExitCode {
    let rt = new_runtime();
    exit(rt.block_on(async move {
        let app = build_app().await?;
        require_user(&app, user).await?;

        for source in ALL_SOURCES {
            if suspended {
                app.scheduler.suspend(user, source);
            } else {
                app.scheduler.resume(user, source);
            }
        }

        tracing::info!(%user, suspended, "updated scheduler suspension state");
        Ok(())
    }))
}

/// `serve`: the long-running daemon. Drives the Scheduler's tick loop
/// (adaptive per-(user, source) polling) and the Watch Manager's
/// periodic renewal sweep until `Ctrl-C` (own tokio runtime,
/// `tokio::signal::ctrl_c` shutdown).
pub fn serve() -> std::process::ExitCode {
    let rt = new_runtime();
    exit(rt.block_on(async move {
        let app = Arc::new(build_app().await?);
        tracing::info!("sunnycored starting background sync engine");

        let queue = Arc::new(PipelineQueue::new(Arc::clone(&app)));
        let scheduler_app = Arc::clone(&app);
        let scheduler_queue = Arc::clone(&queue);
        let scheduler = Arc::clone(&app.scheduler);

        let timer_task = tokio::spawn(run_timer_loop(
            Arc::clone(&scheduler),
            Duration::from_secs(60),
            move || {
                let app = Arc::clone(&scheduler_app);
                let queue = Arc::clone(&scheduler_queue);
                async move { run_scheduler_pass(&app, &queue).await }
            },
        ));

        let watch_store = Arc::clone(&app.store);
        let watch_adapters = Arc::clone(&app.adapters);
        let watch_alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
        let watch_handle = spawn_periodic(
            watch_store,
            watch_adapters,
            watch_alerts,
            Duration::from_secs(app.settings.watch_scan_interval_hours.max(1) as u64 * 3600),
            app.settings.watch_renewal_lookahead_hours,
        );

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| CliError::Internal(anyhow::anyhow!(e)))?;

        tracing::info!("shutting down");
        app.scheduler.shutdown();
        watch_handle.stop();
        let _ = timer_task.await;

        Ok(())
    }))
}

/// One coarse-grained sweep: for every known user and source, consults
/// the Scheduler and runs a Poller tick when due (§4.9, §4.10's "smart
/// polling" no-op rule).
async fn run_scheduler_pass(app: &DaemonApp, queue: &PipelineQueue<sunnycore_core::classify::OpenAiChatModel>) {
    let users = match app.store.list_all_users().await {
        Ok(users) => users,
        Err(e) => {
            tracing::error!(error = %e, "failed to list users for scheduler pass");
            return;
        }
    };

    for user in users {
        if !user.active {
            continue;
        }
        for source in ALL_SOURCES {
            let Some(adapter) = app.adapter_for(source) else {
                continue;
            };

            let now = Utc::now();
            let decision = match app.scheduler.tick(&*app.store, user.id, source, now).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(owner_id = %user.id, %source, error = %e, "scheduler tick failed");
                    continue;
                }
            };

            if decision != TickDecision::Due {
                continue;
            }

            let poller = Poller::new(&*app.store, queue);
            let tick_result = poller.tick(user.id, adapter).await;
            let (items_changed, virtual_mail_activity) = match &tick_result {
                Ok(outcome) => (outcome.enqueued as u64, outcome.virtual_mail_activity),
                Err(e) => {
                    tracing::warn!(owner_id = %user.id, %source, error = %e, "poll tick failed, cursor left untouched");
                    (0, false)
                }
            };

            if let Err(e) = app
                .scheduler
                .record_poll_outcome(
                    &*app.store,
                    user.id,
                    source,
                    items_changed,
                    virtual_mail_activity,
                    now,
                )
                .await
            {
                tracing::error!(owner_id = %user.id, %source, error = %e, "failed to record poll outcome");
            }
        }
    }
}
