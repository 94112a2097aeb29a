use crate::application::synchronizer::SyncService;
use crate::domain::series::{build_series, SeriesRange, TimeSeries};
use crate::infrastructure::config::TrackingConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::mirror::LedgerMirror;
use crate::infrastructure::store_client::LedgerStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SECONDS_PER_MINUTE: i64 = 60;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub tick_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(300),
        }
    }
}

impl TrackerConfig {
    pub fn from_tracking_config(config: &TrackingConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.tick_seconds.max(1)),
            flush_interval: Duration::from_secs(config.flush_seconds.max(1)),
        }
    }
}

struct RunningSession {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// While a session runs, a background task attributes elapsed whole minutes
// on every tick and flushes on a slower cadence. The session anchor
// advances by whole attributed minutes only; leftover seconds count toward
// the next tick.
pub struct SessionTracker<M, D>
where
    M: LedgerMirror + 'static,
    D: LedgerStore + 'static,
{
    sync: Arc<SyncService<M, D>>,
    config: TrackerConfig,
    session_started_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    running: Mutex<Option<RunningSession>>,
}

impl<M, D> SessionTracker<M, D>
where
    M: LedgerMirror + 'static,
    D: LedgerStore + 'static,
{
    pub fn new(sync: Arc<SyncService<M, D>>, config: TrackerConfig) -> Self {
        Self {
            sync,
            config,
            session_started_at: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        self.sync.user_id()
    }

    fn lock_anchor(
        anchor: &Mutex<Option<DateTime<Utc>>>,
    ) -> Result<MutexGuard<'_, Option<DateTime<Utc>>>, InfraError> {
        anchor
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("session lock poisoned: {error}")))
    }

    fn lock_running(&self) -> Result<MutexGuard<'_, Option<RunningSession>>, InfraError> {
        self.running
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("tracker lock poisoned: {error}")))
    }

    // Attributes the whole minutes elapsed since the anchor and advances
    // it past them. A clock that moved backwards attributes nothing and
    // re-anchors at the current time.
    fn settle_elapsed(
        sync: &SyncService<M, D>,
        anchor: &Mutex<Option<DateTime<Utc>>>,
    ) -> Result<u32, InfraError> {
        let now = sync.now();
        let minutes = {
            let mut started_at = Self::lock_anchor(anchor)?;
            let Some(start) = *started_at else {
                return Ok(0);
            };

            let elapsed_seconds = (now - start).num_seconds();
            if elapsed_seconds < 0 {
                log::warn!(
                    "session clock moved backwards by {}s for user {}; re-anchoring",
                    -elapsed_seconds,
                    sync.user_id()
                );
                *started_at = Some(now);
                return Ok(0);
            }

            let minutes = elapsed_seconds / SECONDS_PER_MINUTE;
            if minutes == 0 {
                return Ok(0);
            }
            *started_at =
                Some(start + ChronoDuration::seconds(minutes * SECONDS_PER_MINUTE));
            u32::try_from(minutes).unwrap_or(u32::MAX)
        };

        sync.attribute_minutes(minutes)?;
        Ok(minutes)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    pub fn start(&self) -> Result<(), InfraError> {
        let mut running = self.lock_running()?;
        if running.is_some() {
            return Ok(());
        }

        {
            let mut started_at = Self::lock_anchor(&self.session_started_at)?;
            *started_at = Some(self.sync.now());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sync = Arc::clone(&self.sync);
        let anchor = Arc::clone(&self.session_started_at);
        let tick_interval = self.config.tick_interval;
        let flush_interval = self.config.flush_interval;

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(tick_interval);
            let mut flush = tokio::time::interval(flush_interval);
            // The first interval tick fires immediately; consume both so
            // the cadence starts one period from now.
            tick.tick().await;
            flush.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(error) = Self::settle_elapsed(&sync, &anchor) {
                            log::warn!(
                                "minute attribution failed for user {}: {error}",
                                sync.user_id()
                            );
                        }
                    }
                    _ = flush.tick() => {
                        if let Err(error) = sync.flush().await {
                            log::warn!(
                                "ledger flush failed for user {}; deltas retained: {error}",
                                sync.user_id()
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *running = Some(RunningSession {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    // Joins the background task, settles the final partial interval, and
    // awaits one last flush. Stopping a stopped tracker is a no-op.
    pub async fn stop(&self) -> Result<(), InfraError> {
        let session = {
            let mut running = self.lock_running()?;
            running.take()
        };
        let Some(session) = session else {
            return Ok(());
        };

        let _ = session.shutdown.send(true);
        if let Err(error) = session.handle.await {
            log::warn!(
                "session task for user {} did not shut down cleanly: {error}",
                self.sync.user_id()
            );
        }

        // A failing mirror must not starve the durable store: log the
        // settle error and flush whatever deltas are pending anyway.
        if let Err(error) = Self::settle_elapsed(&self.sync, &self.session_started_at) {
            log::warn!(
                "final minute attribution failed for user {}: {error}",
                self.sync.user_id()
            );
        }
        if let Ok(mut started_at) = self.session_started_at.lock() {
            *started_at = None;
        }
        self.sync.flush().await
    }

    pub fn today_minutes(&self) -> Result<u32, InfraError> {
        self.sync.today_minutes()
    }

    pub fn week_minutes(&self) -> Result<u64, InfraError> {
        self.sync.week_minutes()
    }

    pub fn month_minutes(&self) -> Result<u64, InfraError> {
        self.sync.month_minutes()
    }

    pub fn build_series(&self, range: SeriesRange, offset: i32) -> Result<TimeSeries, InfraError> {
        let ledger = self.sync.snapshot()?;
        Ok(build_series(&ledger, range, offset, self.sync.now()))
    }
}
