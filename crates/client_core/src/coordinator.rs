//! Observed view of the server-side import job.
//!
//! A [`SyncCoordinator`] is constructed explicitly and initialized once per
//! session. It merges three asynchronous sources into one state: the status
//! poll timer, the live event stream and the one-shot last-run / trigger
//! calls. All state sits behind a single mutex that is never held across an
//! await point, so each mutation is applied as one indivisible step.
//!
//! Observational failures (status and last-run fetches, stream drops) are
//! logged and absorbed, leaving the previous state in place. Only
//! [`SyncCoordinator::trigger_sync`] returns an error to the caller.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use shared::protocol::{LastRunSummary, StatusSnapshot, SyncEvent, TriggerResponse};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    event_log::{AppendOutcome, EventLog, EventLogLimits},
    subscriber::{lock, EventSubscriber},
    SyncBackend,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub event_log_limits: EventLogLimits,
    /// Reopen the event stream this long after it ends. `None` leaves it closed.
    pub stream_reconnect_delay: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_log_limits: EventLogLimits::default(),
            stream_reconnect_delay: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No snapshot has been fetched yet.
    Unknown,
    Idle,
    Running,
}

/// Read-only copy of everything the coordinator has observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorState {
    pub status: Option<StatusSnapshot>,
    pub events: Vec<SyncEvent>,
    pub last_run: Option<LastRunSummary>,
    pub is_running: bool,
}

#[derive(Debug, Clone)]
pub enum CoordinatorUpdate {
    StatusChanged(StatusSnapshot),
    EventAppended(SyncEvent),
    EventLogTruncated { dropped: usize, retained: usize },
    EventLogCleared,
    EventLogSeeded { count: usize },
    LastRunLoaded(LastRunSummary),
    StreamClosed { reason: Option<String> },
}

struct CoordinatorInner {
    initialized: bool,
    torn_down: bool,
    status: Option<StatusSnapshot>,
    status_revision: u64,
    log: EventLog,
    /// Set once a live event or a trigger has shaped the log; history may no longer seed it.
    log_claimed: bool,
    last_run: Option<LastRunSummary>,
    poll_task: Option<JoinHandle<()>>,
}

pub struct SyncCoordinator {
    backend: Arc<dyn SyncBackend>,
    subscriber: EventSubscriber,
    config: CoordinatorConfig,
    inner: Mutex<CoordinatorInner>,
    updates: broadcast::Sender<CoordinatorUpdate>,
}

impl SyncCoordinator {
    pub fn new(backend: Arc<dyn SyncBackend>, config: CoordinatorConfig) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            subscriber: EventSubscriber::new(Arc::clone(&backend)),
            backend,
            inner: Mutex::new(CoordinatorInner {
                initialized: false,
                torn_down: false,
                status: None,
                status_revision: 0,
                log: EventLog::new(config.event_log_limits),
                log_claimed: false,
                last_run: None,
                poll_task: None,
            }),
            config,
            updates,
        })
    }

    /// Opens the event stream, starts polling and loads the last-run summary.
    ///
    /// Only the first call does anything; later calls (and calls after
    /// [`shutdown`](Self::shutdown)) return immediately.
    pub async fn initialize(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.initialized || inner.torn_down {
                debug!("sync coordinator already initialized");
                return;
            }
            inner.initialized = true;
        }
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "initializing sync coordinator"
        );

        self.open_event_stream();
        self.start_polling();

        // Runs on its own task so a caller dropping this future does not lose the load.
        let load = tokio::spawn({
            let backend = Arc::clone(&self.backend);
            let coordinator = Arc::downgrade(self);
            async move {
                let result = backend.fetch_last_run().await;
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.finish_last_run(result);
                }
            }
        });
        if let Err(err) = load.await {
            warn!(error = %err, "last-run load task failed");
        }
    }

    /// Fetches one status snapshot and stores it if the fetch succeeded.
    pub async fn poll(&self) {
        match self.backend.fetch_status().await {
            Ok(snapshot) => self.apply_status(snapshot),
            Err(err) if err.is_transient() => {
                debug!(error = %err, "status poll failed; keeping previous snapshot");
            }
            Err(err) => {
                warn!(error = %err, "status poll failed; keeping previous snapshot");
            }
        }
    }

    /// Starts the recurring poll, polling once right away. Returns `false` if
    /// it was already running or the coordinator has been shut down.
    ///
    /// A tick that arrives while this timer's previous poll is still running
    /// is skipped.
    pub fn start_polling(self: &Arc<Self>) -> bool {
        let mut inner = self.lock();
        if inner.torn_down {
            return false;
        }
        if inner
            .poll_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return false;
        }

        let period = self.config.poll_interval.max(MIN_POLL_INTERVAL);
        let coordinator = Arc::downgrade(self);
        let in_flight = Arc::new(AtomicBool::new(false));
        inner.poll_task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if in_flight.swap(true, Ordering::AcqRel) {
                    debug!("previous status poll still running; skipping tick");
                    continue;
                }
                // Each poll runs on its own so stopping the timer never cancels one in flight.
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    coordinator.poll().await;
                    in_flight.store(false, Ordering::Release);
                });
            }
        }));
        debug!("status polling started");
        true
    }

    /// Cancels future polls. Returns whether a timer was running.
    pub fn stop_polling(&self) -> bool {
        let task = self.lock().poll_task.take();
        match task {
            Some(task) => {
                task.abort();
                debug!("status polling stopped");
                true
            }
            None => false,
        }
    }

    /// Asks the server to start a sync, optionally for a single town.
    ///
    /// On acceptance the event log is emptied, since only the new run's live
    /// events are relevant from here on, and the status is polled once before
    /// returning. On rejection nothing changes and the error is returned.
    pub async fn trigger_sync(&self, town: Option<&str>) -> Result<TriggerResponse, ClientError> {
        let response = match self.backend.trigger_sync(town).await {
            Ok(response) => response,
            Err(err) => {
                warn!(town = town.unwrap_or("all"), error = %err, "sync trigger failed");
                return Err(err);
            }
        };
        info!(
            town = town.unwrap_or("all"),
            status = %response.status,
            message = %response.message,
            "sync trigger accepted"
        );

        {
            let mut inner = self.lock();
            if !inner.torn_down {
                inner.log.clear();
                inner.log_claimed = true;
                let _ = self.updates.send(CoordinatorUpdate::EventLogCleared);
            }
        }
        self.poll().await;
        Ok(response)
    }

    /// Stops polling, closes the event stream and discards anything that
    /// completes afterwards. Safe to call more than once.
    pub fn shutdown(&self) {
        let task = {
            let mut inner = self.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            inner.poll_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.subscriber.close();
        info!("sync coordinator shut down");
    }

    pub fn state(&self) -> CoordinatorState {
        let inner = self.lock();
        CoordinatorState {
            status: inner.status.clone(),
            events: inner.log.to_vec(),
            last_run: inner.last_run.clone(),
            is_running: inner.status.as_ref().is_some_and(|status| status.running),
        }
    }

    pub fn status(&self) -> Option<StatusSnapshot> {
        self.lock().status.clone()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.lock().log.to_vec()
    }

    pub fn last_run(&self) -> Option<LastRunSummary> {
        self.lock().last_run.clone()
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    pub fn run_state(&self) -> RunState {
        match self.lock().status.as_ref() {
            None => RunState::Unknown,
            Some(status) if status.running => RunState::Running,
            Some(_) => RunState::Idle,
        }
    }

    /// Number of snapshots applied so far.
    pub fn status_revision(&self) -> u64 {
        self.lock().status_revision
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn is_polling(&self) -> bool {
        self.lock()
            .poll_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn is_stream_open(&self) -> bool {
        self.subscriber.is_open()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<CoordinatorUpdate> {
        self.updates.subscribe()
    }

    fn open_event_stream(self: &Arc<Self>) -> bool {
        let on_event = {
            let coordinator = Arc::downgrade(self);
            move |event: SyncEvent| {
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.apply_event(event);
                }
            }
        };
        let on_closed = {
            let coordinator = Arc::downgrade(self);
            move |reason: Option<ClientError>| {
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.handle_stream_closed(reason);
                }
            }
        };
        self.subscriber.open(on_event, on_closed)
    }

    fn finish_last_run(&self, result: Result<LastRunSummary, ClientError>) {
        match result {
            Ok(summary) => self.apply_last_run(summary),
            Err(err) => {
                debug!(error = %err, "last-run summary unavailable");
            }
        }
    }

    fn apply_status(&self, snapshot: StatusSnapshot) {
        let mut inner = self.lock();
        if inner.torn_down {
            debug!("discarding status snapshot that completed after shutdown");
            return;
        }

        let was_running = inner.status.as_ref().map(|status| status.running);
        match (was_running, snapshot.running) {
            (Some(false) | None, true) => info!(
                town = snapshot.current_town.as_deref().unwrap_or("-"),
                phase = snapshot.current_phase.as_deref().unwrap_or("-"),
                "sync job running"
            ),
            (Some(true), false) => info!("sync job finished"),
            _ => {}
        }

        inner.status = Some(snapshot.clone());
        inner.status_revision += 1;
        let _ = self.updates.send(CoordinatorUpdate::StatusChanged(snapshot));
    }

    fn apply_event(&self, event: SyncEvent) {
        let mut inner = self.lock();
        if inner.torn_down {
            return;
        }
        inner.log_claimed = true;
        let outcome = inner.log.push(event.clone());
        let _ = self.updates.send(CoordinatorUpdate::EventAppended(event));
        if let AppendOutcome::Truncated { dropped } = outcome {
            let retained = inner.log.len();
            debug!(dropped, retained, "event log truncated to recent tail");
            let _ = self
                .updates
                .send(CoordinatorUpdate::EventLogTruncated { dropped, retained });
        }
    }

    fn apply_last_run(&self, summary: LastRunSummary) {
        let mut inner = self.lock();
        if inner.torn_down {
            return;
        }

        if inner.log.is_empty() && !inner.log_claimed {
            let count = inner.log.seed(summary.events.iter().cloned());
            debug!(count, "event log seeded from last run");
            let _ = self.updates.send(CoordinatorUpdate::EventLogSeeded { count });
        } else {
            debug!("live events already present; last-run history not merged");
        }

        inner.last_run = Some(summary.clone());
        let _ = self.updates.send(CoordinatorUpdate::LastRunLoaded(summary));
    }

    fn handle_stream_closed(self: &Arc<Self>, reason: Option<ClientError>) {
        match &reason {
            Some(err) => warn!(error = %err, "sync event stream lost"),
            None => info!("sync event stream ended by server"),
        }

        if self.lock().torn_down {
            return;
        }
        let _ = self.updates.send(CoordinatorUpdate::StreamClosed {
            reason: reason.as_ref().map(ToString::to_string),
        });

        let Some(delay) = self.config.stream_reconnect_delay else {
            return;
        };
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            if coordinator.lock().torn_down {
                return;
            }
            if coordinator.open_event_stream() {
                info!(delay_ms = delay.as_millis() as u64, "reopening sync event stream");
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorInner> {
        lock(&self.inner)
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner).poll_task.take() {
            task.abort();
        }
    }
}
