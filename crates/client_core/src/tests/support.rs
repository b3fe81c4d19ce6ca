//! In-memory `SyncBackend` driven step by step from tests.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use shared::protocol::{EventLevel, LastRunSummary, StatusSnapshot, SyncEvent, TriggerResponse};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{error::ClientError, EventStream, SyncBackend};

pub type EventFeed = mpsc::UnboundedSender<Result<SyncEvent, ClientError>>;

pub enum StatusReply {
    Ready(StatusSnapshot),
    Delayed(Duration, StatusSnapshot),
    Fail,
}

#[derive(Default)]
pub struct ScriptedBackend {
    statuses: Mutex<VecDeque<StatusReply>>,
    pub status_calls: AtomicUsize,
    last_run: Mutex<Option<LastRunSummary>>,
    last_run_gate: Mutex<Option<oneshot::Receiver<()>>>,
    trigger_reply: Mutex<Option<Result<TriggerResponse, StatusCode>>>,
    pub trigger_calls: Mutex<Vec<Option<String>>>,
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<SyncEvent, ClientError>>>>,
    pub stream_opens: AtomicUsize,
}

impl ScriptedBackend {
    pub fn push_status(&self, reply: StatusReply) {
        self.statuses.lock().expect("statuses").push_back(reply);
    }

    pub fn set_last_run(&self, summary: LastRunSummary) {
        *self.last_run.lock().expect("last run") = Some(summary);
    }

    /// Holds the last-run response until the returned sender fires.
    pub fn gate_last_run(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.last_run_gate.lock().expect("gate") = Some(rx);
        tx
    }

    pub fn set_trigger_reply(&self, reply: Result<TriggerResponse, StatusCode>) {
        *self.trigger_reply.lock().expect("trigger") = Some(reply);
    }

    /// Queues a stream for the next `open_event_stream` call.
    pub fn add_feed(&self) -> EventFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().expect("feeds").push_back(rx);
        tx
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }
}

fn unavailable(what: &str) -> ClientError {
    ClientError::Status {
        url: format!("scripted://{what}"),
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "scripted failure".into(),
    }
}

#[async_trait]
impl SyncBackend for ScriptedBackend {
    async fn fetch_status(&self) -> Result<StatusSnapshot, ClientError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.statuses.lock().expect("statuses").pop_front();
        match reply {
            Some(StatusReply::Ready(snapshot)) => Ok(snapshot),
            Some(StatusReply::Delayed(delay, snapshot)) => {
                tokio::time::sleep(delay).await;
                Ok(snapshot)
            }
            Some(StatusReply::Fail) | None => Err(unavailable("status")),
        }
    }

    async fn fetch_last_run(&self) -> Result<LastRunSummary, ClientError> {
        let gate = self.last_run_gate.lock().expect("gate").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let summary = self.last_run.lock().expect("last run").clone();
        summary.ok_or_else(|| unavailable("last-run"))
    }

    async fn trigger_sync(&self, town: Option<&str>) -> Result<TriggerResponse, ClientError> {
        self.trigger_calls
            .lock()
            .expect("trigger calls")
            .push(town.map(str::to_owned));
        let reply = self.trigger_reply.lock().expect("trigger").clone();
        match reply {
            Some(Ok(response)) => Ok(response),
            Some(Err(status)) => Err(ClientError::TriggerRejected {
                status,
                message: "sync already running".into(),
            }),
            None => Err(unavailable("trigger")),
        }
    }

    async fn open_event_stream(&self) -> Result<EventStream, ClientError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let feed = self.feeds.lock().expect("feeds").pop_front();
        match feed {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(unavailable("events")),
        }
    }
}

pub fn sync_event(n: usize) -> SyncEvent {
    SyncEvent {
        timestamp: Utc
            .timestamp_opt(1_714_550_400 + n as i64, 0)
            .single()
            .expect("timestamp"),
        level: EventLevel::Info,
        message: format!("event {n}"),
        town: Some("trnava".into()),
        season: None,
        phase: Some("meetings".into()),
    }
}

pub fn snapshot(running: bool, processed: u64) -> StatusSnapshot {
    StatusSnapshot {
        running,
        current_town: running.then(|| "trnava".to_owned()),
        current_season: None,
        current_phase: running.then(|| "polls".to_owned()),
        total_meetings: 10,
        processed_meetings: processed,
        started_at: None,
        last_completed_at: None,
    }
}

pub fn messages(events: &[SyncEvent]) -> Vec<String> {
    events.iter().map(|event| event.message.clone()).collect()
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}
