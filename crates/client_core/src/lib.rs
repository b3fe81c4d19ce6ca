//! Client side of the council data backend: typed API calls plus the
//! coordinator that keeps an observed view of the server's import job.

use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::protocol::{LastRunSummary, StatusSnapshot, SyncEvent, TriggerResponse};

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod sse;
pub mod subscriber;

pub use api::ApiClient;
pub use config::{load_settings, ClientSettings};
pub use coordinator::{
    CoordinatorConfig, CoordinatorState, CoordinatorUpdate, RunState, SyncCoordinator,
};
pub use error::ClientError;
pub use event_log::{EventLog, EventLogLimits};
pub use subscriber::EventSubscriber;

/// Live sync events in the order the server emitted them.
pub type EventStream = BoxStream<'static, Result<SyncEvent, ClientError>>;

/// The four sync endpoints the coordinator observes and drives.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn fetch_status(&self) -> Result<StatusSnapshot, ClientError>;
    async fn fetch_last_run(&self) -> Result<LastRunSummary, ClientError>;
    async fn trigger_sync(&self, town: Option<&str>) -> Result<TriggerResponse, ClientError>;
    async fn open_event_stream(&self) -> Result<EventStream, ClientError>;
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod api_tests;

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod coordinator_tests;

#[cfg(test)]
#[path = "tests/subscriber_tests.rs"]
mod subscriber_tests;
