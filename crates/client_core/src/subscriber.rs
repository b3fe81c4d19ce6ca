use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use shared::protocol::SyncEvent;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{error::ClientError, SyncBackend};

#[derive(Default)]
struct Connection {
    generation: u64,
    live: bool,
    handle: Option<JoinHandle<()>>,
}

/// Holds at most one live event-stream connection and forwards its events,
/// in server order, to the handler registered by `open`.
pub struct EventSubscriber {
    backend: Arc<dyn SyncBackend>,
    connection: Arc<Mutex<Connection>>,
}

impl EventSubscriber {
    pub fn new(backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            backend,
            connection: Arc::new(Mutex::new(Connection::default())),
        }
    }

    /// Starts the connection task unless one is already live. Returns whether
    /// a new connection was started.
    ///
    /// `on_closed` runs once when the stream ends on its own (server closed it,
    /// transport failure, or the connect attempt failed). It does not run after
    /// `close`.
    pub fn open<F, C>(&self, on_event: F, on_closed: C) -> bool
    where
        F: FnMut(SyncEvent) + Send + 'static,
        C: FnOnce(Option<ClientError>) + Send + 'static,
    {
        let mut connection = lock(&self.connection);
        if connection.live {
            debug!("sync event stream already open");
            return false;
        }

        connection.generation += 1;
        connection.live = true;
        let generation = connection.generation;
        let backend = Arc::clone(&self.backend);
        let slot = Arc::clone(&self.connection);
        connection.handle = Some(tokio::spawn(async move {
            let reason = pump(backend, on_event).await;
            {
                let mut connection = lock(&slot);
                if connection.generation == generation {
                    connection.live = false;
                    connection.handle = None;
                }
            }
            on_closed(reason);
        }));
        true
    }

    pub fn close(&self) {
        let mut connection = lock(&self.connection);
        let was_live = connection.live;
        connection.live = false;
        connection.generation += 1;
        if let Some(handle) = connection.handle.take() {
            handle.abort();
        }
        if was_live {
            info!("sync event stream closed");
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.connection).live
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump<F>(backend: Arc<dyn SyncBackend>, mut on_event: F) -> Option<ClientError>
where
    F: FnMut(SyncEvent),
{
    let mut stream = match backend.open_event_stream().await {
        Ok(stream) => stream,
        Err(err) => return Some(err),
    };
    info!("sync event stream connected");

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => on_event(event),
            Err(err) if err.is_decode() => {
                warn!(error = %err, "skipping undecodable sync event");
            }
            Err(err) => return Some(err),
        }
    }
    None
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
