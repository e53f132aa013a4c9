use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StageError;

pub type FlightResult = Result<(), Arc<StageError>>;
pub type Flight = Shared<BoxFuture<'static, FlightResult>>;

/// Registry of in-flight builds keyed by volume id.
///
/// The first caller for a key spawns the build; later callers get the same
/// shared handle until the build finishes and removes itself. The build runs
/// as its own task, so dropping or timing out a handle never stops it.
#[derive(Clone, Default)]
pub struct StagingFlights {
    inflight: Arc<Mutex<HashMap<String, Flight>>>,
}

impl StagingFlights {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join<F, Fut>(&self, key: &str, build: F) -> Flight
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().await;
        if let Some(flight) = inflight.get(key) {
            debug!("joining in-flight staging of {key}");
            return flight.clone();
        }

        let registry = self.inflight.clone();
        let owned_key = key.to_string();
        let work = build();
        let handle = tokio::spawn(async move {
            let result = work.await;
            registry.lock().await.remove(&owned_key);
            result
        });
        let flight = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(Arc::new(StageError::Aborted(e.to_string()))))
        }
        .boxed()
        .shared();

        inflight.insert(key.to_string(), flight.clone());
        flight
    }

    pub async fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.lock().await.contains_key(key)
    }
}
