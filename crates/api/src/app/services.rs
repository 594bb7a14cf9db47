use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use jobctl_infra::{ControlConfig, ControlPlane, InMemoryJobStore, JobStore, PostgresJobStore, StoreError};

/// Build the control plane the API serves.
///
/// `USE_PERSISTENT_STORES=true` (or `1`) with `DATABASE_URL` selects the
/// Postgres store; anything else runs in memory.
pub async fn build_plane(config: ControlConfig) -> Result<ControlPlane, StoreError> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let store: Arc<dyn JobStore> = if use_persistent {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| {
            StoreError::Unavailable("USE_PERSISTENT_STORES is set but DATABASE_URL is not".to_string())
        })?;
        tracing::info!("using postgres job store");
        Arc::new(PostgresJobStore::connect(&database_url).await?)
    } else {
        tracing::info!("using in-memory job store");
        InMemoryJobStore::arc()
    };

    Ok(ControlPlane::with_store(config, store))
}

/// Server-sent stream of the active job list, re-read every poll interval.
///
/// Each event is `event: active_jobs` with the JSON array of summaries. A
/// failed read is reported as an `error` event and the stream keeps going.
pub fn active_jobs_sse_stream(
    plane: Arc<ControlPlane>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(4);
    let period = plane.config().poll_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let event = match plane.monitor().list_active() {
                Ok(jobs) => {
                    let data = serde_json::to_string(&jobs).unwrap_or_else(|_| "[]".to_string());
                    SseEvent::default().event("active_jobs").data(data)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "active job stream read failed");
                    SseEvent::default().event("error").data(e.to_string())
                }
            };
            // Receiver gone: client disconnected.
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
