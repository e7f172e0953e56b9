//! Background ticks — the expiry sweep and the watched-service poll.
//!
//! A `Ticker` owns one spawned loop and its shutdown signal. `stop`
//! signals the loop and waits for it to exit, aborting it if a tick is
//! still running after `STOP_GRACE`, so once it returns no further tick
//! can fire.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use waypost_core::{DiscoveryError, DiscoveryResult};

use crate::backend::DiscoveryBackend;
use crate::cache::RemoteCache;
use crate::registry::LocalRegistry;

/// How long `Ticker::stop` waits for an in-flight tick before aborting it.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

pub struct Ticker {
    name: &'static str,
    /// Handle to the background loop.
    handle: JoinHandle<()>,
    /// Shutdown signal for the loop.
    shutdown_tx: watch::Sender<bool>,
}

impl Ticker {
    /// Run `tick` every `period` until stopped. The first tick fires one
    /// period after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move {
            debug!(ticker = name, ?period, "ticker starting");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        // A stop requested while sleeping wins over the tick.
                        if *shutdown.borrow() {
                            break;
                        }
                        tick().await;
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }
            debug!(ticker = name, "ticker shutting down");
        });

        info!(ticker = name, ?period, "ticker started");
        Self {
            name,
            handle,
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let mut handle = self.handle;
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!(ticker = self.name, grace = ?STOP_GRACE, "tick still running, aborting");
            handle.abort();
            let _ = handle.await;
        }
        info!(ticker = self.name, "ticker stopped");
    }
}

/// Periodically remove expired local registrations.
///
/// When a backend is given, expired ids are also removed from it and
/// from the remote cache. Each backend removal is bounded by
/// `mirror_timeout`; local expiry never waits on the backend.
pub fn spawn_sweeper(
    registry: LocalRegistry,
    mirror: Option<(RemoteCache, Arc<dyn DiscoveryBackend>)>,
    period: Duration,
    mirror_timeout: Duration,
) -> Ticker {
    Ticker::spawn("expiry-sweep", period, move || {
        let registry = registry.clone();
        let mirror = mirror.clone();
        async move {
            let expired = registry.sweep_expired(registry.clock().now_millis());
            if expired.is_empty() {
                return;
            }
            debug!(count = expired.len(), "sweep removed expired endpoints");
            if let Some((cache, backend)) = mirror {
                for id in &expired {
                    cache.forget(id);
                    mirror_with_timeout("remove", id, mirror_timeout, backend.remove(id)).await;
                }
            }
        }
    })
}

/// Periodically refresh every watched service from the backend, each
/// pull bounded by `fetch_timeout`.
pub fn spawn_poller(
    cache: RemoteCache,
    backend: Arc<dyn DiscoveryBackend>,
    period: Duration,
    fetch_timeout: Duration,
) -> Ticker {
    Ticker::spawn("watch-poll", period, move || {
        let cache = cache.clone();
        let backend = backend.clone();
        async move {
            let refreshed = cache.refresh_watched(backend.as_ref(), fetch_timeout).await;
            debug!(refreshed, "watched services polled");
        }
    })
}

/// Run a backend mirror call bounded by `timeout`, logging any failure.
pub(crate) async fn mirror_with_timeout<F>(op: &str, service_id: &str, timeout: Duration, call: F)
where
    F: Future<Output = DiscoveryResult<()>>,
{
    let result = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::BackendTimeout {
            service: service_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    };
    if let Err(e) = result {
        warn!(%service_id, op, error = %e, "backend mirror failed");
    }
}
