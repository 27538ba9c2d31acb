use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::proxy::backend::Backend;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// The set of backends serving one route, plus the background loop that
/// probes them. The backend slice is fixed at construction; the loop is
/// started once and stopped once.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    interval: Duration,
    check_timeout: Duration,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl BackendPool {
    pub fn new(backends: Vec<Arc<Backend>>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            backends,
            interval,
            check_timeout: CHECK_TIMEOUT,
            started: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        }
    }

    /// Runs the first health round before returning, so routing decisions
    /// made right after startup reflect real backend state, then spawns
    /// the periodic loop.
    pub async fn start(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("health-check loop already started for this pool");
            return;
        }

        self.check_all_backends().await;

        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately and the initial round
            // already ran; consume it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("health-check loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.check_all_backends().await;
                    }
                }
            }
        });
    }

    /// Signals the health loop to terminate. Idempotent; the loop cannot
    /// be restarted afterwards.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Probes every backend concurrently and waits for all probes to
    /// settle before returning.
    async fn check_all_backends(&self) {
        let mut probes = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let timeout = self.check_timeout;
            probes.push(tokio::spawn(async move {
                check_backend(&backend, timeout).await;
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }
    }

    pub fn healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|backend| backend.is_healthy())
            .cloned()
            .collect()
    }

    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }
}

/// One probe attempt: `GET {backend}/health` under the per-check
/// deadline. Only a 200 counts as success; any other status, transport
/// error, or timeout is one failure.
async fn check_backend(backend: &Backend, check_timeout: Duration) {
    let probe = backend.probe_client().get(backend.health_url()).send();

    match time::timeout(check_timeout, probe).await {
        Ok(Ok(response)) if response.status() == reqwest::StatusCode::OK => {
            backend.mark_healthy();
        }
        Ok(Ok(response)) => {
            warn!(
                "health check failed for {}: status {}",
                backend.url(),
                response.status()
            );
            backend.mark_unhealthy();
        }
        Ok(Err(error)) => {
            warn!("health check failed for {}: {}", backend.url(), error);
            backend.mark_unhealthy();
        }
        Err(_) => {
            warn!("health check timed out for {}", backend.url());
            backend.mark_unhealthy();
        }
    }
}
