use std::sync::RwLock;
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{info, warn};
use url::Url;

/// Consecutive probe failures before a backend is taken out of rotation.
pub const MAX_FAILS: u32 = 3;

const PROBE_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

/// One upstream endpoint. Health fields are written only by the pool's
/// health-check routine and read by every request going through the
/// balancer, so they sit behind a read-write lock.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    health_url: String,
    weight: u32,
    state: RwLock<HealthState>,
    probe_client: Client,
}

#[derive(Debug)]
struct HealthState {
    healthy: bool,
    fail_count: u32,
    last_check: Option<Instant>,
}

impl Backend {
    /// Parses the backend address. Weights below 1 are normalized to 1.
    pub fn new(url: &str, weight: i32) -> Result<Self, BackendError> {
        let parsed = Url::parse(url).map_err(|source| BackendError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        Ok(Self {
            health_url: format!("{}/health", parsed.as_str().trim_end_matches('/')),
            url: parsed,
            weight: weight.max(1) as u32,
            state: RwLock::new(HealthState {
                healthy: true,
                fail_count: 0,
                last_check: None,
            }),
            probe_client: Client::builder()
                .timeout(PROBE_CLIENT_TIMEOUT)
                .build()
                .expect("failed to build health-probe client"),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().map(|state| state.healthy).unwrap_or(false)
    }

    pub fn fail_count(&self) -> u32 {
        self.state.read().map(|state| state.fail_count).unwrap_or(0)
    }

    pub fn last_check(&self) -> Option<Instant> {
        self.state.read().ok().and_then(|state| state.last_check)
    }

    pub(crate) fn probe_client(&self) -> &Client {
        &self.probe_client
    }

    /// Records a successful probe. Resets the failure counter and logs a
    /// recovery line when the backend had failures on record.
    pub(crate) fn mark_healthy(&self) {
        if let Ok(mut state) = self.state.write() {
            if state.fail_count > 0 {
                info!("backend {} recovered", self.url);
            }
            state.healthy = true;
            state.fail_count = 0;
            state.last_check = Some(Instant::now());
        }
    }

    /// Records a failed probe. The backend leaves rotation once the
    /// failure counter reaches the threshold.
    pub(crate) fn mark_unhealthy(&self) {
        if let Ok(mut state) = self.state.write() {
            state.fail_count += 1;
            if state.fail_count >= MAX_FAILS {
                if state.healthy {
                    warn!(
                        "backend {} marked unhealthy after {} failures",
                        self.url, state.fail_count
                    );
                }
                state.healthy = false;
            }
            state.last_check = Some(Instant::now());
        }
    }
}
