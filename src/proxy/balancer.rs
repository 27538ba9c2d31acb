use std::sync::{Arc, Mutex};

use crate::proxy::backend::Backend;
use crate::proxy::pool::BackendPool;

/// Cursor values are reduced modulo the virtual-list length on every
/// read, so the counter only needs resetting well before it can wrap.
const CURSOR_RESET_FACTOR: usize = 1000;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BalancerError {
    #[error("no healthy backends available")]
    NoHealthyBackend,

    #[error("poisoned balancer cursor")]
    PoisonedCursor,
}

#[cfg_attr(test, mockall::automock)]
pub trait LoadBalancer: Send + Sync {
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError>;
}

/// Weighted round-robin over the pool's healthy set. Each backend appears
/// `weight` consecutive times in a virtual list built in pool order; the
/// cursor walks that list one entry per selection.
pub struct RoundRobinBalancer {
    pool: Arc<BackendPool>,
    cursor: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool,
            cursor: Mutex::new(0),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut cursor) = self.cursor.lock() {
            *cursor = 0;
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| BalancerError::PoisonedCursor)?;

        let healthy = self.pool.healthy_backends();
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackend);
        }

        // When the healthy set changed since the last call the list is
        // simply rebuilt and the cursor reinterpreted modulo the new
        // length; fairness across topology changes is not preserved.
        let mut weighted: Vec<&Arc<Backend>> = Vec::new();
        for backend in &healthy {
            for _ in 0..backend.weight() {
                weighted.push(backend);
            }
        }

        let selected = Arc::clone(weighted[*cursor % weighted.len()]);
        *cursor += 1;

        if *cursor >= weighted.len() * CURSOR_RESET_FACTOR {
            *cursor = 0;
        }

        Ok(selected)
    }
}
