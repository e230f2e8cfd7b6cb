//! Per-endpoint failure status.
//!
//! The load balancer consults this before dispatch and marks endpoints
//! failed when a replica stops answering. Recovery interest is served by a
//! single notifier: waiters re-check status after every wake-up.

use std::collections::HashSet;
use std::sync::RwLock;

use meridian_rpc::interface::EndpointToken;
use tokio::sync::Notify;

#[derive(Default)]
pub struct FailureMonitor {
    failed: RwLock<HashSet<EndpointToken>>,
    recovered: Notify,
}

impl FailureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_failed(&self, endpoint: EndpointToken) -> bool {
        self.failed.read().unwrap().contains(&endpoint)
    }

    pub fn set_failed(&self, endpoint: EndpointToken) {
        self.failed.write().unwrap().insert(endpoint);
    }

    /// Clear failure state; wakes anyone waiting for a recovery.
    pub fn set_ok(&self, endpoint: EndpointToken) {
        let removed = self.failed.write().unwrap().remove(&endpoint);
        if removed {
            self.recovered.notify_waiters();
        }
    }

    /// Forget all state for an endpoint that no longer exists (server
    /// migrated; its token changed).
    pub fn forget(&self, endpoint: EndpointToken) {
        self.failed.write().unwrap().remove(&endpoint);
    }

    /// Resolve once `endpoint` transitions to OK. Returns immediately if it
    /// is not currently failed.
    pub async fn on_ok(&self, endpoint: EndpointToken) {
        loop {
            let notified = self.recovered.notified();
            if !self.is_failed(endpoint) {
                return;
            }
            notified.await;
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.read().unwrap().len()
    }
}
