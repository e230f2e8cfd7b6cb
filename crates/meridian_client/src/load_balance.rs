//! Replica selection for storage reads and proxy RPCs.
//!
//! For storage operations the balancer prefers replicas whose endpoint is
//! not failed and whose in-flight queue is shortest, breaking ties at
//! random. A replica failing with a transport-class error is marked failed
//! and the next candidate is tried; once every alternative is exhausted the
//! caller sees `AllAlternativesFailed`. Successful reads against a server
//! with an installed shadow pairing are duplicated for verification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::collections::HashMap;

use meridian_rpc::error::{Error, Result};
use meridian_rpc::interface::{EndpointToken, LocationInfo};
use meridian_rpc::transport::StorageRequest;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::database::DatabaseInner;
use crate::tss;

/// Per-endpoint in-flight request depth.
#[derive(Default)]
pub struct QueueModel {
    inner: RwLock<HashMap<EndpointToken, Arc<AtomicUsize>>>,
}

impl QueueModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn depth_handle(&self, endpoint: EndpointToken) -> Arc<AtomicUsize> {
        if let Some(d) = self.inner.read().unwrap().get(&endpoint) {
            return d.clone();
        }
        self.inner
            .write()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .clone()
    }

    pub fn depth(&self, endpoint: EndpointToken) -> usize {
        self.inner
            .read()
            .unwrap()
            .get(&endpoint)
            .map_or(0, |d| d.load(Ordering::Relaxed))
    }
}

/// RAII in-flight marker.
struct InflightGuard {
    depth: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn enter(model: &QueueModel, endpoint: EndpointToken) -> Self {
        let depth = model.depth_handle(endpoint);
        depth.fetch_add(1, Ordering::Relaxed);
        Self { depth }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Issue `req` against the best replica in `location`.
pub(crate) async fn load_balance<R: StorageRequest>(
    db: &Arc<DatabaseInner>,
    location: &Arc<LocationInfo>,
    req: R,
) -> Result<R::Reply> {
    if location.servers.is_empty() {
        return Err(Error::AllAlternativesFailed);
    }

    // Order candidates: healthy before failed, then by queue depth, with a
    // random factor so equally-loaded replicas share traffic.
    let mut order: Vec<usize> = (0..location.servers.len()).collect();
    {
        let mut rng = rand::thread_rng();
        order.shuffle(&mut rng);
    }
    order.sort_by_key(|&i| {
        let endpoint = R::endpoint(&location.servers[i]);
        let failed = db.failure_monitor.is_failed(endpoint);
        (failed, db.queue_model.depth(endpoint))
    });

    for i in order {
        let server = &location.servers[i];
        let endpoint = R::endpoint(server);
        let reply = {
            let _guard = InflightGuard::enter(&db.queue_model, endpoint);
            R::send(db.storage.as_ref(), server, req.clone()).await
        };
        match reply {
            Ok(reply) => {
                db.failure_monitor.set_ok(endpoint);
                tss::maybe_duplicate(db, server, &req, &reply);
                return Ok(reply);
            }
            Err(e) if e.rotates_replica() => {
                debug!(server = server.id, error = %e, "replica degraded, rotating");
                db.failure_monitor.set_failed(endpoint);
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::AllAlternativesFailed)
}

/// Round-robin-with-random-start balancer for proxy RPCs, where there is no
/// per-endpoint queue model and any healthy proxy will do.
pub(crate) async fn basic_load_balance<'a, P, T, F, Fut>(alternatives: &'a [P], call: F) -> Result<T>
where
    F: Fn(&'a P) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + 'a,
{
    if alternatives.is_empty() {
        return Err(Error::AllAlternativesFailed);
    }
    let start = rand::thread_rng().gen_range(0..alternatives.len());
    for step in 0..alternatives.len() {
        let proxy = &alternatives[(start + step) % alternatives.len()];
        match call(proxy).await {
            Ok(reply) => return Ok(reply),
            Err(e) if e.rotates_replica() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::AllAlternativesFailed)
}
