//! Bounded queue for outbound model loads.
//!
//! Jobs start in submission order and at most `capacity` run at once. Each job
//! holds an in-flight token for its deployment, so the same deployment cannot
//! be dispatched twice while a load is queued or running.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::core::error::{FleetError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;
type Inflight = Arc<Mutex<HashSet<i64>>>;

struct Queued {
    token: InflightToken,
    job: Job,
}

/// Released when dropped, including when a job panics.
struct InflightToken {
    key: i64,
    inflight: Inflight,
}

impl Drop for InflightToken {
    fn drop(&mut self) {
        if let Ok(mut set) = self.inflight.lock() { set.remove(&self.key); }
    }
}

pub struct LoadQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    inflight: Inflight,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

/// Claim on a deployment, obtained before its state changes and turned into
/// a queued job by `submit`. Dropping it gives the claim back.
pub struct Reservation<'a> {
    queue: &'a LoadQueue,
    token: InflightToken,
}

impl Reservation<'_> {
    pub fn submit(self, job: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let key = self.token.key;
        let guard = self.queue.tx.lock().map_err(|_| anyhow::anyhow!("load queue lock poisoned"))?;
        let tx = guard.as_ref().ok_or_else(|| anyhow::anyhow!("load queue is shut down"))?;
        tx.send(Queued { token: self.token, job: Box::pin(job) })
            .map_err(|_| anyhow::anyhow!("load queue is shut down"))?;
        debug!(event = "LOAD_JOB_QUEUED", deploy.id = key, "Load job queued");
        Ok(())
    }
}

impl LoadQueue {
    /// Spawns the dispatcher. Must be called inside a tokio runtime.
    pub fn start(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(rx, Arc::new(Semaphore::new(capacity))));
        info!(event = "LOAD_QUEUE_STARTED", workers = capacity, "Load dispatch queue running");
        Self {
            tx: Mutex::new(Some(tx)),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reserve(&self, key: i64) -> Result<Reservation<'_>> {
        let mut set = self.inflight.lock().map_err(|_| anyhow::anyhow!("in-flight set poisoned"))?;
        if !set.insert(key) {
            return Err(FleetError::Conflict(format!("a load for deploy {} is already in progress", key)));
        }
        Ok(Reservation { queue: self, token: InflightToken { key, inflight: self.inflight.clone() } })
    }

    #[cfg(test)]
    pub fn is_inflight(&self, key: i64) -> bool {
        self.inflight.lock().map(|s| s.contains(&key)).unwrap_or(false)
    }

    /// Stops accepting jobs and waits for queued and running ones to finish.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() { tx.take(); }
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(event = "LOAD_QUEUE_DISPATCHER_FAILED", error = %e, "Dispatcher ended abnormally");
            }
        }
        info!(event = "LOAD_QUEUE_DRAINED", "Load dispatch queue drained");
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Queued>, permits: Arc<Semaphore>) {
    let mut running = JoinSet::new();
    while let Some(Queued { token, job }) = rx.recv().await {
        // Fair semaphore: waiting here keeps FIFO start order.
        let Ok(permit) = permits.clone().acquire_owned().await else { break };
        while let Some(done) = running.try_join_next() {
            if let Err(e) = done { warn!(event = "LOAD_JOB_PANICKED", error = %e, "Load job aborted"); }
        }
        running.spawn(async move {
            job.await;
            drop(token);
            drop(permit);
        });
    }
    while let Some(done) = running.join_next().await {
        if let Err(e) = done { warn!(event = "LOAD_JOB_PANICKED", error = %e, "Load job aborted"); }
    }
}
