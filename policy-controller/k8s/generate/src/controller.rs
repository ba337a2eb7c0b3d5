use crate::{Disposition, Reconciler, Requests, Resources};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::lease::Claim;
use parking_lot::RwLock;
use polis_policy_controller_k8s_api::{GenerateRequest, GenerateRequestState, ResourceExt};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Identifies a generate request by namespace and name.
pub type Key = (String, String);

const BACKOFF_BASE: time::Duration = time::Duration::from_millis(500);
const BACKOFF_MAX: time::Duration = time::Duration::from_secs(60);

/// Tracks generate requests and queues them for reconciliation as they change.
///
/// A request is queued when it first appears, when its spec changes, or when a failed request is
/// revived. Status writes, including the reconciler's own, do not queue a request; periodic
/// resyncs pick up everything else.
pub struct Index {
    requests: HashMap<Key, Arc<GenerateRequest>>,
    queue: mpsc::UnboundedSender<Key>,
}

/// Reconciles queued requests, with at most one reconciliation in flight per request.
pub struct Controller<S, R> {
    reconciler: Arc<Reconciler<S, R>>,
    index: SharedIndex,
    claims: watch::Receiver<Arc<Claim>>,
    name: String,
    queue_rx: mpsc::UnboundedReceiver<Key>,
    resync: time::Duration,
}

/// The state of the work queue.
#[derive(Debug, Default)]
struct Queue {
    in_flight: HashSet<Key>,

    /// Requests that changed while being reconciled.
    dirty: HashSet<Key>,

    /// Requests waiting out a retry delay. They are not started until the delay elapses.
    backoff: HashSet<Key>,

    /// Failed attempts per request.
    attempts: HashMap<Key, u32>,
}

// === impl Index ===

impl Index {
    pub fn shared(queue: mpsc::UnboundedSender<Key>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            requests: HashMap::new(),
            queue,
        }))
    }

    pub fn get(&self, key: &Key) -> Option<Arc<GenerateRequest>> {
        self.requests.get(key).cloned()
    }

    /// Returns the requests that are still processed: pending and completed requests.
    pub fn active(&self) -> Vec<Key> {
        self.requests
            .iter()
            .filter(|(_, r)| r.state() != GenerateRequestState::Failed)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn enqueue(&self, key: Key) {
        if self.queue.send(key).is_err() {
            tracing::debug!("Generate queue closed");
        }
    }
}

impl kubert::index::IndexNamespacedResource<GenerateRequest> for Index {
    fn apply(&mut self, request: GenerateRequest) {
        let key = (
            request.namespace().unwrap_or_default(),
            request.name_unchecked(),
        );
        let changed = match self.requests.get(&key) {
            None => true,
            Some(prior) => {
                prior.spec != request.spec || prior.state() == GenerateRequestState::Failed
            }
        };
        let active = request.state() != GenerateRequestState::Failed;
        self.requests.insert(key.clone(), Arc::new(request));
        if active && changed {
            self.enqueue(key);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.requests.remove(&(namespace, name));
    }
}

// === impl Controller ===

impl<S: Resources, R: Requests> Controller<S, R> {
    pub fn new(
        reconciler: Reconciler<S, R>,
        claims: watch::Receiver<Arc<Claim>>,
        name: impl ToString,
        resync: time::Duration,
    ) -> (Self, SharedIndex) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let index = Index::shared(queue_tx);
        let controller = Self {
            reconciler: Arc::new(reconciler),
            index: index.clone(),
            claims,
            name: name.to_string(),
            queue_rx,
            resync,
        };
        (controller, index)
    }

    pub async fn run(mut self) {
        let mut queue = Queue::default();
        let mut tasks = JoinSet::new();
        let mut retries = JoinSet::new();
        let mut resync = time::interval(self.resync);
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(key) = self.queue_rx.recv() => {
                    self.start(key, &mut queue, &mut tasks);
                }

                Some(res) = tasks.join_next() => match res {
                    Ok((key, disposition)) => {
                        self.finish(key, disposition, &mut queue, &mut tasks, &mut retries)
                    }
                    Err(error) => tracing::error!(%error, "Generate task failed"),
                },

                Some(res) = retries.join_next() => match res {
                    Ok(key) => {
                        queue.backoff.remove(&key);
                        self.start(key, &mut queue, &mut tasks);
                    }
                    Err(error) => tracing::error!(%error, "Generate retry timer failed"),
                },

                _ = resync.tick() => {
                    // Synchronized requests are re-propagated and lost work is picked up again.
                    for key in self.index.read().active() {
                        self.start(key, &mut queue, &mut tasks);
                    }
                }
            }
        }
    }

    fn start(&self, key: Key, queue: &mut Queue, tasks: &mut JoinSet<(Key, Disposition)>) {
        if queue.backoff.contains(&key) {
            tracing::trace!(namespace = %key.0, name = %key.1, "Waiting to retry");
            return;
        }
        if queue.in_flight.contains(&key) {
            queue.dirty.insert(key);
            return;
        }
        if !self.claims.borrow().is_current_for(&self.name) {
            tracing::trace!(namespace = %key.0, name = %key.1, "Not the leader; skipping");
            return;
        }
        let Some(request) = self.index.read().get(&key) else {
            queue.attempts.remove(&key);
            return;
        };

        let attempt = queue.attempts.get(&key).copied().unwrap_or(0);
        let reconciler = self.reconciler.clone();
        queue.in_flight.insert(key.clone());
        tasks.spawn(async move {
            let disposition = reconciler.process(&request, attempt).await;
            (key, disposition)
        });
    }

    fn finish(
        &self,
        key: Key,
        disposition: Disposition,
        queue: &mut Queue,
        tasks: &mut JoinSet<(Key, Disposition)>,
        retries: &mut JoinSet<Key>,
    ) {
        queue.in_flight.remove(&key);
        let dirty = queue.dirty.remove(&key);

        match disposition {
            Disposition::Done => {
                queue.attempts.remove(&key);
                if dirty {
                    self.start(key, queue, tasks);
                }
            }
            Disposition::Retry => {
                // The retry reads the latest request, so changes made meanwhile are not lost.
                let attempts = queue.attempts.entry(key.clone()).or_default();
                *attempts += 1;
                let delay = backoff(*attempts);
                tracing::debug!(namespace = %key.0, name = %key.1, ?delay, "Retrying generate request");
                queue.backoff.insert(key.clone());
                retries.spawn(async move {
                    time::sleep(delay).await;
                    key
                });
            }
        }
    }
}

pub(crate) fn backoff(attempts: u32) -> time::Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
        .min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff(1), time::Duration::from_millis(500));
        assert_eq!(backoff(2), time::Duration::from_secs(1));
        assert_eq!(backoff(4), time::Duration::from_secs(4));
        assert_eq!(backoff(20), BACKOFF_MAX);
    }
}
