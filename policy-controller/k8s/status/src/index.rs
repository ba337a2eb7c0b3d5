use crate::{stats::PolicyStats, update::Update};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::lease::Claim;
use parking_lot::RwLock;
use polis_policy_controller_k8s_api::{
    self as k8s,
    policy::{ClusterPolicy, Policy as NamespacedPolicy, PolicyStatus},
    ResourceExt,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time,
};

const POLICY_API_VERSION: &str = "polis.io/v1";

pub type SharedIndex = Arc<RwLock<Index>>;

/// Aggregates policy statistics and decides which policy statuses need to be written.
///
/// Updates are applied by a single consumer task in arrival order. Statuses are flushed to the
/// [`Controller`] periodically, and only while this replica holds the write lease.
pub struct Index {
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    patches: mpsc::Sender<Patch>,
    metrics: IndexMetrics,

    stats: HashMap<String, PolicyStats>,

    /// Keys of the policies that currently exist in the cluster.
    known: HashSet<String>,

    /// Keys whose statistics changed since they were last flushed.
    dirty: HashSet<String>,

    /// Whether this replica held the lease at the last flush.
    leading: bool,
}

/// Posts statistics updates without blocking.
#[derive(Clone, Debug)]
pub struct Sender {
    tx: mpsc::Sender<Update>,
    dropped: Counter,
}

/// A status patch for one policy.
#[derive(Debug, PartialEq)]
pub struct Patch {
    /// The policy key.
    pub policy: String,
    pub patch: k8s::Patch<serde_json::Value>,
}

/// Writes policy statuses.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    patches: mpsc::Receiver<Patch>,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    updates_applied: Counter,
    updates_dropped: Counter,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
}

/// Creates the bounded queue feeding the aggregator.
pub fn updates(capacity: usize, metrics: &IndexMetrics) -> (Sender, mpsc::Receiver<Update>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = Sender {
        tx,
        dropped: metrics.updates_dropped.clone(),
    };
    (sender, rx)
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let updates_applied = Counter::default();
        prom.register(
            "updates_applied",
            "Count of statistics updates applied to the status index",
            updates_applied.clone(),
        );

        let updates_dropped = Counter::default();
        prom.register(
            "updates_dropped",
            "Count of statistics updates dropped because the queue was full",
            updates_dropped.clone(),
        );

        Self {
            updates_applied,
            updates_dropped,
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful policy status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed policy status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of policy status patches that timed out",
            patch_timeout.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
        }
    }
}

// === impl Sender ===

impl Sender {
    /// Queues an update. If the queue is full the update is dropped.
    pub fn post(&self, update: Update) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::warn!(policy = %update.policy, "Status update queue is full; dropping update");
                self.dropped.inc();
            }
            Err(TrySendError::Closed(update)) => {
                tracing::debug!(policy = %update.policy, "Status index has stopped; dropping update");
            }
        }
    }

    pub fn post_all(&self, updates: impl IntoIterator<Item = Update>) {
        for update in updates {
            self.post(update);
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        patches: mpsc::Sender<Patch>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            claims,
            patches,
            metrics,
            stats: HashMap::new(),
            known: HashSet::new(),
            dirty: HashSet::new(),
            leading: false,
        }))
    }

    /// Applies queued updates until every [`Sender`] is dropped.
    pub async fn process_updates(index: SharedIndex, mut updates: mpsc::Receiver<Update>) {
        while let Some(update) = updates.recv().await {
            index.write().apply_update(update);
        }
        tracing::debug!("Status updates stream ended");
    }

    /// Periodically flushes changed statuses to the controller.
    pub async fn run(index: SharedIndex, period: time::Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            index.write().flush();
        }
    }

    /// Returns the current statistics for a policy. Unknown policies have zero-valued
    /// statistics.
    pub fn snapshot(&self, policy: &str) -> PolicyStatus {
        self.stats
            .get(policy)
            .map(PolicyStats::snapshot)
            .unwrap_or_default()
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    pub(crate) fn apply_update(&mut self, Update { policy, delta }: Update) {
        self.stats.entry(policy.clone()).or_default().apply(delta);
        self.dirty.insert(policy);
        self.metrics.updates_applied.inc();
    }

    /// Sends a patch for each changed policy that still exists.
    pub(crate) fn flush(&mut self) {
        let leader = self.is_leader();
        let acquired = leader && !self.leading;
        self.leading = leader;
        if !leader {
            return;
        }
        if acquired {
            // Patches sent before the lease was lost may never have been written.
            self.dirty.extend(self.stats.keys().cloned());
        }

        let mut keys = self
            .dirty
            .iter()
            .filter(|k| self.known.contains(*k))
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();

        for key in keys {
            let status = self.snapshot(&key);
            let patch = Patch {
                patch: make_patch(&key, status),
                policy: key.clone(),
            };
            match self.patches.try_send(patch) {
                Ok(()) => {
                    self.dirty.remove(&key);
                }
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Status patch queue is full; deferring to the next flush");
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::error!("Status controller has stopped");
                    return;
                }
            }
        }
    }

    fn observe_policy(&mut self, key: String, status: Option<&PolicyStatus>) {
        if !self.stats.contains_key(&key) {
            if let Some(status) = status {
                tracing::debug!(policy = %key, "Resuming statistics from persisted status");
                self.stats
                    .insert(key.clone(), PolicyStats::from_status(status));
            }
        }
        self.known.insert(key);
    }

    fn forget_policy(&mut self, key: &str) {
        self.known.remove(key);
        self.stats.remove(key);
        self.dirty.remove(key);
    }
}

impl kubert::index::IndexClusterResource<ClusterPolicy> for Index {
    fn apply(&mut self, policy: ClusterPolicy) {
        let key = policy.name_unchecked();
        self.observe_policy(key, policy.status.as_ref());
    }

    fn delete(&mut self, name: String) {
        self.forget_policy(&name);
    }
}

impl kubert::index::IndexNamespacedResource<NamespacedPolicy> for Index {
    fn apply(&mut self, policy: NamespacedPolicy) {
        let Some(ns) = policy.namespace() else {
            return;
        };
        let key = format!("{}/{}", ns, policy.name_unchecked());
        self.observe_policy(key, policy.status.as_ref());
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.forget_policy(&format!("{namespace}/{name}"));
    }
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: impl ToString,
        patches: mpsc::Receiver<Patch>,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name: name.to_string(),
            patches,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let params = k8s::PatchParams::apply(k8s::FIELD_MANAGER);

        while let Some(Patch { policy, patch }) = self.patches.recv().await {
            // Leadership may have been lost since the patch was queued.
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::debug!(%policy, "Not the leader; skipping status patch");
                continue;
            }

            let patched = match policy.split_once('/') {
                Some((ns, name)) => {
                    let api = k8s::Api::<NamespacedPolicy>::namespaced(self.client.clone(), ns);
                    time::timeout(self.patch_timeout, api.patch_status(name, &params, &patch))
                        .await
                        .map(|res| res.map(|_| ()))
                }
                None => {
                    let api = k8s::Api::<ClusterPolicy>::all(self.client.clone());
                    time::timeout(self.patch_timeout, api.patch_status(&policy, &params, &patch))
                        .await
                        .map(|res| res.map(|_| ()))
                }
            };

            match patched {
                Ok(Ok(())) => {
                    tracing::trace!(%policy, "Patched policy status");
                    self.metrics.patch_succeeded.inc();
                }
                Ok(Err(error)) => {
                    tracing::error!(%policy, %error, "Failed to patch policy status");
                    self.metrics.patch_failed.inc();
                }
                Err(_) => {
                    tracing::error!(%policy, timeout = ?self.patch_timeout, "Timed out patching policy status");
                    self.metrics.patch_timeout.inc();
                }
            }
        }
    }
}

pub(crate) fn make_patch(policy: &str, status: PolicyStatus) -> k8s::Patch<serde_json::Value> {
    let kind = if policy.contains('/') {
        "Policy"
    } else {
        "ClusterPolicy"
    };
    k8s::Patch::Merge(serde_json::json!({
        "apiVersion": POLICY_API_VERSION,
        "kind": kind,
        "status": status,
    }))
}
