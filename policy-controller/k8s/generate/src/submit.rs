use crate::{controller::backoff, Requests};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use polis_policy_controller_k8s_api::{GenerateRequest, ResourceExt};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
    time,
};

/// Queues generate requests without blocking the caller.
#[derive(Clone, Debug)]
pub struct Submitter {
    tx: mpsc::Sender<GenerateRequest>,
    metrics: SubmitMetrics,
}

/// Stores queued generate requests, retrying recoverable failures with backoff.
///
/// Submissions for the same request are applied one at a time; while one is in flight only the
/// most recent later submission is kept.
pub struct Submissions {
    rx: mpsc::Receiver<GenerateRequest>,
    max_attempts: u32,
    metrics: SubmitMetrics,
}

#[derive(Clone, Debug)]
pub struct SubmitMetrics {
    submissions: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: String,
}

/// Creates the bounded submission queue.
pub fn submissions(
    capacity: usize,
    max_attempts: u32,
    metrics: SubmitMetrics,
) -> (Submitter, Submissions) {
    let (tx, rx) = mpsc::channel(capacity);
    let submitter = Submitter {
        tx,
        metrics: metrics.clone(),
    };
    let submissions = Submissions {
        rx,
        max_attempts: max_attempts.max(1),
        metrics,
    };
    (submitter, submissions)
}

// === impl SubmitMetrics ===

impl SubmitMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let submissions = Family::default();
        prom.register(
            "submissions",
            "Count of generate request submissions by result",
            submissions.clone(),
        );
        Self { submissions }
    }

    fn observe(&self, result: &'static str) {
        self.submissions
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
    }
}

// === impl Submitter ===

impl Submitter {
    /// Queues a request. If the queue is full the request is dropped.
    pub fn submit(&self, request: GenerateRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                tracing::warn!(
                    policy = %request.spec.policy,
                    resource = %request.spec.resource,
                    "Generate request queue is full; dropping request"
                );
                self.metrics.observe("dropped");
            }
            Err(TrySendError::Closed(request)) => {
                tracing::debug!(
                    policy = %request.spec.policy,
                    "Generate request queue has stopped"
                );
            }
        }
    }
}

// === impl Submissions ===

impl Submissions {
    /// Applies queued requests until every [`Submitter`] is dropped and all submissions have
    /// finished.
    pub async fn run<R: Requests>(mut self, requests: R) {
        let requests = Arc::new(requests);
        let mut in_flight = HashSet::<String>::new();
        let mut waiting = HashMap::<String, GenerateRequest>::new();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => {
                        let name = request.name_any();
                        if in_flight.contains(&name) {
                            waiting.insert(name, request);
                        } else {
                            in_flight.insert(name);
                            tasks.spawn(self.submit(requests.clone(), request));
                        }
                    }
                    None => break,
                },

                Some(res) = tasks.join_next() => match res {
                    Ok(name) => {
                        in_flight.remove(&name);
                        if let Some(request) = waiting.remove(&name) {
                            in_flight.insert(name);
                            tasks.spawn(self.submit(requests.clone(), request));
                        }
                    }
                    Err(error) => tracing::error!(%error, "Generate submission task failed"),
                },
            }
        }

        // Finish outstanding submissions, including those queued behind them.
        while let Some(res) = tasks.join_next().await {
            if let Ok(name) = res {
                if let Some(request) = waiting.remove(&name) {
                    tasks.spawn(self.submit(requests.clone(), request));
                }
            }
        }
        tracing::debug!("Generate request queue closed");
    }

    fn submit<R: Requests>(
        &self,
        requests: Arc<R>,
        request: GenerateRequest,
    ) -> impl std::future::Future<Output = String> + Send + 'static {
        let max_attempts = self.max_attempts;
        let metrics = self.metrics.clone();
        async move {
            let name = request.name_any();
            let mut attempt = 0;
            loop {
                match requests.apply(request.clone()).await {
                    Ok(()) => {
                        metrics.observe("applied");
                        return name;
                    }
                    Err(error) if error.is_recoverable() && attempt + 1 < max_attempts => {
                        attempt += 1;
                        let delay = backoff(attempt);
                        tracing::debug!(
                            %name,
                            %error,
                            ?delay,
                            "Retrying generate request submission"
                        );
                        time::sleep(delay).await;
                    }
                    Err(error) => {
                        tracing::warn!(
                            %name,
                            %error,
                            policy = %request.spec.policy,
                            "Failed to store generate request"
                        );
                        metrics.observe("failed");
                        return name;
                    }
                }
            }
        }
    }
}
