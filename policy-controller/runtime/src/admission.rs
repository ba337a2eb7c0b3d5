use crate::{
    core::{evaluate_all, Evaluation, Mode, Resource},
    index,
    k8s::{AdmissionUserInfo, RequestInfo, API_GROUP},
    outcomes::Recorder,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::str::FromStr;
use thiserror::Error;
use tokio::{task, time};
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct Admission {
    policies: index::policy::SharedIndex,
    rbac: index::rbac::SharedIndex,
    recorder: Recorder,
    timeout: time::Duration,
    failure_policy: FailurePolicy,
    metrics: AdmissionMetrics,
}

/// What to do with a request whose evaluation could not complete.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    requests: Family<VerdictLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct VerdictLabels {
    verdict: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Mutated,
    Denied,
    Error,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("invalid failure policy: {0}")]
pub struct InvalidFailurePolicy(String);

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl AdmissionService ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub(crate) fn new(
        policies: index::policy::SharedIndex,
        rbac: index::rbac::SharedIndex,
        recorder: Recorder,
        timeout: time::Duration,
        failure_policy: FailurePolicy,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            policies,
            rbac,
            recorder,
            timeout,
            failure_policy,
            metrics,
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let (rsp, verdict) = self.review(req).await;
        self.metrics.observe(verdict);
        rsp
    }

    async fn review(&self, req: AdmissionRequest) -> (AdmissionResponse, Verdict) {
        let rsp = AdmissionResponse::from(&req);

        // The controller's own resources are never subject to policies.
        if req.kind.group == API_GROUP {
            return (rsp, Verdict::Allowed);
        }
        if req.operation == Operation::Delete {
            return (rsp, Verdict::Allowed);
        }

        let Some(mut obj) = req.object else {
            return (rsp, Verdict::Allowed);
        };
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = req.namespace.clone();
        }
        let object = match serde_json::to_value(&obj) {
            Ok(object) => object,
            Err(error) => {
                warn!(%error, "Failed to encode admitted object");
                return (AdmissionResponse::invalid(error), Verdict::Error);
            }
        };
        let resource = Resource::new(&req.kind.kind, object);

        let requester = self.rbac.read().request_info(AdmissionUserInfo {
            username: req.user_info.username.clone().unwrap_or_default(),
            uid: req.user_info.uid.clone().unwrap_or_default(),
            groups: req.user_info.groups.clone().unwrap_or_default(),
        });

        let evaluation = match self.evaluate(&resource, &requester).await {
            Ok(evaluation) => evaluation,
            Err(error) => {
                return match self.failure_policy {
                    FailurePolicy::Fail => {
                        warn!(resource = %resource.spec(), %error, "Denying request that could not be evaluated");
                        (rsp.deny(error), Verdict::Error)
                    }
                    FailurePolicy::Ignore => {
                        warn!(resource = %resource.spec(), %error, "Admitting request that could not be evaluated");
                        (rsp, Verdict::Error)
                    }
                };
            }
        };

        if req.dry_run {
            debug!(resource = %resource.spec(), "Dry run; outcomes are not recorded");
        } else {
            self.recorder
                .record(&evaluation, &resource, Some(&requester));
        }

        if let Some(message) = evaluation.denied() {
            info!(resource = %resource.spec(), %message, "Denied");
            return (rsp.deny(message), Verdict::Denied);
        }

        match evaluation.patched {
            Some(patched) => {
                let patch = json_patch::diff(&resource.object, &patched);
                match rsp.with_patch(patch) {
                    Ok(rsp) => (rsp, Verdict::Mutated),
                    Err(error) => {
                        warn!(%error, "Failed to encode mutation patch");
                        (AdmissionResponse::invalid(error), Verdict::Error)
                    }
                }
            }
            None => (rsp, Verdict::Allowed),
        }
    }

    /// Evaluates the applicable policies off the async runtime, bounded by the admission timeout.
    async fn evaluate(
        &self,
        resource: &Resource,
        requester: &RequestInfo,
    ) -> Result<Evaluation, String> {
        let policies = self.policies.read().applicable(resource.namespace());
        if policies.is_empty() {
            return Ok(Evaluation::default());
        }

        let evaluation = {
            let resource = resource.clone();
            let requester = requester.clone();
            task::spawn_blocking(move || {
                evaluate_all(policies, &resource, Mode::Admission(&requester))
            })
        };
        match time::timeout(self.timeout, evaluation).await {
            Ok(Ok(evaluation)) => Ok(evaluation),
            Ok(Err(error)) => Err(format!("policy evaluation failed: {error}")),
            Err(_) => Err(format!(
                "policy evaluation timed out after {:?}",
                self.timeout
            )),
        }
    }
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

// === impl FailurePolicy ===

impl FromStr for FailurePolicy {
    type Err = InvalidFailurePolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "ignore" => Ok(Self::Ignore),
            s => Err(InvalidFailurePolicy(s.to_string())),
        }
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of admission requests by verdict",
            requests.clone(),
        );
        Self { requests }
    }

    fn observe(&self, verdict: Verdict) {
        let verdict = match verdict {
            Verdict::Allowed => "allowed",
            Verdict::Mutated => "mutated",
            Verdict::Denied => "denied",
            Verdict::Error => "error",
        };
        self.requests
            .get_or_create(&VerdictLabels {
                verdict: verdict.to_string(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests;
