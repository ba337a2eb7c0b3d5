use crate::{Error, Requests, Resources};
use polis_policy_controller_core::{condition::Context, evaluate, Mode, Policy, Resource};
use polis_policy_controller_k8s_api::{
    labels::GENERATED_BY_LABEL,
    policy::{Generation, Rule},
    GenerateRequest, GenerateRequestState, GenerateRequestStatus, ResourceSpec,
};
use polis_policy_controller_k8s_index::policy::SharedIndex as PolicyIndex;
use polis_policy_controller_k8s_status as status;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde_json::{json, Value as Json};

/// Drives generate requests to completion.
pub struct Reconciler<S, R> {
    resources: S,
    requests: R,
    policies: PolicyIndex,
    status: status::Sender,
    max_attempts: u32,
    metrics: ReconcileMetrics,
}

/// What the caller should do with a request after it was processed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Done,
    Retry,
}

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciles: Family<StateLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StateLabels {
    state: String,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of generate request reconciliations by resulting state",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    fn observe(&self, state: GenerateRequestState) {
        self.reconciles
            .get_or_create(&StateLabels {
                state: state.to_string(),
            })
            .inc();
    }
}

// === impl Reconciler ===

impl<S: Resources, R: Requests> Reconciler<S, R> {
    pub fn new(
        resources: S,
        requests: R,
        policies: PolicyIndex,
        status: status::Sender,
        max_attempts: u32,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            resources,
            requests,
            policies,
            status,
            max_attempts,
            metrics,
        }
    }

    /// Processes a request and records the resulting state.
    ///
    /// `attempt` counts the previous failed attempts. Recoverable errors leave the request
    /// pending until `max_attempts` is reached, after which the request fails.
    pub async fn process(&self, request: &GenerateRequest, attempt: u32) -> Disposition {
        let key = request_key(request);
        let (status, disposition) = match self.reconcile(request).await {
            Ok(None) => return Disposition::Done,
            Ok(Some(status)) => (status, Disposition::Done),
            Err(error) if error.is_recoverable() && attempt + 1 < self.max_attempts => {
                tracing::info!(request = %key, %error, attempt, "Generate request pending");
                (
                    self.status_with(request, GenerateRequestState::Pending, &error),
                    Disposition::Retry,
                )
            }
            Err(error) => {
                tracing::warn!(request = %key, %error, "Generate request failed");
                (
                    self.status_with(request, GenerateRequestState::Failed, &error),
                    Disposition::Done,
                )
            }
        };

        self.metrics.observe(status.state);
        if request.status.as_ref() != Some(&status) {
            if let Err(error) = self.requests.update_status(request, status).await {
                tracing::warn!(request = %key, %error, "Failed to update generate request status");
                if error.is_recoverable() {
                    return Disposition::Retry;
                }
            }
        }
        disposition
    }

    fn status_with(
        &self,
        request: &GenerateRequest,
        state: GenerateRequestState,
        error: &Error,
    ) -> GenerateRequestStatus {
        let mut status = request.status.clone().unwrap_or_default();
        status.state = state;
        status.message = error.to_string();
        status
    }

    /// Creates or updates the targets of a request's generate rules.
    ///
    /// Returns the request's new status, or `None` if the request needs no processing.
    pub async fn reconcile(
        &self,
        request: &GenerateRequest,
    ) -> Result<Option<GenerateRequestStatus>, Error> {
        let state = request.state();
        if state == GenerateRequestState::Failed {
            return Ok(None);
        }

        let policy = self
            .policies
            .read()
            .get(&request.spec.policy)
            .ok_or_else(|| Error::PolicyNotFound(request.spec.policy.clone()))?;

        let synchronized = policy
            .spec
            .rules
            .iter()
            .filter_map(|r| r.generate.as_ref())
            .any(|g| g.synchronize);
        if state == GenerateRequestState::Completed
            && !synchronized
            && self.targets_exist(request).await?
        {
            return Ok(None);
        }

        let trigger = self
            .resources
            .get(&request.spec.resource)
            .await?
            .ok_or_else(|| Error::TriggerNotFound(request.spec.resource.clone()))?;
        let trigger = Resource::new(&request.spec.resource.kind, trigger);

        // Rules are re-evaluated so that only those still matching the trigger generate, in the
        // same mode that raised the request.
        let mode = match request.spec.context.user_info.as_ref() {
            Some(info) => Mode::Admission(info),
            None => Mode::Background,
        };
        let outcome = evaluate(&policy, &trigger, mode);

        let mut status = request.status.clone().unwrap_or_default();
        for rule in outcome.rules.iter().filter(|r| r.generate) {
            let Some((rule, generation)) = find_generation(&policy, &rule.name) else {
                continue;
            };
            let target = self
                .apply(&policy, rule, generation, &trigger, mode)
                .await?;
            status.record(target);
        }

        status.state = GenerateRequestState::Completed;
        status.message.clear();
        Ok(Some(status))
    }

    async fn targets_exist(&self, request: &GenerateRequest) -> Result<bool, Error> {
        let generated = request
            .status
            .as_ref()
            .map(|s| s.generated_resources.as_slice())
            .unwrap_or_default();
        for target in generated {
            if self.resources.get(target).await?.is_none() {
                tracing::debug!(resource = %target, "Generated resource is missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Creates a rule's target, or updates it if it is synchronized and has drifted.
    async fn apply(
        &self,
        policy: &Policy,
        rule: &Rule,
        generation: &Generation,
        trigger: &Resource,
        mode: Mode<'_>,
    ) -> Result<ResourceSpec, Error> {
        let ctx = Context::new(trigger, mode);
        let substitute = |s: &str| {
            ctx.substitute(s).map_err(|source| Error::Variable {
                rule: rule.name.clone(),
                source,
            })
        };
        let target = ResourceSpec {
            api_version: generation.target.api_version.clone(),
            kind: generation.target.kind.clone(),
            namespace: substitute(&generation.target.namespace)?,
            name: substitute(&generation.target.name)?,
        };

        let desired = self.desired(policy, rule, generation, &target).await?;
        match self.resources.get(&target).await? {
            None => {
                self.resources.create(&target, desired).await?;
            }
            Some(existing)
                if generation.synchronize && comparable(&existing) != comparable(&desired) =>
            {
                let mut desired = desired;
                if let Some(version) = existing.pointer("/metadata/resourceVersion") {
                    desired["metadata"]["resourceVersion"] = version.clone();
                }
                self.resources.replace(&target, desired).await?;
            }
            Some(_) => {
                tracing::trace!(resource = %target, "Generated resource is up to date");
                return Ok(target);
            }
        }

        self.status
            .post(status::Update::generated(policy.key(), &rule.name));
        Ok(target)
    }

    async fn desired(
        &self,
        policy: &Policy,
        rule: &Rule,
        generation: &Generation,
        target: &ResourceSpec,
    ) -> Result<Json, Error> {
        let mut object = match (&generation.data, &generation.clone) {
            (Some(data), _) => data.clone(),
            (None, Some(clone)) => {
                let source = ResourceSpec {
                    api_version: target.api_version.clone(),
                    kind: target.kind.clone(),
                    namespace: clone.namespace.clone(),
                    name: clone.name.clone(),
                };
                let mut object = self
                    .resources
                    .get(&source)
                    .await?
                    .ok_or_else(|| Error::SourceNotFound(source.clone()))?;
                let meta = object.get("metadata").cloned().unwrap_or_default();
                object["metadata"] = json!({
                    "labels": meta.get("labels").cloned().unwrap_or_else(|| json!({})),
                    "annotations": meta.get("annotations").cloned().unwrap_or_else(|| json!({})),
                });
                if let Some(obj) = object.as_object_mut() {
                    obj.remove("status");
                }
                object
            }
            (None, None) => return Err(Error::MissingPayload(rule.name.clone())),
        };

        if !object.is_object() {
            return Err(Error::MissingPayload(rule.name.clone()));
        }
        if object.get("apiVersion").is_none() {
            if let Some(api_version) = target.api_version.as_deref() {
                object["apiVersion"] = json!(api_version);
            }
        }
        object["kind"] = json!(target.kind);
        if !object["metadata"].is_object() {
            object["metadata"] = json!({});
        }
        let meta = &mut object["metadata"];
        meta["name"] = json!(target.name);
        match target.namespace() {
            Some(ns) => meta["namespace"] = json!(ns),
            None => {
                if let Some(meta) = meta.as_object_mut() {
                    meta.remove("namespace");
                }
            }
        }
        if !meta["labels"].is_object() {
            meta["labels"] = json!({});
        }
        meta["labels"][GENERATED_BY_LABEL] = json!(policy.name());

        Ok(object)
    }
}

fn find_generation<'p>(policy: &'p Policy, name: &str) -> Option<(&'p Rule, &'p Generation)> {
    policy
        .spec
        .rules
        .iter()
        .find(|r| r.name == name)
        .and_then(|r| Some((r, r.generate.as_ref()?)))
}

/// Projects an object onto the fields a generate rule controls.
fn comparable(object: &Json) -> Json {
    let mut object = object.clone();
    if let Some(obj) = object.as_object_mut() {
        obj.remove("status");
        let meta = obj.remove("metadata").unwrap_or_default();
        let empty = || json!({});
        obj.insert(
            "metadata".to_string(),
            json!({
                "labels": meta.get("labels").cloned().unwrap_or_else(empty),
                "annotations": meta.get("annotations").cloned().unwrap_or_else(empty),
            }),
        );
    }
    object
}

pub(crate) fn request_key(request: &GenerateRequest) -> String {
    format!(
        "{}/{}",
        request.metadata.namespace.as_deref().unwrap_or_default(),
        request.metadata.name.as_deref().unwrap_or_default()
    )
}
