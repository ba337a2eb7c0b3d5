use super::*;
use crate::{
    core::{evaluate_all, Mode, Resource},
    generate::{self, Requests},
    k8s::{
        policy::{
            ClusterPolicy, Generation, MatchResources, Mutation, PolicySpec, ResourceDescription,
            Rule, Validation, ValidationFailureAction,
        },
        GenerateRequest, GenerateRequestStatus, ResourceSpec,
    },
    status::{self, Update},
    violations::{self, Op},
};
use kubert::index::IndexClusterResource;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value as Json};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

struct Fixture {
    admission: Admission,
    updates: mpsc::Receiver<Update>,
    violations: mpsc::Receiver<Op>,
    stored: Arc<Mutex<BTreeMap<String, GenerateRequest>>>,
    applied: mpsc::UnboundedReceiver<String>,
}

/// Stores generate requests by name, the way the API server does.
struct FakeRequests {
    stored: Arc<Mutex<BTreeMap<String, GenerateRequest>>>,
    applied: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl Requests for FakeRequests {
    async fn apply(&self, request: GenerateRequest) -> Result<(), generate::Error> {
        let name = request.metadata.name.clone().expect("requests must be named");
        {
            let mut stored = self.stored.lock();
            if !(request.is_background() && stored.contains_key(&name)) {
                stored.insert(name.clone(), request);
            }
        }
        self.applied.send(name).expect("fixture must be alive");
        Ok(())
    }

    async fn update_status(
        &self,
        _: &GenerateRequest,
        _: GenerateRequestStatus,
    ) -> Result<(), generate::Error> {
        Ok(())
    }
}

#[tokio::test]
async fn enforced_validation_denies() {
    let mut fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "require-labels",
        ValidationFailureAction::Enforce,
        require_app_label(),
    ));

    let rsp = fx.admission.clone().admit(mk_request("CREATE", unlabeled_pod())).await;
    assert!(!rsp.allowed);
    assert_eq!(rsp.result.message, "label `app` is required");

    // Blocked requests still count toward the policy's statistics but are not recorded as
    // violations.
    let update = fx.updates.try_recv().expect("status update must be posted");
    assert_eq!(update.policy, "require-labels");
    assert!(fx.violations.try_recv().is_err());
}

#[tokio::test]
async fn audit_failures_are_admitted_and_recorded() {
    let mut fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "require-labels",
        ValidationFailureAction::Audit,
        require_app_label(),
    ));

    let rsp = fx.admission.clone().admit(mk_request("CREATE", unlabeled_pod())).await;
    assert!(rsp.allowed);

    match fx.violations.try_recv() {
        Ok(Op::Apply(violation)) => {
            assert_eq!(violation.policy, "require-labels");
            assert_eq!(
                violation.resource,
                ResourceSpec::new("Pod", "default", "web-0").with_api_version("v1")
            );
            assert_eq!(violation.rules.len(), 1);
            assert_eq!(violation.rules[0].name, "check-app");
        }
        op => panic!("expected a violation record, got {op:?}"),
    }
}

#[tokio::test]
async fn mutations_are_returned_as_patches() {
    let fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "add-tier",
        ValidationFailureAction::Audit,
        Rule {
            name: "add-tier".to_string(),
            match_resources: match_kind("Pod"),
            mutate: Some(Mutation {
                overlay: Some(json!({ "metadata": { "labels": { "tier": "fe" } } })),
                ..Default::default()
            }),
            ..Default::default()
        },
    ));

    let rsp = fx.admission.clone().admit(mk_request("CREATE", unlabeled_pod())).await;
    assert!(rsp.allowed);

    let patch = rsp.patch.expect("response must carry a patch");
    let patch = serde_json::from_slice::<json_patch::Patch>(&patch).expect("patch must decode");
    let mut pod = unlabeled_pod();
    json_patch::patch(&mut pod, &patch.0).expect("patch must apply");
    assert_eq!(pod["metadata"]["labels"], json!({ "tier": "fe" }));
}

#[tokio::test]
async fn admitted_requests_create_generate_requests() {
    let mut fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "default-config",
        ValidationFailureAction::Audit,
        Rule {
            name: "config".to_string(),
            match_resources: match_kind("Pod"),
            generate: Some(Generation {
                target: ResourceSpec::new("ConfigMap", "default", "defaults"),
                data: Some(json!({ "data": { "level": "info" } })),
                ..Default::default()
            }),
            ..Default::default()
        },
    ));

    let rsp = fx.admission.clone().admit(mk_request("CREATE", unlabeled_pod())).await;
    assert!(rsp.allowed);

    let name = fx.applied.recv().await.expect("generate request must be stored");
    let request = fx.stored.lock().get(&name).cloned().expect("request must exist");
    assert_eq!(request.spec.policy, "default-config");
    assert_eq!(request.spec.resource.name, "web-0");
    assert_eq!(
        request
            .spec
            .context
            .user_info
            .map(|info| info.admission_user_info.username),
        Some("alice".to_string())
    );
}

#[tokio::test]
async fn repeated_triggers_share_one_generate_request() {
    let mut fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "default-config",
        ValidationFailureAction::Audit,
        Rule {
            name: "config".to_string(),
            match_resources: match_kind("Pod"),
            generate: Some(Generation {
                target: ResourceSpec::new("ConfigMap", "default", "defaults"),
                data: Some(json!({ "data": { "level": "info" } })),
                ..Default::default()
            }),
            ..Default::default()
        },
    ));

    for _ in 0..3 {
        let rsp = fx.admission.clone().admit(mk_request("UPDATE", unlabeled_pod())).await;
        assert!(rsp.allowed);
    }

    // A background scan of the same pod addresses the same request and keeps its requester.
    let pod = Resource::new("Pod", unlabeled_pod());
    let policies = fx.admission.policies.read().applicable(Some("default"));
    let evaluation = evaluate_all(policies, &pod, Mode::Background);
    fx.admission.recorder.record(&evaluation, &pod, None);

    for _ in 0..4 {
        fx.applied.recv().await.expect("submission must be applied");
    }
    let stored = fx.stored.lock().clone();
    assert_eq!(stored.len(), 1, "{:?}", stored.keys().collect::<Vec<_>>());
    let request = stored.into_values().next().expect("request must exist");
    assert!(!request.is_background());
}

#[tokio::test]
async fn denied_requests_do_not_generate() {
    let mut fx = Fixture::new(FailurePolicy::Fail);
    let mut rule = require_app_label();
    rule.generate = Some(Generation {
        target: ResourceSpec::new("ConfigMap", "default", "defaults"),
        data: Some(json!({ "data": {} })),
        ..Default::default()
    });
    fx.add_policy(mk_policy(
        "require-labels",
        ValidationFailureAction::Enforce,
        rule,
    ));

    let rsp = fx.admission.clone().admit(mk_request("CREATE", unlabeled_pod())).await;
    assert!(!rsp.allowed);

    drop(fx.admission);
    assert!(fx.applied.recv().await.is_none());
    assert!(fx.stored.lock().is_empty());
}

#[tokio::test]
async fn deletes_are_admitted() {
    let fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "require-labels",
        ValidationFailureAction::Enforce,
        require_app_label(),
    ));

    let rsp = fx.admission.clone().admit(mk_request("DELETE", unlabeled_pod())).await;
    assert!(rsp.allowed);
}

#[tokio::test]
async fn own_resources_are_admitted() {
    let fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "require-labels",
        ValidationFailureAction::Enforce,
        Rule {
            match_resources: match_kind("ClusterPolicy"),
            ..require_app_label()
        },
    ));

    let mut req = mk_request(
        "CREATE",
        json!({
            "apiVersion": "polis.io/v1",
            "kind": "ClusterPolicy",
            "metadata": { "name": "other" },
            "spec": {},
        }),
    );
    req.kind.group = API_GROUP.to_string();
    req.kind.kind = "ClusterPolicy".to_string();
    req.namespace = None;

    let rsp = fx.admission.clone().admit(req).await;
    assert!(rsp.allowed);
}

#[tokio::test]
async fn unmatched_requests_are_admitted_without_side_effects() {
    let mut fx = Fixture::new(FailurePolicy::Fail);
    fx.add_policy(mk_policy(
        "require-labels",
        ValidationFailureAction::Enforce,
        Rule {
            match_resources: match_kind("Deployment"),
            ..require_app_label()
        },
    ));

    let rsp = fx.admission.clone().admit(mk_request("CREATE", unlabeled_pod())).await;
    assert!(rsp.allowed);
    assert!(rsp.patch.is_none());
    assert!(fx.updates.try_recv().is_err());
}

#[test]
fn parses_failure_policies() {
    assert_eq!("fail".parse::<FailurePolicy>().ok(), Some(FailurePolicy::Fail));
    assert_eq!(
        "ignore".parse::<FailurePolicy>().ok(),
        Some(FailurePolicy::Ignore)
    );
    assert!("Fail".parse::<FailurePolicy>().is_err());
}

// === Helpers ===

impl Fixture {
    fn new(failure_policy: FailurePolicy) -> Self {
        let (status, updates) = status::updates(
            100,
            &status::IndexMetrics::register(&mut Registry::default()),
        );
        let (writer, violations) = violations::Writer::channel(100);
        let (submitter, submissions) = generate::submissions(
            100,
            3,
            generate::SubmitMetrics::register(&mut Registry::default()),
        );
        let stored = Arc::new(Mutex::new(BTreeMap::new()));
        let (applied_tx, applied) = mpsc::unbounded_channel();
        tokio::spawn(submissions.run(FakeRequests {
            stored: stored.clone(),
            applied: applied_tx,
        }));
        let recorder = Recorder::new(status, writer, submitter);

        let admission = Admission::new(
            index::policy::Index::shared(),
            index::rbac::Index::shared(),
            recorder,
            time::Duration::from_secs(5),
            failure_policy,
            AdmissionMetrics::register(&mut Registry::default()),
        );
        Self {
            admission,
            updates,
            violations,
            stored,
            applied,
        }
    }

    fn add_policy(&self, policy: ClusterPolicy) {
        IndexClusterResource::apply(&mut *self.admission.policies.write(), policy);
    }
}

fn mk_policy(name: &str, action: ValidationFailureAction, rule: Rule) -> ClusterPolicy {
    ClusterPolicy::new(
        name,
        PolicySpec {
            rules: vec![rule],
            validation_failure_action: action,
            background: None,
        }
        .into(),
    )
}

fn match_kind(kind: &str) -> MatchResources {
    MatchResources {
        resources: ResourceDescription {
            kinds: vec![kind.to_string()],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn require_app_label() -> Rule {
    Rule {
        name: "check-app".to_string(),
        match_resources: match_kind("Pod"),
        validate: Some(Validation {
            message: Some("label `app` is required".to_string()),
            pattern: Some(json!({ "metadata": { "labels": { "app": "?*" } } })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn unlabeled_pod() -> Json {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "web-0", "namespace": "default" },
        "spec": { "containers": [{ "name": "web", "image": "web:1.0" }] },
    })
}

fn mk_request(operation: &str, object: Json) -> AdmissionRequest {
    let review = serde_json::from_value::<Review>(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "4b1f6a1c-8d1e-4c59-9d0e-1f3b0f6c2a10",
            "kind": { "group": "", "version": "v1", "kind": "Pod" },
            "resource": { "group": "", "version": "v1", "resource": "pods" },
            "name": "web-0",
            "namespace": "default",
            "operation": operation,
            "userInfo": { "username": "alice", "groups": ["devs"] },
            "object": object,
            "dryRun": false,
        },
    }))
    .expect("admission review must decode");
    review.try_into().expect("admission review must carry a request")
}
