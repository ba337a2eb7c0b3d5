use super::*;
use crate::{
    generate,
    k8s::policy::{
        ClusterPolicy, MatchResources, PolicySpec, ResourceDescription, Rule, Validation,
        ValidationFailureAction,
    },
    status,
    violations::{self, Op},
};
use pretty_assertions::assert_eq;
use prometheus_client::registry::Registry;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

#[test]
fn stale_records_are_limited_to_scanned_kinds() {
    let existing = [
        ((Some("default"), "web-0"), "Pod"),
        ((Some("default"), "web-1"), "Pod"),
        ((None, "team-a"), "Namespace"),
        ((Some("default"), "web"), "Deployment"),
    ]
    .into_iter()
    .map(|((ns, name), kind)| {
        (
            (ns.map(str::to_string), name.to_string()),
            kind.to_string(),
        )
    })
    .collect::<HashMap<_, _>>();
    let scanned = ["Pod", "Namespace"]
        .into_iter()
        .map(str::to_string)
        .collect::<HashSet<_>>();
    let reported = [(Some("default".to_string()), "web-0".to_string())]
        .into_iter()
        .collect::<HashSet<_>>();

    // Deployments could not be listed, so their record is kept.
    assert_eq!(
        stale_records(existing, &scanned, &reported),
        vec![
            (None, "team-a".to_string()),
            (Some("default".to_string()), "web-1".to_string()),
        ]
    );
}

#[test]
fn nothing_is_stale_when_nothing_was_scanned() {
    let existing = [((Some("default".to_string()), "web-0".to_string()), "Pod".to_string())]
        .into_iter()
        .collect::<HashMap<_, _>>();
    assert!(stale_records(existing, &HashSet::new(), &HashSet::new()).is_empty());
}

#[test]
fn evaluation_reports_violation_records() {
    let (recorder, mut ops) = mk_recorder();
    let policies = vec![Arc::new(Policy::from(require_labels()))];

    let pod = Resource::new("Pod", pod(None));
    let records = evaluate(&recorder, &policies, &pod);
    assert_eq!(records, vec![record_ref("require-labels", &pod.spec())]);
    match ops.try_recv() {
        Ok(Op::Apply(violation)) => {
            assert_eq!(violation.policy, "require-labels");
            assert_eq!(violation.resource, pod.spec());
        }
        op => panic!("unexpected violation op: {op:?}"),
    }

    let labeled = Resource::new("Pod", self::pod(Some("web")));
    assert!(evaluate(&recorder, &policies, &labeled).is_empty());
    assert!(ops.try_recv().is_err());
}

fn mk_recorder() -> (Recorder, mpsc::Receiver<Op>) {
    let (status, _) = status::updates(
        100,
        &status::IndexMetrics::register(&mut Registry::default()),
    );
    let (writer, ops) = violations::Writer::channel(100);
    let (submitter, _) = generate::submissions(
        100,
        3,
        generate::SubmitMetrics::register(&mut Registry::default()),
    );
    (Recorder::new(status, writer, submitter), ops)
}

fn require_labels() -> ClusterPolicy {
    let rule = Rule {
        name: "check-app".to_string(),
        match_resources: MatchResources {
            resources: ResourceDescription {
                kinds: vec!["Pod".to_string()],
                ..Default::default()
            },
            ..Default::default()
        },
        validate: Some(Validation {
            message: Some("label `app` is required".to_string()),
            pattern: Some(json!({ "metadata": { "labels": { "app": "?*" } } })),
            ..Default::default()
        }),
        ..Default::default()
    };
    ClusterPolicy::new(
        "require-labels",
        PolicySpec {
            rules: vec![rule],
            validation_failure_action: ValidationFailureAction::Audit,
            background: Some(true),
        }
        .into(),
    )
}

fn pod(app: Option<&str>) -> Json {
    let mut pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "web-0", "namespace": "default" },
        "spec": { "containers": [{ "name": "web", "image": "web:1.0" }] },
    });
    if let Some(app) = app {
        pod["metadata"]["labels"] = json!({ "app": app });
    }
    pod
}
