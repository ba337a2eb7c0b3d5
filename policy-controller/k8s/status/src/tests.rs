use crate::{
    index::{self, SharedIndex},
    update::{Delta, RuleSample, Update},
    Index, IndexMetrics, Patch,
};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use polis_policy_controller_core::{evaluate, Mode, Policy, Resource};
use polis_policy_controller_k8s_api::{
    policy::{
        ClusterPolicy, MatchResources, Policy as NamespacedPolicy, PolicySpec, PolicyStatus,
        ResourceDescription, Rule, Validation, ValidationFailureAction,
    },
    RequestInfo,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

const TEST_HOSTNAME: &str = "test";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_sum_exactly() {
    let (index, _patches_rx, _claims_tx) = mk_index(TEST_HOSTNAME);
    let metrics = IndexMetrics::register(&mut Default::default());
    let (sender, updates_rx) = index::updates(10_000, &metrics);
    let consumer = tokio::spawn(Index::process_updates(index.clone(), updates_rx));

    let producers = (0..8)
        .map(|i| {
            let sender = sender.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    sender.post(Update {
                        policy: "require-labels".to_string(),
                        delta: Delta::Execution {
                            elapsed: Duration::from_millis(1),
                            rules: vec![RuleSample {
                                name: "check-app".to_string(),
                                elapsed: Duration::from_millis(1),
                                failed: i % 2 == 0,
                            }],
                        },
                    });
                }
            })
        })
        .collect::<Vec<_>>();
    for producer in producers {
        producer.await.expect("producer must not panic");
    }
    drop(sender);
    consumer.await.expect("consumer must not panic");

    let status = index.read().snapshot("require-labels");
    assert_eq!(status.rules_applied_count, 400);
    assert_eq!(status.rules_failed_count, 400);
    assert_eq!(status.rules[0].applied_count, 400);
    assert_eq!(status.rules[0].failed_count, 400);
    assert_eq!(status.average_execution_time, "1ms");
}

#[test]
fn audit_failure_counts_a_violation() {
    let (index, _patches_rx, _claims_tx) = mk_index(TEST_HOSTNAME);
    let policy = require_labels(ValidationFailureAction::Audit);
    let info = RequestInfo::new("alice", vec![]);
    let outcome = evaluate(&policy, &unlabeled_pod(), Mode::Admission(&info));

    for update in Update::from_outcome(&outcome) {
        index.write().apply_update(update);
    }

    let status = index.read().snapshot("require-labels");
    assert_eq!(status.violation_count, 1);
    assert_eq!(status.rules_failed_count, 1);
    assert_eq!(status.rules_applied_count, 0);
    assert_eq!(status.resources_blocked_count, 0);
    assert_eq!(status.rules[0].name, "check-app");
    assert_eq!(status.rules[0].violation_count, 1);
}

#[test]
fn enforce_failure_counts_a_block() {
    let (index, _patches_rx, _claims_tx) = mk_index(TEST_HOSTNAME);
    let policy = require_labels(ValidationFailureAction::Enforce);
    let info = RequestInfo::new("alice", vec![]);
    let outcome = evaluate(&policy, &unlabeled_pod(), Mode::Admission(&info));

    for update in Update::from_outcome(&outcome) {
        index.write().apply_update(update);
    }

    let status = index.read().snapshot("require-labels");
    assert_eq!(status.violation_count, 0);
    assert_eq!(status.rules_failed_count, 1);
    assert_eq!(status.resources_blocked_count, 1);
    assert_eq!(status.rules[0].resources_blocked_count, 1);
}

#[test]
fn unknown_policies_have_zero_statistics() {
    let (index, _patches_rx, _claims_tx) = mk_index(TEST_HOSTNAME);
    assert_eq!(index.read().snapshot("missing"), PolicyStatus::default());
}

#[test]
fn full_queue_drops_updates() {
    let metrics = IndexMetrics::register(&mut Default::default());
    let (sender, mut updates_rx) = index::updates(1, &metrics);
    sender.post(Update::generated("require-labels", "gen"));
    sender.post(Update::generated("require-labels", "gen"));

    assert_eq!(
        updates_rx.try_recv().ok(),
        Some(Update::generated("require-labels", "gen"))
    );
    assert!(updates_rx.try_recv().is_err());
}

#[test]
fn flushes_changed_policies() {
    let (index, mut patches_rx, _claims_tx) = mk_index(TEST_HOSTNAME);
    IndexClusterResource::apply(
        &mut *index.write(),
        ClusterPolicy::new("require-labels", PolicySpec::default().into()),
    );
    let mut ns_policy = NamespacedPolicy::new("require-limits", PolicySpec::default().into());
    ns_policy.metadata.namespace = Some("team-a".to_string());
    IndexNamespacedResource::apply(&mut *index.write(), ns_policy);

    // Nothing has changed yet.
    index.write().flush();
    assert!(patches_rx.try_recv().is_err());

    index
        .write()
        .apply_update(Update::generated("require-labels", "gen"));
    index
        .write()
        .apply_update(Update::generated("team-a/require-limits", "gen"));
    // Statistics for policies that do not exist are never written.
    index
        .write()
        .apply_update(Update::generated("deleted", "gen"));
    index.write().flush();

    let Patch { policy, patch } = patches_rx.try_recv().expect("patch must be sent");
    assert_eq!(policy, "require-labels");
    let status = index.read().snapshot("require-labels");
    assert_eq!(patch, index::make_patch("require-labels", status));

    let Patch { policy, .. } = patches_rx.try_recv().expect("patch must be sent");
    assert_eq!(policy, "team-a/require-limits");
    assert!(patches_rx.try_recv().is_err());

    // Unchanged statistics are not written again.
    index.write().flush();
    assert!(patches_rx.try_recv().is_err());
}

#[test]
fn only_the_leader_flushes() {
    let (index, mut patches_rx, claims_tx) = mk_index("other");
    IndexClusterResource::apply(
        &mut *index.write(),
        ClusterPolicy::new("require-labels", PolicySpec::default().into()),
    );
    index
        .write()
        .apply_update(Update::generated("require-labels", "gen"));
    index.write().flush();
    assert!(patches_rx.try_recv().is_err());

    // Once the lease is acquired, the pending change is written.
    claims_tx
        .send(Arc::new(kubert::lease::Claim {
            holder: "other".to_string(),
            expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
        }))
        .expect("claims must have a receiver");
    index.write().flush();
    assert_eq!(
        patches_rx.try_recv().map(|p| p.policy).ok().as_deref(),
        Some("require-labels")
    );
}

#[test]
fn reacquired_leases_rewrite_all_statuses() {
    let (index, mut patches_rx, claims_tx) = mk_index(TEST_HOSTNAME);
    IndexClusterResource::apply(
        &mut *index.write(),
        ClusterPolicy::new("require-labels", PolicySpec::default().into()),
    );
    index
        .write()
        .apply_update(Update::generated("require-labels", "gen"));
    index.write().flush();
    assert!(patches_rx.try_recv().is_ok());

    // Another replica takes the lease; the patch sent earlier may have been discarded.
    claims_tx
        .send(Arc::new(claim("other")))
        .expect("claims must have a receiver");
    index.write().flush();
    assert!(patches_rx.try_recv().is_err());

    claims_tx
        .send(Arc::new(claim(TEST_HOSTNAME)))
        .expect("claims must have a receiver");
    index.write().flush();
    let Patch { policy, patch } = patches_rx.try_recv().expect("patch must be sent");
    assert_eq!(policy, "require-labels");
    let status = index.read().snapshot("require-labels");
    assert_eq!(patch, index::make_patch("require-labels", status));

    // Holding the lease does not rewrite unchanged statuses.
    index.write().flush();
    assert!(patches_rx.try_recv().is_err());
}

#[test]
fn resumes_persisted_counts() {
    let (index, _patches_rx, _claims_tx) = mk_index(TEST_HOSTNAME);
    let mut policy = ClusterPolicy::new("require-labels", PolicySpec::default().into());
    policy.status = Some(PolicyStatus {
        violation_count: 7,
        ..PolicyStatus::default()
    });
    IndexClusterResource::apply(&mut *index.write(), policy);
    index.write().apply_update(Update {
        policy: "require-labels".to_string(),
        delta: Delta::Violation {
            rules: vec!["check-app".to_string()],
        },
    });

    assert_eq!(index.read().snapshot("require-labels").violation_count, 8);

    IndexClusterResource::<ClusterPolicy>::delete(&mut *index.write(), "require-labels".into());
    assert_eq!(index.read().snapshot("require-labels").violation_count, 0);
}

fn mk_index(
    holder: &str,
) -> (
    SharedIndex,
    mpsc::Receiver<Patch>,
    watch::Sender<Arc<kubert::lease::Claim>>,
) {
    let (claims_tx, claims_rx) = watch::channel(Arc::new(claim(TEST_HOSTNAME)));
    let (patches_tx, patches_rx) = mpsc::channel(10000);
    let index = Index::shared(
        holder,
        claims_rx,
        patches_tx,
        IndexMetrics::register(&mut Default::default()),
    );
    (index, patches_rx, claims_tx)
}

fn claim(holder: &str) -> kubert::lease::Claim {
    kubert::lease::Claim {
        holder: holder.to_string(),
        expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    }
}

fn require_labels(action: ValidationFailureAction) -> Policy {
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
    Policy::from(ClusterPolicy::new(
        "require-labels",
        PolicySpec {
            rules: vec![rule],
            validation_failure_action: action,
            background: None,
        }
        .into(),
    ))
}

fn unlabeled_pod() -> Resource {
    Resource::new(
        "Pod",
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web-0", "namespace": "default" },
        }),
    )
}
