use crate::{
    core::{evaluate_all, Mode, Policy, Resource},
    index::{self, policy::BackgroundKinds},
    k8s::{self, ClusterPolicyViolation, DynamicObject, ListParams, PolicyViolation, API_GROUP},
    outcomes::Recorder,
    violations::record_ref,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kube::{
    core::TypeMeta,
    discovery::{verbs, ApiResource, Discovery},
};
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{sync::watch, task, time};

/// Periodically evaluates existing resources against background-enabled policies.
pub(crate) struct Scanner {
    client: k8s::Client,
    policies: index::policy::SharedIndex,
    recorder: Recorder,
    claims: watch::Receiver<Arc<Claim>>,
    name: String,
    interval: time::Duration,
}

/// Identifies a violation record by namespace and name.
type RecordRef = (Option<String>, String);

impl Scanner {
    pub(crate) fn new(
        client: k8s::Client,
        policies: index::policy::SharedIndex,
        recorder: Recorder,
        claims: watch::Receiver<Arc<Claim>>,
        name: impl ToString,
        interval: time::Duration,
    ) -> Self {
        Self {
            client,
            policies,
            recorder,
            claims,
            name: name.to_string(),
            interval,
        }
    }

    pub(crate) async fn run(self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::trace!("Not the leader; skipping background scan");
                continue;
            }
            if let Err(error) = self.scan().await {
                tracing::warn!(%error, "Background scan failed");
            }
        }
    }

    async fn scan(&self) -> Result<(), k8s::Error> {
        let (policies, kinds) = {
            let index = self.policies.read();
            (index.background(), index.background_kinds())
        };
        if policies.is_empty() {
            return Ok(());
        }
        let start = time::Instant::now();

        let keys = policies.iter().map(|p| p.key()).collect::<HashSet<_>>();
        let existing = self.existing_records(&keys).await?;
        let discovery = Discovery::new(self.client.clone()).run().await?;

        let mut scanned = HashSet::new();
        let mut reported = HashSet::new();
        let mut resources = 0usize;
        for api_resource in listable(&discovery, &kinds) {
            let kind = api_resource.kind.clone();
            let api = k8s::Api::<DynamicObject>::all_with(self.client.clone(), &api_resource);
            let list = match api.list(&ListParams::default()).await {
                Ok(list) => list,
                Err(error) => {
                    tracing::warn!(%kind, %error, "Failed to list resources");
                    continue;
                }
            };
            scanned.insert(kind.clone());

            for mut obj in list.items {
                obj.types = Some(TypeMeta {
                    api_version: api_resource.api_version.clone(),
                    kind: api_resource.kind.clone(),
                });
                let object = match serde_json::to_value(&obj) {
                    Ok(object) => object,
                    Err(error) => {
                        tracing::warn!(%kind, %error, "Failed to encode resource");
                        continue;
                    }
                };
                let resource = Resource::new(&kind, object);
                reported.extend(evaluate(&self.recorder, &policies, &resource));
                resources += 1;
                task::yield_now().await;
            }
        }

        for (namespace, name) in stale_records(existing, &scanned, &reported) {
            self.recorder.violations().delete(namespace, name);
        }

        tracing::info!(
            policies = policies.len(),
            resources,
            elapsed = ?start.elapsed(),
            "Background scan complete"
        );
        Ok(())
    }

    /// Lists the violation records owned by the given policies, with the kind of the resource
    /// each one describes.
    async fn existing_records(
        &self,
        policies: &HashSet<String>,
    ) -> Result<HashMap<RecordRef, String>, k8s::Error> {
        let params = ListParams::default();
        let mut records = HashMap::new();

        let namespaced = k8s::Api::<PolicyViolation>::all(self.client.clone())
            .list(&params)
            .await?;
        for record in namespaced.items {
            let spec = record.spec.inner;
            if policies.contains(&spec.policy) {
                records.insert(
                    (record.metadata.namespace, record.metadata.name.unwrap_or_default()),
                    spec.resource.kind,
                );
            }
        }

        let cluster = k8s::Api::<ClusterPolicyViolation>::all(self.client.clone())
            .list(&params)
            .await?;
        for record in cluster.items {
            let spec = record.spec.inner;
            if policies.contains(&spec.policy) {
                records.insert(
                    (None, record.metadata.name.unwrap_or_default()),
                    spec.resource.kind,
                );
            }
        }

        Ok(records)
    }
}

/// Returns the served resources to list: those of the given kinds, or every listable resource.
/// Policy and violation resources are never scanned, and a kind served by several groups is
/// listed from the first group only.
fn listable(discovery: &Discovery, kinds: &BackgroundKinds) -> Vec<ApiResource> {
    let mut served = Vec::<ApiResource>::new();
    let resources = discovery
        .groups_alphabetical()
        .into_iter()
        .flat_map(|group| group.recommended_resources());
    for (resource, caps) in resources {
        if resource.group == API_GROUP || !caps.supports_operation(verbs::LIST) {
            continue;
        }
        if served.iter().all(|r| r.kind != resource.kind) {
            served.push(resource);
        }
    }

    match kinds {
        BackgroundKinds::All => served,
        BackgroundKinds::Listed(kinds) => {
            for kind in kinds.iter().filter(|k| served.iter().all(|r| r.kind != **k)) {
                tracing::debug!(%kind, "Kind is not served by the cluster");
            }
            served.retain(|r| kinds.contains(&r.kind));
            served
        }
    }
}

/// Evaluates a resource, records the outcome, and returns the violation records it produced.
fn evaluate(recorder: &Recorder, policies: &[Arc<Policy>], resource: &Resource) -> Vec<RecordRef> {
    let evaluation = evaluate_all(policies.iter().cloned(), resource, Mode::Background);
    recorder.record(&evaluation, resource, None);
    evaluation
        .outcomes
        .iter()
        .filter_map(|outcome| outcome.violation())
        .map(|violation| record_ref(&violation.policy, &violation.resource))
        .collect()
}

/// Returns the existing records that a scan no longer reports.
///
/// Only records of scanned kinds are stale: a kind that could not be listed says nothing about
/// its resources.
fn stale_records(
    existing: HashMap<RecordRef, String>,
    scanned: &HashSet<String>,
    reported: &HashSet<RecordRef>,
) -> Vec<RecordRef> {
    let mut stale = existing
        .into_iter()
        .filter(|(record, kind)| scanned.contains(kind) && !reported.contains(record))
        .map(|(record, _)| record)
        .collect::<Vec<_>>();
    stale.sort();
    stale
}

#[cfg(test)]
mod tests;
