use crate::k8s::{
    self, labels,
    violation::{record_name, ClusterPolicyViolationSpec, PolicyViolationSpec},
    ClusterPolicyViolation, PolicyViolation, ResourceSpec, ViolationSpec,
};
use kube::api::DeleteParams;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Queues violation record writes for the [`run`] task.
#[derive(Clone, Debug)]
pub(crate) struct Writer {
    tx: mpsc::Sender<Op>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Op {
    /// Creates or replaces the record for the violation's (policy, resource) pair.
    Apply(ViolationSpec),

    /// Removes the record of a resource that no longer violates the policy.
    Delete {
        namespace: Option<String>,
        name: String,
    },
}

impl Writer {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Op>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub(crate) fn apply(&self, violation: ViolationSpec) {
        self.send(Op::Apply(violation));
    }

    pub(crate) fn delete(&self, namespace: Option<String>, name: String) {
        self.send(Op::Delete { namespace, name });
    }

    fn send(&self, op: Op) {
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op)) => {
                tracing::warn!(?op, "Violation queue is full; dropping write");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Violation writer has stopped");
            }
        }
    }
}

/// The name and namespace of the record describing `resource`'s violation of `policy`.
///
/// Namespaced resources are recorded as `PolicyViolation`s in their own namespace; cluster-scoped
/// resources as `ClusterPolicyViolation`s.
pub(crate) fn record_ref(policy: &str, resource: &ResourceSpec) -> (Option<String>, String) {
    (
        resource.namespace().map(str::to_string),
        record_name(policy, resource),
    )
}

/// Writes queued violation records until every [`Writer`] is dropped.
pub(crate) async fn run(client: k8s::Client, mut ops: mpsc::Receiver<Op>) {
    while let Some(op) = ops.recv().await {
        let res = match op {
            Op::Apply(violation) => apply(&client, violation).await,
            Op::Delete { namespace, name } => delete(&client, namespace.as_deref(), &name).await,
        };
        if let Err(error) = res {
            tracing::warn!(%error, "Failed to write violation record");
        }
    }
    tracing::debug!("Violation writer stopped");
}

async fn apply(client: &k8s::Client, violation: ViolationSpec) -> Result<(), k8s::Error> {
    let (namespace, name) = record_ref(&violation.policy, &violation.resource);
    let meta_labels = labels::for_policy(&violation.policy);
    let params = k8s::PatchParams::apply(k8s::FIELD_MANAGER).force();
    let status = k8s::Patch::Merge(json!({
        "status": { "lastUpdateTime": chrono::Utc::now().to_rfc3339() },
    }));
    tracing::debug!(policy = %violation.policy, resource = %violation.resource, %name, "Recording violation");

    match namespace {
        Some(ns) => {
            let mut record = PolicyViolation::new(&name, PolicyViolationSpec { inner: violation });
            record.metadata.namespace = Some(ns.clone());
            record.metadata.labels = Some(meta_labels);
            let api = k8s::Api::<PolicyViolation>::namespaced(client.clone(), &ns);
            api.patch(&name, &params, &k8s::Patch::Apply(&record)).await?;
            api.patch_status(&name, &k8s::PatchParams::default(), &status)
                .await?;
        }
        None => {
            let mut record =
                ClusterPolicyViolation::new(&name, ClusterPolicyViolationSpec { inner: violation });
            record.metadata.labels = Some(meta_labels);
            let api = k8s::Api::<ClusterPolicyViolation>::all(client.clone());
            api.patch(&name, &params, &k8s::Patch::Apply(&record)).await?;
            api.patch_status(&name, &k8s::PatchParams::default(), &status)
                .await?;
        }
    }
    Ok(())
}

async fn delete(
    client: &k8s::Client,
    namespace: Option<&str>,
    name: &str,
) -> Result<(), k8s::Error> {
    let res = match namespace {
        Some(ns) => k8s::Api::<PolicyViolation>::namespaced(client.clone(), ns)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ()),
        None => k8s::Api::<ClusterPolicyViolation>::all(client.clone())
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ()),
    };
    match res {
        Ok(()) => {
            tracing::info!(?namespace, %name, "Removed stale violation record");
            Ok(())
        }
        Err(k8s::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn records_follow_resource_scope() {
        let pod = ResourceSpec::new("Pod", "default", "web-0");
        assert_eq!(
            record_ref("require-labels", &pod),
            (
                Some("default".to_string()),
                record_name("require-labels", &pod)
            )
        );

        let ns = ResourceSpec::new("Namespace", "", "team-a");
        assert_eq!(
            record_ref("require-labels", &ns),
            (None, record_name("require-labels", &ns))
        );
    }

    #[tokio::test]
    async fn full_queue_drops_writes() {
        let (writer, mut rx) = Writer::channel(1);
        writer.delete(None, "a".to_string());
        writer.delete(None, "b".to_string());
        drop(writer);

        assert_eq!(
            rx.recv().await,
            Some(Op::Delete {
                namespace: None,
                name: "a".to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
    }
}
