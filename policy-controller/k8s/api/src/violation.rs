use crate::ResourceSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The layout shared by namespaced and cluster-wide violation records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViolationSpec {
    /// The key of the policy: `name` or `namespace/name`.
    pub policy: String,

    pub resource: ResourceSpec,

    /// Every rule of the policy that the resource failed, in rule order.
    #[serde(default)]
    pub rules: Vec<ViolatedRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ViolatedRule {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViolationStatus {
    /// RFC 3339 timestamp of the last time the record was written.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_update_time: String,
}

/// Records the rules a namespaced resource failed in audit mode.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "polis.io",
    version = "v1",
    kind = "PolicyViolation",
    namespaced,
    status = "ViolationStatus",
    derive = "PartialEq",
    shortname = "polv"
)]
pub struct PolicyViolationSpec {
    #[serde(flatten)]
    pub inner: ViolationSpec,
}

/// Records the rules a cluster-scoped resource failed in audit mode.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "polis.io",
    version = "v1",
    kind = "ClusterPolicyViolation",
    status = "ViolationStatus",
    derive = "PartialEq",
    shortname = "cpolv"
)]
pub struct ClusterPolicyViolationSpec {
    #[serde(flatten)]
    pub inner: ViolationSpec,
}

/// Derives a stable object name for the violation record of a (policy, resource) pair.
///
/// The name starts with a readable rendering of the pair and ends with a digest of the exact
/// policy key and resource, so pairs that render alike still get distinct records.
pub fn record_name(policy_key: &str, resource: &ResourceSpec) -> String {
    let digest = crate::digest::short(&[policy_key, &resource.kind, &resource.name]);
    let raw = format!(
        "{}.{}.{}",
        policy_key.replace('/', "."),
        resource.kind,
        resource.name
    )
    .to_ascii_lowercase();

    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    name.truncate(253 - digest.len() - 1);
    let name = name.trim_matches(|c: char| c == '-' || c == '.');
    format!("{name}-{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_are_stable() {
        let pod = ResourceSpec::new("Pod", "default", "Web_0");
        let name = record_name("require-labels", &pod);
        assert!(name.starts_with("require-labels.pod.web-0-"), "{name}");
        assert_eq!(name, record_name("require-labels", &pod));
        let name = record_name("team-a/require-labels", &pod);
        assert!(name.starts_with("team-a.require-labels.pod.web-0-"), "{name}");
    }

    #[test]
    fn record_names_do_not_collide() {
        let pod = ResourceSpec::new("Pod", "default", "web-0");
        assert_ne!(record_name("a.b", &pod), record_name("a/b", &pod));
        assert_ne!(
            record_name("require-labels", &ResourceSpec::new("Pod", "default", "Web_0")),
            record_name("require-labels", &ResourceSpec::new("Pod", "default", "web-0")),
        );
    }

    #[test]
    fn record_names_fit_object_names() {
        let pod = ResourceSpec::new("Pod", "default", "x".repeat(300));
        let name = record_name("require-labels", &pod);
        assert!(name.len() <= 253, "{}", name.len());
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.'));
    }
}
