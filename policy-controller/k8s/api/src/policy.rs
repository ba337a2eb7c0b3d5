pub mod rule;
pub mod status;

pub use self::{
    rule::{
        CloneFrom, Condition, ConditionOperator, Deny, ExcludeResources, Generation,
        MatchResources, Mutation, Patch, ResourceDescription, Rule, Subject, UserInfo, Validation,
    },
    status::{PolicyStatus, RuleStats},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The rule schema shared by cluster-scoped and namespaced policies.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Rules are evaluated in declaration order.
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub validation_failure_action: ValidationFailureAction,

    /// Whether rules also run against existing resources. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,
}

/// Describes what happens to a resource that fails validation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ValidationFailureAction {
    /// The failure is recorded as a violation and the resource is admitted.
    #[default]
    Audit,

    /// The admission request is denied.
    Enforce,
}

/// A set of rules applied to resources across the cluster.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "polis.io",
    version = "v1",
    kind = "ClusterPolicy",
    status = "PolicyStatus",
    derive = "PartialEq",
    shortname = "cpol"
)]
pub struct ClusterPolicySpec {
    #[serde(flatten)]
    pub inner: PolicySpec,
}

/// A set of rules applied to resources in the policy's namespace.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "polis.io",
    version = "v1",
    kind = "Policy",
    namespaced,
    status = "PolicyStatus",
    derive = "PartialEq",
    shortname = "pol"
)]
pub struct NamespacedPolicySpec {
    #[serde(flatten)]
    pub inner: PolicySpec,
}

// === impl PolicySpec ===

impl PolicySpec {
    pub fn background(&self) -> bool {
        self.background.unwrap_or(true)
    }

    pub fn has_generate_rules(&self) -> bool {
        self.rules.iter().any(|r| r.generate.is_some())
    }
}

impl From<PolicySpec> for ClusterPolicySpec {
    fn from(inner: PolicySpec) -> Self {
        Self { inner }
    }
}

impl From<PolicySpec> for NamespacedPolicySpec {
    fn from(inner: PolicySpec) -> Self {
        Self { inner }
    }
}
