use crate::{labels, ResourceSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One named unit of matching and actions inside a policy.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    #[serde(rename = "match")]
    pub match_resources: MatchResources,

    #[serde(default, rename = "exclude", skip_serializing_if = "Option::is_none")]
    pub exclude_resources: Option<ExcludeResources>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate: Option<Mutation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<Validation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<Generation>,
}

/// Describes the resources (and requesters) a rule applies to.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchResources {
    #[serde(flatten)]
    pub user_info: UserInfo,

    #[serde(default)]
    pub resources: ResourceDescription,
}

/// Exclude blocks share the match block's layout and combinator.
pub type ExcludeResources = MatchResources;

/// Filters on the identity of the requester.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
}

/// An RBAC-style subject: a `User`, `Group` or `ServiceAccount`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Describes a set of resources by kind, name, namespace and labels.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,

    /// May contain `*` and `?` wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<labels::Selector>,
}

/// A precondition: `key <operator> value`.
///
/// Keys and values are arbitrary JSON and may contain `{{ path }}` references that are resolved
/// before comparison.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    #[serde(default)]
    pub key: Value,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionOperator {
    Equal,
    Equals,
    NotEqual,
    NotEquals,
    In,
    NotIn,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Mutation {
    /// A patch-by-example merged into the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Value>,

    /// RFC 6902 operations applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Patch>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Patch {
    pub path: String,
    #[serde(rename = "op")]
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_pattern: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Deny>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Deny {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Describes a resource created when a matching resource is admitted.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    /// The target. `namespace` and `name` may contain `{{ path }}` references.
    #[serde(flatten)]
    pub target: ResourceSpec,

    /// Keeps the target mirrored to its clone source.
    #[serde(default)]
    pub synchronize: bool,

    /// An inline object template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneFrom>,
}

/// The location of the resource used as the source of a generate rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CloneFrom {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

// === impl MatchResources ===

impl MatchResources {
    /// True when neither the resource description nor the user info constrain anything.
    pub fn is_empty(&self) -> bool {
        self.user_info.is_empty() && self.resources.is_empty()
    }
}

impl UserInfo {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.cluster_roles.is_empty() && self.subjects.is_empty()
    }
}

impl ResourceDescription {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
            && self.name.as_deref().map_or(true, str::is_empty)
            && self.namespaces.is_empty()
            && self.selector.is_none()
    }
}
