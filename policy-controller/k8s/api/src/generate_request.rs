use crate::ResourceSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A durable request to process the generate rules of a policy for one trigger resource.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "polis.io",
    version = "v1",
    kind = "GenerateRequest",
    namespaced,
    status = "GenerateRequestStatus",
    derive = "PartialEq",
    shortname = "gr",
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.policy"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestSpec {
    /// The key of the policy: `name` or `namespace/name`.
    pub policy: String,

    /// The resource whose admission triggered the request.
    pub resource: ResourceSpec,

    #[serde(default)]
    pub context: GenerateRequestContext,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestContext {
    /// The requester of the admission that triggered the request. Absent for requests raised
    /// by a background scan, whose rules are re-evaluated without a requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<RequestInfo>,
}

/// The requester identity captured from an admission request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    /// Namespaced roles, as `namespace:name`.
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub cluster_roles: Vec<String>,

    #[serde(default)]
    pub admission_user_info: AdmissionUserInfo,
}

/// The raw identity carried by an admission request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionUserInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestStatus {
    #[serde(default)]
    pub state: GenerateRequestState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Every resource generated for this request. Only grows; used to clean up generated
    /// resources when the trigger is deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_resources: Vec<ResourceSpec>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum GenerateRequestState {
    /// Not yet processed, or waiting on a recoverable error.
    #[default]
    Pending,

    /// All targets exist. Synchronized requests are reprocessed when their sources change.
    Completed,

    /// Processing failed and is not retried without a new trigger.
    Failed,
}

// === impl GenerateRequest ===

impl GenerateRequest {
    /// Builds the request for a policy's generate rules and one trigger resource.
    ///
    /// The name is derived from the policy key and the trigger, so every admission or scan of
    /// the same trigger addresses the same request.
    pub fn for_trigger(
        policy: impl ToString,
        resource: ResourceSpec,
        user_info: Option<RequestInfo>,
    ) -> Self {
        let policy = policy.to_string();
        let name = Self::name_for(&policy, &resource);
        Self::new(
            &name,
            GenerateRequestSpec {
                policy,
                resource,
                context: GenerateRequestContext { user_info },
            },
        )
    }

    pub fn name_for(policy: &str, resource: &ResourceSpec) -> String {
        let digest = crate::digest::short(&[
            policy,
            &resource.kind,
            &resource.namespace,
            &resource.name,
        ]);
        format!("gr-{digest}")
    }

    /// Whether the request was raised by a background scan rather than an admission.
    pub fn is_background(&self) -> bool {
        self.spec.context.user_info.is_none()
    }

    pub fn state(&self) -> GenerateRequestState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

// === impl RequestInfo ===

impl RequestInfo {
    pub fn new(username: impl ToString, groups: impl IntoIterator<Item = String>) -> Self {
        Self {
            admission_user_info: AdmissionUserInfo {
                username: username.to_string(),
                groups: groups.into_iter().collect(),
                ..AdmissionUserInfo::default()
            },
            ..Self::default()
        }
    }
}

// === impl GenerateRequestStatus ===

impl GenerateRequestStatus {
    pub fn pending(message: impl ToString) -> Self {
        Self {
            state: GenerateRequestState::Pending,
            message: message.to_string(),
            generated_resources: Vec::new(),
        }
    }

    /// Records a generated resource, returning false if it was already recorded.
    pub fn record(&mut self, resource: ResourceSpec) -> bool {
        if self
            .generated_resources
            .iter()
            .any(|r| r.same_object(&resource))
        {
            return false;
        }
        self.generated_resources.push(resource);
        true
    }
}

impl fmt::Display for GenerateRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Completed => f.write_str("Completed"),
            Self::Failed => f.write_str("Failed"),
        }
    }
}
