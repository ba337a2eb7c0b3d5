#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod digest;
pub mod generate_request;
pub mod labels;
pub mod policy;
mod resource_spec;
pub mod violation;

pub use self::{
    generate_request::{
        AdmissionUserInfo, GenerateRequest, GenerateRequestContext, GenerateRequestSpec,
        GenerateRequestState, GenerateRequestStatus, RequestInfo,
    },
    labels::Labels,
    resource_spec::ResourceSpec,
    violation::{
        ClusterPolicyViolation, PolicyViolation, ViolatedRule, ViolationSpec, ViolationStatus,
    },
};
pub use k8s_openapi::api::{
    self,
    rbac::v1::{ClusterRoleBinding, RoleBinding},
};
pub use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    core::{ApiResource, GroupVersionKind},
    runtime::watcher,
    Client, Error, Resource, ResourceExt,
};

/// The API group served by the controller's own resources.
pub const API_GROUP: &str = "polis.io";

/// The field manager used for all server-side applies and status patches.
pub const FIELD_MANAGER: &str = "polis-policy-controller";
