use crate::metrics::SizedIndex;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use polis_policy_controller_k8s_api::{
    api::rbac::v1::{RoleRef, Subject},
    AdmissionUserInfo, ClusterRoleBinding, RequestInfo, ResourceExt, RoleBinding,
};
use std::{collections::BTreeSet, sync::Arc};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Indexes role bindings so that the roles held by a requester can be resolved.
#[derive(Debug, Default)]
pub struct Index {
    role_bindings: HashMap<(String, String), Binding>,
    cluster_role_bindings: HashMap<String, Binding>,
}

#[derive(Clone, Debug, PartialEq)]
struct Binding {
    role_ref: RoleRef,
    subjects: Vec<Subject>,
}

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Builds the full requester context for an admission user.
    ///
    /// Roles bound through a `RoleBinding` are reported as `namespace:role`; cluster roles are
    /// reported by name, whether bound cluster-wide or within a namespace.
    pub fn request_info(&self, user: AdmissionUserInfo) -> RequestInfo {
        let mut roles = BTreeSet::new();
        let mut cluster_roles = BTreeSet::new();

        for ((ns, _), binding) in self.role_bindings.iter() {
            if !binding.subjects.iter().any(|s| subject_matches(s, &user, Some(ns))) {
                continue;
            }
            if binding.role_ref.kind == "ClusterRole" {
                cluster_roles.insert(binding.role_ref.name.clone());
            } else {
                roles.insert(format!("{}:{}", ns, binding.role_ref.name));
            }
        }

        for binding in self.cluster_role_bindings.values() {
            if binding.subjects.iter().any(|s| subject_matches(s, &user, None)) {
                cluster_roles.insert(binding.role_ref.name.clone());
            }
        }

        RequestInfo {
            roles: roles.into_iter().collect(),
            cluster_roles: cluster_roles.into_iter().collect(),
            admission_user_info: user,
        }
    }
}

fn subject_matches(subject: &Subject, user: &AdmissionUserInfo, binding_ns: Option<&str>) -> bool {
    match subject.kind.as_str() {
        "User" => subject.name == user.username,
        "Group" => user.groups.iter().any(|g| *g == subject.name),
        "ServiceAccount" => {
            // Service account subjects of a role binding default to the binding's namespace.
            let ns = subject.namespace.as_deref().or(binding_ns).unwrap_or_default();
            user.username == format!("system:serviceaccount:{}:{}", ns, subject.name)
        }
        _ => false,
    }
}

impl kubert::index::IndexNamespacedResource<RoleBinding> for Index {
    fn apply(&mut self, rb: RoleBinding) {
        let ns = rb.namespace().unwrap_or_default();
        let name = rb.name_unchecked();
        let binding = Binding {
            role_ref: rb.role_ref,
            subjects: rb.subjects.unwrap_or_default(),
        };
        self.role_bindings.insert((ns, name), binding);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.role_bindings.remove(&(namespace, name));
    }
}

impl kubert::index::IndexClusterResource<ClusterRoleBinding> for Index {
    fn apply(&mut self, crb: ClusterRoleBinding) {
        let name = crb.name_unchecked();
        let binding = Binding {
            role_ref: crb.role_ref,
            subjects: crb.subjects.unwrap_or_default(),
        };
        self.cluster_role_bindings.insert(name, binding);
    }

    fn delete(&mut self, name: String) {
        self.cluster_role_bindings.remove(&name);
    }
}

impl SizedIndex<RoleBinding> for Index {
    fn size(&self) -> usize {
        self.role_bindings.len()
    }
}

impl SizedIndex<ClusterRoleBinding> for Index {
    fn size(&self) -> usize {
        self.cluster_role_bindings.len()
    }
}
