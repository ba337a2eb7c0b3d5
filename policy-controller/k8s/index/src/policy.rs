use crate::metrics::SizedIndex;
use parking_lot::RwLock;
use polis_policy_controller_core::{normalize, Policy};
use polis_policy_controller_k8s_api::{
    policy::{ClusterPolicy, Policy as NamespacedPolicy},
    ResourceExt,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// The resource kinds that background-enabled policies may match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackgroundKinds {
    /// A rule constrains resources without naming kinds, so every kind is scanned.
    All,
    Listed(BTreeSet<String>),
}

/// Holds all policies, cluster-scoped and namespaced, keyed by policy key.
///
/// Keys are ordered so that every reader evaluates policies in the same order.
#[derive(Debug, Default)]
pub struct Index {
    policies: BTreeMap<String, Arc<Policy>>,
}

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn get(&self, key: &str) -> Option<Arc<Policy>> {
        self.policies.get(key).cloned()
    }

    /// Returns the policies that apply to resources in the given namespace.
    pub fn applicable(&self, namespace: Option<&str>) -> Vec<Arc<Policy>> {
        self.policies
            .values()
            .filter(|p| p.applies_to(namespace))
            .cloned()
            .collect()
    }

    /// Returns the policies that run against existing resources.
    pub fn background(&self) -> Vec<Arc<Policy>> {
        self.policies
            .values()
            .filter(|p| p.spec.background())
            .cloned()
            .collect()
    }

    /// Returns the resource kinds matched by background-enabled policies.
    ///
    /// A rule with an empty resource description never matches without a requester, so it adds
    /// no kinds.
    pub fn background_kinds(&self) -> BackgroundKinds {
        let mut kinds = BTreeSet::new();
        let descriptions = self
            .policies
            .values()
            .filter(|p| p.spec.background())
            .flat_map(|p| p.spec.rules.iter())
            .map(|r| &r.match_resources.resources)
            .filter(|d| !d.is_empty());
        for desc in descriptions {
            if desc.kinds.is_empty() {
                return BackgroundKinds::All;
            }
            kinds.extend(desc.kinds.iter().cloned());
        }
        BackgroundKinds::Listed(kinds)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn insert(&mut self, policy: Policy) {
        let key = policy.key();
        tracing::debug!(policy = %key, rules = policy.spec.rules.len(), "Indexed policy");
        self.policies.insert(key, Arc::new(policy));
    }

    fn remove(&mut self, key: &str) {
        if self.policies.remove(key).is_some() {
            tracing::debug!(policy = %key, "Removed policy");
        }
    }
}

impl kubert::index::IndexClusterResource<ClusterPolicy> for Index {
    fn apply(&mut self, policy: ClusterPolicy) {
        self.insert(Policy::from(policy));
    }

    fn delete(&mut self, name: String) {
        self.remove(&name);
    }
}

impl kubert::index::IndexNamespacedResource<NamespacedPolicy> for Index {
    fn apply(&mut self, policy: NamespacedPolicy) {
        if policy.namespace().is_none() {
            tracing::warn!(name = %policy.name_any(), "Ignoring namespaced policy without a namespace");
            return;
        }
        self.insert(normalize(policy));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove(&format!("{namespace}/{name}"));
    }
}

impl<R> SizedIndex<R> for Index {
    fn size(&self) -> usize {
        self.len()
    }
}
