use crate::k8s::{
    policy::{ClusterPolicy, Policy as NamespacedPolicy, PolicySpec, PolicyStatus},
    ObjectMeta,
};

/// Where a policy was declared.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Cluster,
    Namespaced(String),
}

/// A policy in its unified shape.
///
/// Cluster-scoped and namespaced policies share one rule schema; both are normalized into this
/// record so that evaluation and generation have a single code path. The scope tag is the only
/// difference, and converting back re-attaches it.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub scope: Scope,
    pub metadata: ObjectMeta,
    pub spec: PolicySpec,
    pub status: Option<PolicyStatus>,
}

/// Projects a namespaced policy into the unified shape.
pub fn normalize(policy: NamespacedPolicy) -> Policy {
    let NamespacedPolicy {
        metadata,
        spec,
        status,
        ..
    } = policy;
    let namespace = metadata.namespace.clone().unwrap_or_default();
    Policy {
        scope: Scope::Namespaced(namespace),
        metadata,
        spec: spec.inner,
        status,
    }
}

pub fn normalize_all(policies: impl IntoIterator<Item = NamespacedPolicy>) -> Vec<Policy> {
    policies.into_iter().map(normalize).collect()
}

// === impl Policy ===

impl Policy {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Identifies the policy: `name` for cluster policies, `namespace/name` otherwise.
    pub fn key(&self) -> String {
        match &self.scope {
            Scope::Cluster => self.name().to_string(),
            Scope::Namespaced(ns) => format!("{}/{}", ns, self.name()),
        }
    }

    /// Namespaced policies only apply to resources in their own namespace.
    pub fn applies_to(&self, namespace: Option<&str>) -> bool {
        match &self.scope {
            Scope::Cluster => true,
            Scope::Namespaced(ns) => namespace == Some(ns.as_str()),
        }
    }

    pub fn into_cluster(self) -> Result<ClusterPolicy, Self> {
        if self.scope != Scope::Cluster {
            return Err(self);
        }
        let name = self.name().to_string();
        let mut policy = ClusterPolicy::new(&name, self.spec.into());
        policy.metadata = self.metadata;
        policy.status = self.status;
        Ok(policy)
    }

    pub fn into_namespaced(self) -> Result<NamespacedPolicy, Self> {
        let Scope::Namespaced(ns) = &self.scope else {
            return Err(self);
        };
        let mut metadata = self.metadata;
        metadata.namespace = Some(ns.clone());
        let mut policy = NamespacedPolicy::new(
            metadata.name.as_deref().unwrap_or_default(),
            self.spec.into(),
        );
        policy.metadata = metadata;
        policy.status = self.status;
        Ok(policy)
    }
}

impl From<ClusterPolicy> for Policy {
    fn from(policy: ClusterPolicy) -> Self {
        let ClusterPolicy {
            metadata,
            spec,
            status,
            ..
        } = policy;
        Self {
            scope: Scope::Cluster,
            metadata,
            spec: spec.inner,
            status,
        }
    }
}

impl From<NamespacedPolicy> for Policy {
    fn from(policy: NamespacedPolicy) -> Self {
        normalize(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::policy::{MatchResources, ResourceDescription, Rule, ValidationFailureAction};
    use pretty_assertions::assert_eq;

    fn spec() -> PolicySpec {
        PolicySpec {
            rules: vec![Rule {
                name: "check-app".to_string(),
                match_resources: MatchResources {
                    resources: ResourceDescription {
                        kinds: vec!["Pod".to_string()],
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            }],
            validation_failure_action: ValidationFailureAction::Enforce,
            background: Some(false),
        }
    }

    fn namespaced(ns: &str, name: &str) -> NamespacedPolicy {
        let mut policy = NamespacedPolicy::new(name, spec().into());
        policy.metadata.namespace = Some(ns.to_string());
        policy.status = Some(PolicyStatus {
            rules_applied_count: 3,
            ..Default::default()
        });
        policy
    }

    #[test]
    fn namespaced_policy_round_trips() {
        let original = namespaced("team-a", "require-labels");
        let normalized = normalize(original.clone());
        assert_eq!(
            normalized.scope,
            Scope::Namespaced("team-a".to_string())
        );
        assert_eq!(normalized.key(), "team-a/require-labels");
        assert_eq!(normalized.spec, spec());

        let restored = normalized.into_namespaced().expect("policy must be namespaced");
        assert_eq!(restored, original);
    }

    #[test]
    fn cluster_policy_round_trips() {
        let original = ClusterPolicy::new("require-labels", spec().into());
        let normalized = Policy::from(original.clone());
        assert_eq!(normalized.key(), "require-labels");
        assert!(normalized.clone().into_namespaced().is_err());
        assert_eq!(normalized.into_cluster().expect("cluster policy"), original);
    }

    #[test]
    fn normalizes_lists() {
        let policies = normalize_all(vec![namespaced("a", "p0"), namespaced("b", "p1")]);
        let keys = policies.iter().map(Policy::key).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a/p0", "b/p1"]);
    }

    #[test]
    fn namespaced_policies_only_apply_locally() {
        let policy = normalize(namespaced("team-a", "p"));
        assert!(policy.applies_to(Some("team-a")));
        assert!(!policy.applies_to(Some("team-b")));
        assert!(!policy.applies_to(None));

        let cluster = Policy::from(ClusterPolicy::new("p", spec().into()));
        assert!(cluster.applies_to(Some("team-b")));
        assert!(cluster.applies_to(None));
    }
}
