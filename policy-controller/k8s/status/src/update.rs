use polis_policy_controller_core::{PolicyOutcome, RuleStatus};
use std::time::Duration;

/// A change to one policy's statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    /// The policy key.
    pub policy: String,
    pub delta: Delta,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Delta {
    /// The policy was evaluated against a resource. Each rule counts as applied or failed.
    Execution {
        elapsed: Duration,
        rules: Vec<RuleSample>,
    },

    /// The named rules failed validation and the failure was recorded rather than enforced.
    Violation { rules: Vec<String> },

    /// The named rules caused an admission request to be denied.
    Blocked { rules: Vec<String> },

    /// The named rules changed the resource.
    Mutated { rules: Vec<String> },

    /// A rule created or updated a generated resource.
    Generated { rule: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleSample {
    pub name: String,
    pub elapsed: Duration,
    pub failed: bool,
}

// === impl Update ===

impl Update {
    /// Describes the statistics changes caused by a policy evaluation.
    ///
    /// Policies with no applicable rules produce no updates.
    pub fn from_outcome(outcome: &PolicyOutcome) -> Vec<Self> {
        if outcome.rules.is_empty() {
            return Vec::new();
        }

        let mut updates = vec![Self {
            policy: outcome.policy.clone(),
            delta: Delta::Execution {
                elapsed: outcome.elapsed,
                rules: outcome
                    .rules
                    .iter()
                    .map(|r| RuleSample {
                        name: r.name.clone(),
                        elapsed: r.elapsed,
                        failed: r.status == RuleStatus::Failed,
                    })
                    .collect(),
            },
        }];

        let failed_validation = || {
            outcome
                .rules
                .iter()
                .filter(|r| r.validation_failed)
                .map(|r| r.name.clone())
                .collect::<Vec<_>>()
        };
        if outcome.blocked() {
            updates.push(Self {
                policy: outcome.policy.clone(),
                delta: Delta::Blocked {
                    rules: failed_validation(),
                },
            });
        } else if outcome.violation().is_some() {
            updates.push(Self {
                policy: outcome.policy.clone(),
                delta: Delta::Violation {
                    rules: failed_validation(),
                },
            });
        }

        if outcome.mutated() {
            updates.push(Self {
                policy: outcome.policy.clone(),
                delta: Delta::Mutated {
                    rules: outcome
                        .rules
                        .iter()
                        .filter(|r| r.mutated)
                        .map(|r| r.name.clone())
                        .collect(),
                },
            });
        }

        updates
    }

    pub fn generated(policy: impl ToString, rule: impl ToString) -> Self {
        Self {
            policy: policy.to_string(),
            delta: Delta::Generated {
                rule: rule.to_string(),
            },
        }
    }
}
