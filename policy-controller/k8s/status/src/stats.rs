use crate::update::{Delta, RuleSample};
use polis_policy_controller_k8s_api::policy::{PolicyStatus, RuleStats};
use std::time::Duration;

/// Accumulated statistics for one policy.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PolicyStats {
    counts: Counts,
    timing: Timing,

    /// Rules in the order they were first seen.
    rules: Vec<RuleEntry>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct RuleEntry {
    name: String,
    counts: Counts,
    timing: Timing,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct Counts {
    violations: u64,
    failed: u64,
    applied: u64,
    blocked: u64,
    mutated: u64,
    generated: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct Timing {
    total: Duration,
    samples: u32,
}

impl PolicyStats {
    /// Resumes counting from a previously persisted status. Execution times restart.
    pub(crate) fn from_status(status: &PolicyStatus) -> Self {
        Self {
            counts: Counts {
                violations: status.violation_count,
                failed: status.rules_failed_count,
                applied: status.rules_applied_count,
                blocked: status.resources_blocked_count,
                mutated: status.resources_mutated_count,
                generated: status.resources_generated_count,
            },
            timing: Timing::default(),
            rules: status
                .rules
                .iter()
                .map(|r| RuleEntry {
                    name: r.name.clone(),
                    counts: Counts {
                        violations: r.violation_count,
                        failed: r.failed_count,
                        applied: r.applied_count,
                        blocked: r.resources_blocked_count,
                        mutated: r.resources_mutated_count,
                        generated: r.resources_generated_count,
                    },
                    timing: Timing::default(),
                })
                .collect(),
        }
    }

    pub(crate) fn apply(&mut self, delta: Delta) {
        match delta {
            Delta::Execution { elapsed, rules } => {
                self.timing.record(elapsed);
                for RuleSample {
                    name,
                    elapsed,
                    failed,
                } in rules
                {
                    let rule = self.rule(name);
                    rule.timing.record(elapsed);
                    if failed {
                        rule.counts.failed += 1;
                        self.counts.failed += 1;
                    } else {
                        rule.counts.applied += 1;
                        self.counts.applied += 1;
                    }
                }
            }
            Delta::Violation { rules } => {
                self.counts.violations += 1;
                for name in rules {
                    self.rule(name).counts.violations += 1;
                }
            }
            Delta::Blocked { rules } => {
                self.counts.blocked += 1;
                for name in rules {
                    self.rule(name).counts.blocked += 1;
                }
            }
            Delta::Mutated { rules } => {
                self.counts.mutated += 1;
                for name in rules {
                    self.rule(name).counts.mutated += 1;
                }
            }
            Delta::Generated { rule } => {
                self.counts.generated += 1;
                self.rule(rule).counts.generated += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> PolicyStatus {
        PolicyStatus {
            average_execution_time: self.timing.average(),
            violation_count: self.counts.violations,
            rules_failed_count: self.counts.failed,
            rules_applied_count: self.counts.applied,
            resources_blocked_count: self.counts.blocked,
            resources_mutated_count: self.counts.mutated,
            resources_generated_count: self.counts.generated,
            rules: self
                .rules
                .iter()
                .map(|r| RuleStats {
                    name: r.name.clone(),
                    average_execution_time: r.timing.average(),
                    violation_count: r.counts.violations,
                    failed_count: r.counts.failed,
                    applied_count: r.counts.applied,
                    resources_blocked_count: r.counts.blocked,
                    resources_mutated_count: r.counts.mutated,
                    resources_generated_count: r.counts.generated,
                })
                .collect(),
        }
    }

    fn rule(&mut self, name: String) -> &mut RuleEntry {
        let idx = match self.rules.iter().position(|r| r.name == name) {
            Some(idx) => idx,
            None => {
                self.rules.push(RuleEntry {
                    name,
                    ..RuleEntry::default()
                });
                self.rules.len() - 1
            }
        };
        &mut self.rules[idx]
    }
}

impl Timing {
    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.samples = self.samples.saturating_add(1);
    }

    fn average(&self) -> String {
        if self.samples == 0 {
            return String::new();
        }
        format!("{:?}", self.total / self.samples)
    }
}
