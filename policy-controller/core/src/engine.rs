use crate::{
    condition::{self, Context},
    k8s::{
        policy::{Rule, Validation, ValidationFailureAction},
        ResourceSpec, ViolatedRule, ViolationSpec,
    },
    matcher, mutate, pattern, Mode, Policy, Resource,
};
use serde_json::Value as Json;
use std::{
    borrow::Borrow,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// The result of evaluating one policy against one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyOutcome {
    /// The policy key.
    pub policy: String,
    pub action: ValidationFailureAction,
    pub resource: ResourceSpec,

    /// One entry per rule that applied and passed its preconditions, in rule order.
    pub rules: Vec<RuleOutcome>,

    pub elapsed: Duration,

    /// The resource after all of the policy's mutations, if any rule changed it.
    pub patched: Option<Json>,

    pub background: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleOutcome {
    pub name: String,
    pub status: RuleStatus,
    pub message: String,
    pub elapsed: Duration,

    /// The rule's mutation changed the resource.
    pub mutated: bool,

    /// The rule's validation did not pass.
    pub validation_failed: bool,

    /// The rule carries a generate action that should be handed to the generate controller.
    pub generate: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuleStatus {
    Applied,
    Failed,
}

/// The result of evaluating every applicable policy against one resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub outcomes: Vec<PolicyOutcome>,

    /// The resource after all mutations, if any policy changed it.
    pub patched: Option<Json>,
}

/// Evaluates the applicable policies in order, feeding each policy the resource as mutated by
/// the previous ones.
///
/// Namespaced policies only see resources in their own namespace, and background scans skip
/// policies that opt out of them. Evaluation stops after the first policy that blocks the
/// request; outcomes of policies evaluated up to that point are kept.
pub fn evaluate_all<P: Borrow<Policy>>(
    policies: impl IntoIterator<Item = P>,
    resource: &Resource,
    mode: Mode<'_>,
) -> Evaluation {
    let mut current = resource.clone();
    let mut outcomes = Vec::new();

    for policy in policies {
        let policy = policy.borrow();
        if !policy.applies_to(resource.namespace()) {
            continue;
        }
        if mode.is_background() && !policy.spec.background() {
            continue;
        }

        let outcome = evaluate(policy, &current, mode);
        if let Some(patched) = outcome.patched.as_ref() {
            current = current.with_object(patched.clone());
        }
        let blocked = outcome.blocked();
        outcomes.push(outcome);
        if blocked {
            debug!(policy = %policy.key(), resource = %resource.spec(), "Request blocked");
            break;
        }
    }

    let patched = (current.object != resource.object).then_some(current.object);
    Evaluation { outcomes, patched }
}

/// Evaluates a single policy's rules in declaration order.
pub fn evaluate(policy: &Policy, resource: &Resource, mode: Mode<'_>) -> PolicyOutcome {
    let start = Instant::now();
    let policy_key = policy.key();
    let mut current = resource.clone();
    let mut rules = Vec::new();

    for rule in policy.spec.rules.iter() {
        let rule_start = Instant::now();
        if !matcher::applies(rule, &current, mode) {
            continue;
        }

        let ctx = Context::new(&current, mode);
        match condition::evaluate(&rule.preconditions, &ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(policy = %policy_key, rule = %rule.name, "Preconditions not met");
                continue;
            }
            Err(error) => {
                debug!(
                    policy = %policy_key,
                    rule = %rule.name,
                    %error,
                    "Preconditions could not be evaluated"
                );
                continue;
            }
        }

        let mut outcome = RuleOutcome::new(&rule.name);

        if let Some(mutation) = rule.mutate.as_ref().filter(|_| !mode.is_background()) {
            match mutate::mutate(&current.object, mutation) {
                Ok(object) if object != current.object => {
                    current = current.with_object(object);
                    outcome.mutated = true;
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(policy = %policy_key, rule = %rule.name, %error, "Mutation failed");
                    outcome.fail(format!("mutation failed: {error}"));
                }
            }
        }

        if let Some(validation) = rule.validate.as_ref() {
            if let Err(message) = validate(rule, validation, &current, mode) {
                outcome.validation_failed = true;
                outcome.fail(message);
            }
        }

        outcome.generate = rule.generate.is_some() && outcome.status == RuleStatus::Applied;
        outcome.elapsed = rule_start.elapsed();
        rules.push(outcome);
    }

    PolicyOutcome {
        policy: policy_key,
        action: policy.spec.validation_failure_action,
        resource: resource.spec(),
        rules,
        elapsed: start.elapsed(),
        patched: (current.object != resource.object).then_some(current.object),
        background: mode.is_background(),
    }
}

/// Runs a rule's validation, returning the failure message.
///
/// When the rule has patterns, it passes iff one of them matches. Otherwise its deny conditions
/// decide; conditions that cannot be resolved do not deny.
fn validate(
    rule: &Rule,
    validation: &Validation,
    resource: &Resource,
    mode: Mode<'_>,
) -> Result<(), String> {
    let patterns = validation
        .pattern
        .iter()
        .chain(validation.any_pattern.iter())
        .collect::<Vec<_>>();

    if !patterns.is_empty() {
        let mut first_error = None;
        for p in patterns {
            match pattern::validate(&resource.object, p) {
                Ok(()) => return Ok(()),
                Err(error) if first_error.is_none() => first_error = Some(error),
                Err(_) => {}
            }
        }
        return Err(validation.message.clone().unwrap_or_else(|| match first_error {
            Some(error) => format!("validation rule '{}' failed: {error}", rule.name),
            None => format!("validation rule '{}' failed", rule.name),
        }));
    }

    if let Some(deny) = validation.deny.as_ref() {
        let ctx = Context::new(resource, mode);
        match condition::evaluate(&deny.conditions, &ctx) {
            Ok(true) => {
                return Err(validation
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("request denied by rule '{}'", rule.name)));
            }
            Ok(false) => {}
            Err(error) => {
                warn!(rule = %rule.name, %error, "Deny conditions could not be evaluated");
            }
        }
    }

    Ok(())
}

// === impl RuleOutcome ===

impl RuleOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: RuleStatus::Applied,
            message: String::new(),
            elapsed: Duration::ZERO,
            mutated: false,
            validation_failed: false,
            generate: false,
        }
    }

    fn fail(&mut self, message: String) {
        self.status = RuleStatus::Failed;
        if self.message.is_empty() {
            self.message = message;
        } else {
            self.message = format!("{}; {}", self.message, message);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RuleStatus::Failed
    }
}

// === impl PolicyOutcome ===

impl PolicyOutcome {
    pub fn applied(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.rules.iter().filter(|r| !r.is_failed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.rules.iter().filter(|r| r.is_failed())
    }

    fn validation_failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.rules.iter().filter(|r| r.validation_failed)
    }

    /// True if an enforced validation failed on a live admission request.
    pub fn blocked(&self) -> bool {
        !self.background
            && self.action == ValidationFailureAction::Enforce
            && self.validation_failures().next().is_some()
    }

    pub fn mutated(&self) -> bool {
        self.rules.iter().any(|r| r.mutated)
    }

    pub fn generate_requested(&self) -> bool {
        self.rules.iter().any(|r| r.generate)
    }

    /// The denial message of a blocking outcome.
    pub fn denial(&self) -> Option<String> {
        if !self.blocked() {
            return None;
        }
        let messages = self
            .validation_failures()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>();
        Some(messages.join("; "))
    }

    /// The violation to record: validation failures that did not block the request.
    pub fn violation(&self) -> Option<ViolationSpec> {
        if self.blocked() {
            return None;
        }
        let rules = self
            .validation_failures()
            .map(|r| ViolatedRule {
                name: r.name.clone(),
                type_: "Validation".to_string(),
                message: r.message.clone(),
            })
            .collect::<Vec<_>>();
        if rules.is_empty() {
            return None;
        }
        Some(ViolationSpec {
            policy: self.policy.clone(),
            resource: self.resource.clone(),
            rules,
        })
    }
}

// === impl Evaluation ===

impl Evaluation {
    /// The message to deny the request with, if any policy blocked it.
    pub fn denied(&self) -> Option<String> {
        let messages = self
            .outcomes
            .iter()
            .filter_map(PolicyOutcome::denial)
            .collect::<Vec<_>>();
        if messages.is_empty() {
            return None;
        }
        Some(messages.join("; "))
    }
}
