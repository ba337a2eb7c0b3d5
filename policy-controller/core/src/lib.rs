#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Policy evaluation.
//!
//! A resource is evaluated against each applicable policy's rules in order. For every rule the
//! [`matcher`] decides whether its match/exclude blocks apply, the rule's preconditions are
//! resolved against a binding [`condition::Context`], and each present action runs:
//!
//! ```text
//! [ Resource ] -> [ match/exclude ] -> [ preconditions ] -> mutate -> validate -> generate
//! ```
//!
//! Evaluation is pure: outcomes are returned to the caller, which forwards them to the status
//! aggregator, the violation writer and the generate controller.

mod anchor;
pub mod condition;
pub mod engine;
pub mod matcher;
pub mod mutate;
pub mod pattern;
pub mod policy;
mod resource;
mod wildcard;

pub use self::{
    engine::{evaluate, evaluate_all, Evaluation, PolicyOutcome, RuleOutcome, RuleStatus},
    policy::{normalize, normalize_all, Policy, Scope},
    resource::{Mode, Resource},
};
pub use polis_policy_controller_k8s_api as k8s;

pub const POLICY_CONTROLLER_NAME: &str = "polis.io/policy-controller";
