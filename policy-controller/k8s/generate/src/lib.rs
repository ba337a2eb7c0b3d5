//! Generate request processing.
//!
//! When an admitted resource matches a rule with a generate action, the admission path submits
//! a durable `GenerateRequest`, named after the policy and trigger, instead of creating the
//! target inline. [`Submissions`] stores it, retrying transient API failures. The
//! [`Controller`] watches those requests and hands them to the [`Reconciler`], which re-reads
//! the trigger, resolves the rule's payload (inline data or a clone source) and creates or
//! updates the target.
//!
//! ```text
//! Pending --(targets created)--> Completed
//!    |  ^                          |
//!    |  +--(recoverable error)     +--(synchronize: source changed, re-propagate)
//!    +----(terminal error, or out of attempts)--> Failed
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod error;
mod reconcile;
mod store;
mod submit;


pub use self::{
    controller::{Controller, Index, Key, SharedIndex},
    error::Error,
    reconcile::{Disposition, ReconcileMetrics, Reconciler},
    store::{KubeRequests, KubeResources, Requests, Resources},
    submit::{submissions, SubmitMetrics, Submissions, Submitter},
};
