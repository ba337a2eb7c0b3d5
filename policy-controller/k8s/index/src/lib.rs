//! Polis Policy Controller indexes
//!
//! The admission webhook, the background scanner and the generate controller all need fast,
//! synchronous access to cluster state that changes underneath them. These indexes are fed by
//! kubert watches and read under a lock:
//!
//! - [`policy::Index`] holds every `ClusterPolicy` and `Policy`, normalized into a single
//!   [`Policy`](polis_policy_controller_core::Policy) shape and keyed by policy key.
//! - [`rbac::Index`] holds `RoleBinding` and `ClusterRoleBinding` subjects so that a requester's
//!   roles and cluster roles can be resolved for user-info matching.
//!
//! ```text
//! [ ClusterPolicy ] -+
//!                    +-> [ policy::Index ] -> admission, background, generate
//! [ Policy ] --------+
//!
//! [ RoleBinding ] ---------+
//!                          +-> [ rbac::Index ] -> RequestInfo
//! [ ClusterRoleBinding ] --+
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
pub mod policy;
pub mod rbac;


pub use self::metrics::IndexMetrics;
