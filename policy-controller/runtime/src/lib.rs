pub use polis_policy_controller_core as core;
pub use polis_policy_controller_k8s_api as k8s;
pub use polis_policy_controller_k8s_generate as generate;
pub use polis_policy_controller_k8s_index as index;
pub use polis_policy_controller_k8s_status as status;

mod admission;
mod args;
mod background;
mod index_list;
mod outcomes;
mod violations;

mod lease;
pub use self::{
    admission::{Admission, AdmissionMetrics, FailurePolicy},
    args::Args,
};
