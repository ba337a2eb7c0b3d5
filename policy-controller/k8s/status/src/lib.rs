#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod stats;
mod update;

#[cfg(test)]
mod tests;

pub use self::{
    index::{updates, Controller, ControllerMetrics, Index, IndexMetrics, Patch, Sender, SharedIndex},
    update::{Delta, RuleSample, Update},
};
