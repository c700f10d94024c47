//! ApplicationSet controller
//!
//! [`reconcile`] and [`error_policy`] plug into `kube::runtime::Controller`.
//! All API access goes through [`AppSetClient`]; [`KubeClientImpl`] is the
//! production implementation.

mod application_set;
mod client;
mod plan;

pub use application_set::{
    error_policy, reconcile, run_pass, Context, ContextBuilder, FailedUnit, PassReport,
    UnitFailure,
};
pub use client::{is_owned_by, AppSetClient, KubeClientImpl};
pub use plan::{overlay, plan, Operation, Plan};
