//! Tabula Ops: writes and their cascading refreshes.
//!
//! Every UI write goes through [`MutationCoordinator`]. It is the only thing
//! that triggers cascades, using the static [`CascadeGraph`] to decide which
//! other views must re-fetch their list or counters afterwards.

#![forbid(unsafe_code)]

pub mod cascade;
pub mod coordinator;

pub use cascade::{Arity, CascadeGraph, CascadeRule, RefreshScope, RefreshTarget};
pub use coordinator::{CascadeHandle, CascadeReport, MutationCoordinator, MutationOutcome, Notice};
