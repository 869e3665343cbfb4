#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **stage-runtime** – Async coordination layer of the staging engine.
//!
//! This crate owns the stage's mutable state, the outbound sync driver, the
//! inbound `:meta-pub` reaction loop, and the public API that
//! ties them together with `stage-dag`'s pure commit-DAG core and a
//! `stage-bus-core` peer channel. It is the crate an embedding application
//! depends on directly.

mod api;
mod config;
mod error;
mod materialize;
mod state;
mod sync;

mod loop_task;

pub use api::{merge_cost, Stage};
pub use config::StageConfig;
pub use error::RuntimeError;
pub use loop_task::ObservableValue;
pub use materialize::branch_value;
pub use state::{BranchState, Op, RepoEntry, StageState, StageValue};
