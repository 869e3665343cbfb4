#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **stage-dag** – Deterministic commit-DAG core of the staging engine.
//!
//! This crate owns everything that can be computed purely from a
//! repository's causal order and stored commit objects: history
//! linearization, memoized value materialization, conflict summarization
//! between diverging branch heads, and the metadata algebra used to
//! reconcile repository state received from peers. It knows nothing about
//! networking or the outward-facing staging API — those live in
//! `stage-bus-core` and `stage-runtime`.

mod cache;
mod conflict;
mod error;
mod evaluator;
mod history;
mod materializer;
mod metadata;

pub use cache::CommitValueCache;
pub use conflict::{
    isolate_branch, lowest_common_ancestors, summarize_conflict, summarize_conflict_multi, Conflict, ConflictCommit,
};
pub use error::DagError;
pub use evaluator::{BuiltinEvaluator, Evaluator};
pub use history::{ancestors_inclusive, history};
pub use materializer::{commit_value, store_blob_trans, trans_apply};
pub use metadata::{commit, fork, merge, new_repository, update};
