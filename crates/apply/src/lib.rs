//! Kubor apply engine.
//!
//! Each desired object becomes an [`ApplyUnit`]: fetched, transformed, created
//! or updated, optionally waited on until ready, and rolled back when anything
//! in its [`ApplySet`] fails. The set is all-or-nothing: a failure in execute or
//! wait undoes every unit that was written, newest first.
//!
//! Metrics: `apply_ok`, `apply_err`, `apply_rollbacks`, `wait_timeouts`
//! counters; `apply_latency_ms`, `wait_latency_ms` histograms.

#![forbid(unsafe_code)]

mod diff;
mod error;
mod set;
mod unit;

pub use diff::{diff_summary, strip_noisy, DiffSummary};
pub use error::{ApplyError, BatchError, RollbackOutcome, RollbackReport, Step};
pub use set::ApplySet;
pub use unit::{ApplyUnit, Engine, UnitOptions, UnitState, UnitSummary};
