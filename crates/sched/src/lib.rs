//! Systematic concurrency testing with cooperative logical threads.
//!
//! A [`Scenario`] runs a set of logical threads that hand control to each
//! other only at labelled yield points ([`transfer`], [`yield_point`]). The
//! scenario records every scheduling decision in an [`ActionLog`], searches
//! the space of decisions depth-first (`explore_exists`, `explore_forall`)
//! and replays a saved log exactly (`replay`).
//!
//! Subject code signals "this run is not interesting" by returning
//! [`Pruned`] (see [`check`]); a genuine bug is a panic and propagates out of
//! the search.

pub mod action;
pub mod check;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod explorer;
pub mod group;
pub mod runtime;
pub mod sample;
pub mod scenario;
pub mod until;

pub use action::{ActionLog, ChoiceRecord};
pub use config::ExploreConfig;
pub use coroutine::{Ident, Target, ThreadId, ENDING_LABEL, MAIN_LABEL};
pub use error::{Outcome, Pruned, SchedError};
pub use explorer::{Mode, TransferEvent};
pub use runtime::{in_scenario, transfer, yield_point};
pub use scenario::{Driver, Report, RunOutcome, Scenario};
pub use until::YieldEvent;
