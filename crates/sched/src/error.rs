//! Error taxonomy for the scheduler.
//!
//! Two channels exist on purpose:
//! - [`Pruned`] is the subject-facing signal that the current run is not
//!   interesting (an assumption did not hold). Subject code propagates it with
//!   `?`; only the scenario's run wrapper consumes it.
//! - [`SchedError`] is returned by the driver surface (`explore_*`, `replay`,
//!   `save`, `load`) and distinguishes "no path", "stale recording" and
//!   protocol misuse.
//!
//! Assertion failures are ordinary panics and are never represented here.

use std::any::Any;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An assumption failure: the current run is pruned from the search.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("assumption failure: {reason}")]
pub struct Pruned {
    reason: String,
}

impl Pruned {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Outcome of a logical thread body, a hook, or a scenario body.
pub type Outcome = Result<(), Pruned>;

/// Errors surfaced by the scenario driver.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Exploration exhausted every backtrack frontier without a complete run.
    #[error("no feasible execution")]
    NoFeasibleExecution,

    /// A replayed schedule hit an assumption failure.
    #[error("replay failed: {reason}")]
    ReplayFailed { reason: String },

    /// The recorded log no longer matches the code path it was recorded on.
    #[error("replay mismatch at record {index}: expected `{expected}`, observed `{observed}`")]
    ReplayMismatch {
        index: usize,
        expected: String,
        observed: String,
    },

    /// The run reached a scheduling decision past the end of a replayed log.
    #[error("replay log exhausted at `{observed}`")]
    LogExhausted { observed: String },

    /// The configured run limit stopped the search.
    #[error("run limit of {limit} runs reached")]
    RunLimit { limit: u64 },

    #[error("unknown thread `{0}`")]
    UnknownThread(String),

    #[error("thread `{0}` is already a member")]
    DuplicateThread(String),

    #[error("target `{0}` is terminated")]
    TargetTerminated(String),

    #[error("label `{0}` is reserved")]
    ReservedLabel(String),

    #[error("transfer without a yield label")]
    MissingLabel,

    #[error("label {label:?} cannot be written to an action log: {reason}")]
    InvalidLabel { label: String, reason: &'static str },

    #[error("yield label `{label}` used at {first} and {second}")]
    AmbiguousLabel {
        label: String,
        first: String,
        second: String,
    },

    #[error("failed to spawn worker for `{label}`: {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed action log line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("no action log path configured")]
    NoLogPath,

    #[error("action log I/O on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SchedError {
    /// True for errors that indicate a stale or inconsistent recording.
    pub fn is_replay_mismatch(&self) -> bool {
        matches!(self, Self::ReplayMismatch { .. } | Self::LogExhausted { .. })
    }
}

/// A pending fault raised during a run, stored on the thread group until the
/// driver regains control.
pub(crate) enum Fault {
    Pruned(Pruned),
    Fatal(SchedError),
    Panic(Box<dyn Any + Send + 'static>),
}

impl Fault {
    fn severity(&self) -> u8 {
        match self {
            Fault::Pruned(_) => 0,
            Fault::Fatal(_) => 1,
            Fault::Panic(_) => 2,
        }
    }

    /// Keep the more severe of `slot` and `self`.
    pub(crate) fn raise_into(self, slot: &mut Option<Fault>) {
        let keep = slot
            .as_ref()
            .is_some_and(|existing| existing.severity() >= self.severity());
        if !keep {
            *slot = Some(self);
        }
    }
}

impl std::fmt::Debug for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Pruned(p) => write!(f, "Pruned({})", p.reason()),
            Fault::Fatal(e) => write!(f, "Fatal({e})"),
            Fault::Panic(_) => write!(f, "Panic(..)"),
        }
    }
}
