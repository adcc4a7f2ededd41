//! Logical thread state and identities.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Outcome, SchedError};

pub const MAIN_LABEL: &str = "main";
pub const STARTING_LABEL: &str = "starting";
pub const FINISHING_LABEL: &str = "finishing";
pub const ENDING_LABEL: &str = "ending";

/// Labels the engine emits on its own behalf. Subject code may not use them.
pub(crate) const RESERVED_LABELS: [&str; 4] =
    [MAIN_LABEL, STARTING_LABEL, FINISHING_LABEL, ENDING_LABEL];

pub(crate) fn is_reserved(label: &str) -> bool {
    RESERVED_LABELS.contains(&label)
}

/// Reject labels that would not survive a save/load of the action log.
pub fn validate_label(label: &str) -> Result<(), SchedError> {
    let reason = if label.is_empty() {
        "empty"
    } else if label.contains(',') {
        "contains `,`"
    } else if label.contains("->") {
        "contains `->`"
    } else if label.contains(['\n', '\r']) {
        "contains a line break"
    } else if label.starts_with(char::is_whitespace) || label.ends_with(char::is_whitespace) {
        "leading or trailing whitespace"
    } else {
        return Ok(());
    };
    Err(SchedError::InvalidLabel { label: label.to_string(), reason })
}

/// Index of a logical thread within its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Who holds control: the driving context or one logical thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ident {
    Main,
    Thread(ThreadId),
}

impl Ident {
    pub fn is_main(self) -> bool {
        matches!(self, Ident::Main)
    }
}

/// Where a transfer should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target<'a> {
    /// The driving context.
    Main,
    /// Whoever last resumed the current thread (Main if none). From Main this
    /// leaves the choice to the scenario.
    Caller,
    /// A named member of the current group.
    Thread(&'a str),
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Main => f.write_str(MAIN_LABEL),
            Target::Caller => f.write_str("<caller>"),
            Target::Thread(label) => f.write_str(label),
        }
    }
}

/// Body of a logical thread. Rebinding a thread replaces it.
pub type ThreadFn = Arc<dyn Fn() -> Outcome + Send + Sync + 'static>;

/// Control state of one logical thread.
pub struct LogicalThread {
    pub(crate) label: String,
    pub(crate) body: ThreadFn,
    /// Identity that last resumed this thread.
    pub(crate) caller: Option<Ident>,
    pub(crate) started: bool,
    pub(crate) ended: bool,
    /// 0 = unbounded, 1 = run to completion, n > 1 = n - 1 more preemptions.
    pub(crate) budget: u32,
    pub(crate) initial_budget: u32,
    /// Bumped on every restart; a worker whose generation is stale must exit.
    pub(crate) generation: u64,
    pub(crate) worker: Option<JoinHandle<()>>,
}

impl LogicalThread {
    pub(crate) fn new(label: String, body: ThreadFn, budget: u32) -> Self {
        Self {
            label,
            body,
            caller: None,
            started: false,
            ended: false,
            budget,
            initial_budget: budget,
            generation: 0,
            worker: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn caller(&self) -> Option<Ident> {
        self.caller
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub(crate) fn rebind(&mut self, body: ThreadFn) {
        self.body = body;
    }

    /// Clear the control state so the thread can be started again. Returns
    /// the previous worker, which the caller must join outside the lock.
    pub(crate) fn reset(&mut self) -> Option<JoinHandle<()>> {
        self.caller = None;
        self.started = false;
        self.ended = false;
        self.budget = self.initial_budget;
        self.generation += 1;
        self.worker.take()
    }

    /// Whether a scheduler-granted preemption may happen now. Consumes budget.
    pub(crate) fn take_preemption(&mut self) -> bool {
        match self.budget {
            0 => true,
            1 => false,
            _ => {
                self.budget -= 1;
                true
            }
        }
    }
}

impl fmt::Debug for LogicalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalThread")
            .field("label", &self.label)
            .field("caller", &self.caller)
            .field("started", &self.started)
            .field("ended", &self.ended)
            .field("budget", &self.budget)
            .field("generation", &self.generation)
            .finish()
    }
}
