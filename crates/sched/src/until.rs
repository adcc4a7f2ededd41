//! Until-predicates: gates on the driver's "let some thread run" step.
//!
//! A pending set of predicates is satisfied only when every predicate accepts
//! the same yield event; once satisfied the set is cleared.

use std::fmt;

use crate::coroutine::ENDING_LABEL;

/// The yield event the predicates are evaluated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YieldEvent<'a> {
    pub source: &'a str,
    pub yield_label: &'a str,
    pub target: Option<&'a str>,
}

pub type UntilFn = Box<dyn Fn(&YieldEvent<'_>) -> bool + Send + 'static>;

#[derive(Default)]
pub(crate) struct Untils {
    preds: Vec<UntilFn>,
    /// Set by any `until*` call and consumed by the next driver transfer.
    open: bool,
}

impl Untils {
    pub(crate) fn clear(&mut self) {
        self.preds.clear();
        self.open = true;
    }

    pub(crate) fn push(&mut self, pred: UntilFn) {
        self.preds.push(pred);
        self.open = true;
    }

    pub(crate) fn push_label(&mut self, label: &str) {
        let label = label.to_string();
        self.push(Box::new(move |ev| ev.yield_label == label));
    }

    pub(crate) fn push_end(&mut self) {
        self.push_label(ENDING_LABEL);
    }

    /// Consume the open flag; a transfer without a preceding `until` behaves
    /// like `until_star`.
    pub(crate) fn close(&mut self) {
        if !self.open {
            self.clear();
        }
        self.open = false;
    }

    /// Drop everything, including the open flag.
    pub(crate) fn reset(&mut self) {
        self.preds.clear();
        self.open = false;
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    /// With no predicates pending the answer is `ending || taken`: a free yield
    /// is not worth taking unless something is waiting for it.
    pub(crate) fn check_and_reset(&mut self, event: &YieldEvent<'_>, ending: bool, taken: bool) -> bool {
        if self.preds.is_empty() {
            return ending || taken;
        }
        if self.preds.iter().all(|p| p(event)) {
            self.preds.clear();
            return true;
        }
        false
    }
}

impl fmt::Debug for Untils {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Untils")
            .field("pending", &self.preds.len())
            .field("open", &self.open)
            .finish()
    }
}
