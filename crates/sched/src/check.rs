//! Assume/Assert helpers.
//!
//! An *assumption* prunes the current run: the helpers return `Err(Pruned)`
//! and the caller propagates it with `?`. An *assertion* is a correctness
//! check and panics; the search never swallows it.

use std::collections::VecDeque;
use std::fmt::Debug;

use crate::error::{Outcome, Pruned};

pub fn assume(condition: bool, reason: &str) -> Outcome {
    if condition {
        Ok(())
    } else {
        Err(Pruned::new(reason))
    }
}

pub fn assume_false(condition: bool, reason: &str) -> Outcome {
    assume(!condition, reason)
}

pub fn assume_eq<T: PartialEq + Debug + ?Sized>(expected: &T, found: &T) -> Outcome {
    if expected == found {
        Ok(())
    } else {
        Err(Pruned::new(format!("expected {expected:?}, found {found:?}")))
    }
}

#[track_caller]
pub fn assert_that(condition: bool, msg: &str) {
    assert!(condition, "{msg}");
}

#[track_caller]
pub fn assert_eq_that<T: PartialEq + Debug + ?Sized>(expected: &T, found: &T) {
    assert!(expected == found, "expected {expected:?}, found {found:?}");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Assume,
    Assert,
}

/// Checks that a stream of observed values follows an expected order.
///
/// ```
/// use interlace_sched::check::ExpectSeq;
///
/// let mut seq = ExpectSeq::assume(vec![1, 2]);
/// assert!(seq.observe(&1).is_ok());
/// assert!(seq.observe(&3).is_err());
/// ```
#[derive(Clone, Debug)]
pub struct ExpectSeq<T> {
    expected: VecDeque<T>,
    kind: Kind,
}

impl<T: PartialEq + Debug> ExpectSeq<T> {
    /// A mismatch prunes the run.
    pub fn assume(expected: impl IntoIterator<Item = T>) -> Self {
        Self { expected: expected.into_iter().collect(), kind: Kind::Assume }
    }

    /// A mismatch panics.
    pub fn assert(expected: impl IntoIterator<Item = T>) -> Self {
        Self { expected: expected.into_iter().collect(), kind: Kind::Assert }
    }

    fn fail(&self, reason: String) -> Outcome {
        match self.kind {
            Kind::Assume => Err(Pruned::new(reason)),
            Kind::Assert => panic!("{reason}"),
        }
    }

    #[track_caller]
    pub fn observe(&mut self, value: &T) -> Outcome {
        match self.expected.pop_front() {
            Some(next) if next == *value => Ok(()),
            Some(next) => self.fail(format!("expected {next:?}, found {value:?}")),
            None => self.fail(format!("unexpected {value:?} after the end of the sequence")),
        }
    }

    /// Fails if expected values were never observed.
    #[track_caller]
    pub fn finish(&self) -> Outcome {
        if self.expected.is_empty() {
            Ok(())
        } else {
            self.fail(format!("still expecting {:?}", self.expected))
        }
    }

    pub fn remaining(&self) -> usize {
        self.expected.len()
    }
}
