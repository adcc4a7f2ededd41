//! Choice resolution and depth-first backtracking over the action log.
//!
//! The explorer sits behind the thread group. Every arbitrated transfer asks
//! it for the real target; it answers from the record at the cursor (a replayed
//! or requeued decision) or, past the end of the log, makes a new decision and
//! appends it. Yields that were not taken are kept as untaken records so that
//! [`Explorer::backtrack`] can later turn them into transfers.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::action::{ActionLog, ChoiceRecord};
use crate::coroutine::{Ident, ENDING_LABEL, MAIN_LABEL};
use crate::error::{Fault, Pruned, SchedError};
use crate::group::ThreadGroup;
use crate::until::{Untils, YieldEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Follow a recorded log exactly.
    Replay,
    /// Extend the log with new decisions and backtrack over them.
    Explore,
}

/// One taken transfer, as seen by the explorer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferEvent {
    pub source: String,
    pub yield_label: String,
    pub target: String,
}

#[derive(Debug)]
pub(crate) struct Explorer {
    pub(crate) mode: Mode,
    pub(crate) log: ActionLog,
    pub(crate) cursor: usize,
    pub(crate) untils: Untils,
    pub(crate) transcript: Vec<TransferEvent>,
}

fn prune(reason: &str) -> Fault {
    Fault::Pruned(Pruned::new(reason))
}

fn describe(source: &str, label: &str, target: Option<&str>) -> String {
    format!("{source}, {label} -> {}", target.unwrap_or("None"))
}

impl Explorer {
    pub(crate) fn new(mode: Mode, log: ActionLog) -> Self {
        let mut explorer = Self {
            mode,
            log,
            cursor: 0,
            untils: Untils::default(),
            transcript: Vec::new(),
        };
        explorer.preprocess(true);
        explorer
    }

    /// Start a fresh explore search with an empty log.
    pub(crate) fn start_search(&mut self) {
        self.mode = Mode::Explore;
        self.log = ActionLog::new();
        self.cursor = 0;
        self.untils.reset();
    }

    /// Prepare for one execution of the scenario.
    pub(crate) fn begin_run(&mut self) {
        self.preprocess(true);
        self.untils.reset();
        self.transcript.clear();
    }

    /// Drop records that were never taken and move the cursor to the start.
    /// With `reset`, every retained record is rewound to its full count.
    pub(crate) fn preprocess(&mut self, reset: bool) {
        self.cursor = 0;
        self.log.records.retain(|r| r.taken);
        if reset {
            for record in &mut self.log.records {
                record.rewind();
            }
        }
    }

    fn mismatch(&self, index: usize, observed: String) -> Fault {
        Fault::Fatal(SchedError::ReplayMismatch {
            index,
            expected: self.log.records[index].to_string(),
            observed,
        })
    }

    /// Find the record that governs this transfer request, creating one past
    /// the end of the log in explore mode. `Ok(None)` defers the transfer.
    fn get_next_action(
        &mut self,
        group: &ThreadGroup,
        current: Ident,
        label: &str,
        target: Option<Ident>,
    ) -> Result<Option<usize>, Fault> {
        let source = group.label_of(current);
        let target_label = target.map(|t| group.label_of(t));
        let ending = label == ENDING_LABEL && !current.is_main();
        let event = YieldEvent { source, yield_label: label, target: target_label };

        if self.cursor < self.log.len() {
            let index = self.cursor;
            {
                let record = &self.log.records[index];
                if record.source != source || (ending && record.yield_label != ENDING_LABEL) {
                    return Err(self.mismatch(index, describe(source, label, target_label)));
                }
            }

            let record = &mut self.log.records[index];
            if !current.is_main()
                && record.yield_label == label
                && record.remaining == 1
                && !self.untils.check_and_reset(&event, false, true)
            {
                return Err(prune("until condition does not match recorded transfer"));
            }

            if record.target.is_none() {
                let from = match current {
                    Ident::Thread(id) => Some(id),
                    Ident::Main => None,
                };
                let Some(next) = group.get_next_running(from, &record.excluded) else {
                    return Err(prune("no untried runnable thread"));
                };
                record.target = Some(group.member(next).label().to_string());
            }
            return Ok(Some(index));
        }

        if self.mode == Mode::Replay {
            return Err(Fault::Fatal(SchedError::LogExhausted {
                observed: describe(source, label, target_label),
            }));
        }

        let record = match current {
            Ident::Main => {
                let free = target.is_none();
                let chosen = match target {
                    Some(t) => Some(t),
                    None => group
                        .get_next_running(None, &BTreeSet::new())
                        .map(Ident::Thread),
                };
                let Some(Ident::Thread(id)) = chosen else {
                    return Err(prune("requested target unavailable or all threads ended"));
                };
                if group.member(id).is_ended() {
                    return Err(prune("requested target ended"));
                }
                let chosen_label = group.member(id).label().to_string();
                ChoiceRecord::transfer(source, label, Some(chosen_label), BTreeSet::new(), 1, free)
            }
            Ident::Thread(_) if !ending => {
                let target = target.unwrap_or(Ident::Main);
                if !target.is_main() || self.untils.check_and_reset(&event, false, false) {
                    let to = group.label_of(target).to_string();
                    ChoiceRecord::transfer(source, label, Some(to), BTreeSet::new(), 1, false)
                } else {
                    return Ok(None);
                }
            }
            Ident::Thread(_) => {
                if !self.untils.check_and_reset(&event, true, false) {
                    return Err(prune("unsatisfied until conditions at end of run"));
                }
                let to = group.label_of(target.unwrap_or(Ident::Main)).to_string();
                ChoiceRecord::transfer(source, label, Some(to), BTreeSet::new(), 1, false)
            }
        };
        self.log.records.push(record);
        Ok(Some(self.log.len() - 1))
    }

    /// Decide where `current` really goes. `Ok(None)` means keep running.
    pub(crate) fn decide_next_target(
        &mut self,
        group: &ThreadGroup,
        current: Ident,
        label: &str,
        target: Option<Ident>,
    ) -> Result<Option<Ident>, Fault> {
        let Some(index) = self.get_next_action(group, current, label, target)? else {
            return Ok(None);
        };
        let record = &mut self.log.records[index];
        debug!(
            request = %describe(group.label_of(current), label, target.map(|t| group.label_of(t))),
            selected = %record,
            "arbitrating transfer"
        );

        if record.yield_label != label || !record.consume_once() {
            return Ok(None);
        }
        self.cursor += 1;
        let to = record.target.as_deref().unwrap_or(MAIN_LABEL);
        match group.resolve(to) {
            Some(ident) => Ok(Some(ident)),
            None => Err(Fault::Fatal(SchedError::UnknownThread(to.to_string()))),
        }
    }

    /// Check a taken transfer against the record that authorised it.
    pub(crate) fn on_transfer(
        &mut self,
        group: &ThreadGroup,
        current: Ident,
        label: &str,
        target: Ident,
    ) -> Result<(), Fault> {
        let source = group.label_of(current);
        let to = group.label_of(target);
        let observed = describe(source, label, Some(to));
        let Some(index) = self.cursor.checked_sub(1) else {
            return Err(Fault::Fatal(SchedError::LogExhausted { observed }));
        };
        let record = &self.log.records[index];
        if record.source != source || record.yield_label != label || record.target() != Some(to) {
            return Err(self.mismatch(index, observed));
        }
        self.transcript.push(TransferEvent {
            source: source.to_string(),
            yield_label: label.to_string(),
            target: to.to_string(),
        });
        Ok(())
    }

    /// Record a yield that was not taken, merging repeats of the same label.
    pub(crate) fn on_yield(
        &mut self,
        group: &ThreadGroup,
        current: Ident,
        label: &str,
        target: Option<Ident>,
    ) {
        if self.mode == Mode::Replay {
            return;
        }
        let source = group.label_of(current);
        if let Some(prev) = self.cursor.checked_sub(1).map(|i| &mut self.log.records[i]) {
            if !prev.taken && prev.source == source && prev.yield_label == label {
                prev.count += 1;
                prev.remaining = prev.count;
                return;
            }
        }
        let free = target.map_or(true, Ident::is_main);
        let record = ChoiceRecord::observed(source, label, target.map(|t| group.label_of(t).to_string()), free);
        self.log.records.insert(self.cursor, record);
        self.cursor += 1;
    }

    /// Pop records from the tail until a decision that can be revised is
    /// found, and requeue it as the new frontier. False once nothing is left.
    pub(crate) fn backtrack(&mut self) -> bool {
        debug!(log = %self.log, "scenario before backtrack");
        loop {
            let Some(record) = self.log.records.pop() else {
                return false;
            };
            let Some(target) = record.target.clone() else {
                continue;
            };
            let count = record.count.saturating_sub(1).max(1);
            if record.taken {
                if target != MAIN_LABEL && record.free {
                    debug!(source = %record.source, old_target = %target, "adding backtrack");
                    let mut excluded = record.excluded;
                    excluded.insert(target);
                    self.log.records.push(ChoiceRecord::transfer(
                        record.source,
                        record.yield_label,
                        None,
                        excluded,
                        count,
                        true,
                    ));
                    break;
                }
            } else if record.free {
                debug!(source = %record.source, label = %record.yield_label, "taking deferred yield");
                self.log.records.push(ChoiceRecord::transfer(
                    record.source,
                    record.yield_label,
                    Some(MAIN_LABEL.to_string()),
                    BTreeSet::new(),
                    count,
                    true,
                ));
                break;
            }
        }
        self.preprocess(true);
        self.untils.reset();
        debug!(log = %self.log, "scenario after backtrack");
        true
    }
}
