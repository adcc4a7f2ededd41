//! Thread group: membership, round-robin order, and forwarding of transfer
//! events to the attached explorer.

use std::collections::{BTreeSet, HashMap};
use std::thread::JoinHandle;

use crate::action::UNRESOLVED;
use crate::coroutine::{is_reserved, validate_label, Ident, LogicalThread, ThreadFn, ThreadId, MAIN_LABEL};
use crate::error::{Fault, SchedError};
use crate::explorer::Explorer;

/// The set of live logical threads of one scenario.
pub struct ThreadGroup {
    name: String,
    members: Vec<LogicalThread>,
    by_label: HashMap<String, ThreadId>,
    restart_on_reset: Vec<ThreadId>,
    next_id: usize,
    /// Most severe fault raised since the last reset.
    pub(crate) fault: Option<Fault>,
    /// Attached explorer; `None` means transfers pass through unarbitrated.
    pub(crate) explorer: Option<Explorer>,
}

impl ThreadGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            by_label: HashMap::new(),
            restart_on_reset: Vec::new(),
            next_id: 0,
            fault: None,
            explorer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn assign_label(&mut self) -> String {
        loop {
            let label = format!("co{}", self.next_id);
            self.next_id += 1;
            if !self.by_label.contains_key(&label) {
                return label;
            }
        }
    }

    /// Register a thread. A missing label gets a generated `coN` id.
    pub(crate) fn add(
        &mut self,
        label: Option<&str>,
        body: ThreadFn,
        budget: u32,
        restart_on_reset: bool,
    ) -> Result<ThreadId, SchedError> {
        if let Some(l) = label {
            validate_label(l)?;
            if l == UNRESOLVED {
                return Err(SchedError::InvalidLabel {
                    label: l.to_string(),
                    reason: "reads back as an unresolved target",
                });
            }
        }
        let label = match label {
            Some(l) if is_reserved(l) => return Err(SchedError::ReservedLabel(l.to_string())),
            Some(l) if self.by_label.contains_key(l) => {
                return Err(SchedError::DuplicateThread(l.to_string()))
            }
            Some(l) => l.to_string(),
            None => self.assign_label(),
        };
        let id = ThreadId::new(self.members.len());
        self.by_label.insert(label.clone(), id);
        self.members.push(LogicalThread::new(label, body, budget));
        if restart_on_reset {
            self.restart_on_reset.push(id);
        }
        Ok(id)
    }

    pub fn has_member(&self, label: &str) -> bool {
        self.by_label.contains_key(label)
    }

    pub fn member_id(&self, label: &str) -> Option<ThreadId> {
        self.by_label.get(label).copied()
    }

    pub fn member(&self, id: ThreadId) -> &LogicalThread {
        &self.members[id.index()]
    }

    pub(crate) fn member_mut(&mut self, id: ThreadId) -> &mut LogicalThread {
        &mut self.members[id.index()]
    }

    pub fn members(&self) -> impl Iterator<Item = &LogicalThread> {
        self.members.iter()
    }

    /// Main is addressable by its reserved label without being a member.
    pub fn resolve(&self, label: &str) -> Option<Ident> {
        if label == MAIN_LABEL {
            return Some(Ident::Main);
        }
        self.member_id(label).map(Ident::Thread)
    }

    pub fn label_of(&self, ident: Ident) -> &str {
        match ident {
            Ident::Main => MAIN_LABEL,
            Ident::Thread(id) => &self.members[id.index()].label,
        }
    }

    pub fn all_ended(&self) -> bool {
        self.members.iter().all(|t| t.ended)
    }

    /// Round-robin scan starting just after `current` (or from the first
    /// member), skipping ended threads, `current` itself, and excluded labels.
    pub fn get_next_running(
        &self,
        current: Option<ThreadId>,
        excluded: &BTreeSet<String>,
    ) -> Option<ThreadId> {
        let n = self.members.len();
        if n == 0 {
            return None;
        }
        let start = current.map_or(0, |c| c.index() + 1);
        (0..n)
            .map(|k| (start + k) % n)
            .filter(|&i| Some(i) != current.map(ThreadId::index))
            .find(|&i| {
                let t = &self.members[i];
                !t.ended && !excluded.contains(&t.label)
            })
            .map(ThreadId::new)
    }

    pub(crate) fn restart_list(&self) -> Vec<ThreadId> {
        self.restart_on_reset.clone()
    }

    /// Reset one member; the returned worker must be joined without the lock.
    pub(crate) fn reset_member(&mut self, id: ThreadId) -> Option<JoinHandle<()>> {
        self.members[id.index()].reset()
    }

    pub(crate) fn raise(&mut self, fault: Fault) {
        fault.raise_into(&mut self.fault);
    }

    pub(crate) fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    /// Ask the explorer for the real target. `Ok(None)` means "do not transfer
    /// yet". Without an explorer an unspecified target falls back to the next
    /// running member.
    pub(crate) fn decide_next_target(
        &mut self,
        current: Ident,
        label: &str,
        target: Option<Ident>,
    ) -> Result<Option<Ident>, Fault> {
        let Some(mut explorer) = self.explorer.take() else {
            return Ok(target.or_else(|| {
                self.get_next_running(None, &BTreeSet::new()).map(Ident::Thread)
            }));
        };
        let decision = explorer.decide_next_target(self, current, label, target);
        self.explorer = Some(explorer);
        decision
    }

    pub(crate) fn on_transfer(&mut self, current: Ident, label: &str, target: Ident) {
        if let Some(mut explorer) = self.explorer.take() {
            if let Err(fault) = explorer.on_transfer(self, current, label, target) {
                self.raise(fault);
            }
            self.explorer = Some(explorer);
        }
    }

    pub(crate) fn on_yield(&mut self, current: Ident, label: &str, target: Option<Ident>) {
        if let Some(mut explorer) = self.explorer.take() {
            explorer.on_yield(self, current, label, target);
            self.explorer = Some(explorer);
        }
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.name)
            .field("members", &self.members)
            .field("fault", &self.fault)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn noop() -> ThreadFn {
        Arc::new(|| Ok(()))
    }

    fn group_of(labels: &[&str]) -> ThreadGroup {
        let mut g = ThreadGroup::new("test");
        for l in labels {
            g.add(Some(l), noop(), 0, true).unwrap();
        }
        g
    }

    #[test]
    fn test_generated_labels() {
        let mut g = ThreadGroup::new("test");
        let a = g.add(None, noop(), 0, false).unwrap();
        let b = g.add(None, noop(), 0, false).unwrap();
        assert_eq!(g.member(a).label(), "co0");
        assert_eq!(g.member(b).label(), "co1");
        assert!(g.restart_list().is_empty());
    }

    #[test]
    fn test_rejects_reserved_and_duplicate() {
        let mut g = group_of(&["a"]);
        assert!(matches!(g.add(Some("main"), noop(), 0, true), Err(SchedError::ReservedLabel(_))));
        assert!(matches!(g.add(Some("a"), noop(), 0, true), Err(SchedError::DuplicateThread(_))));
    }

    #[test]
    fn test_rejects_labels_the_log_cannot_hold() {
        let mut g = group_of(&[]);
        for bad in ["w, x", "a -> b", "two\nlines", "None", ""] {
            assert!(
                matches!(g.add(Some(bad), noop(), 0, true), Err(SchedError::InvalidLabel { .. })),
                "{bad:?} accepted"
            );
        }
        assert!(g.is_empty());
    }

    #[test]
    fn test_resolve_main_without_membership() {
        let g = group_of(&["a"]);
        assert_eq!(g.resolve("main"), Some(Ident::Main));
        assert_eq!(g.resolve("a"), Some(Ident::Thread(ThreadId::new(0))));
        assert_eq!(g.resolve("zzz"), None);
        assert!(!g.has_member("main"));
    }

    #[test]
    fn test_next_running_round_robin() {
        let g = group_of(&["a", "b", "c"]);
        let none = BTreeSet::new();
        assert_eq!(g.get_next_running(None, &none), Some(ThreadId::new(0)));
        assert_eq!(g.get_next_running(Some(ThreadId::new(0)), &none), Some(ThreadId::new(1)));
        assert_eq!(g.get_next_running(Some(ThreadId::new(2)), &none), Some(ThreadId::new(0)));
    }

    #[test]
    fn test_next_running_skips_ended_and_excluded() {
        let mut g = group_of(&["a", "b", "c"]);
        g.member_mut(ThreadId::new(1)).ended = true;
        let excluded: BTreeSet<String> = ["a".to_string()].into();
        assert_eq!(g.get_next_running(None, &excluded), Some(ThreadId::new(2)));
        let excluded: BTreeSet<String> = ["a".to_string(), "c".to_string()].into();
        assert_eq!(g.get_next_running(None, &excluded), None);
    }

    #[test]
    fn test_next_running_never_returns_current() {
        let g = group_of(&["a"]);
        assert_eq!(g.get_next_running(Some(ThreadId::new(0)), &BTreeSet::new()), None);
    }

    #[test]
    fn test_passthrough_without_explorer() {
        let mut g = group_of(&["a", "b"]);
        let t = g.decide_next_target(Ident::Main, "main", None).unwrap();
        assert_eq!(t, Some(Ident::Thread(ThreadId::new(0))));
        let t = g
            .decide_next_target(Ident::Thread(ThreadId::new(0)), "x", Some(Ident::Main))
            .unwrap();
        assert_eq!(t, Some(Ident::Main));
    }

    proptest! {
        #[test]
        fn test_next_running_is_live_and_not_excluded(
            ended in proptest::collection::vec(any::<bool>(), 1..8),
            excluded_mask in proptest::collection::vec(any::<bool>(), 8),
            current in proptest::option::of(0usize..8),
        ) {
            let labels: Vec<String> = (0..ended.len()).map(|i| format!("t{i}")).collect();
            let mut g = ThreadGroup::new("prop");
            for l in &labels {
                g.add(Some(l), noop(), 0, false).unwrap();
            }
            for (i, e) in ended.iter().enumerate() {
                g.member_mut(ThreadId::new(i)).ended = *e;
            }
            let excluded: BTreeSet<String> = labels
                .iter()
                .zip(&excluded_mask)
                .filter(|(_, m)| **m)
                .map(|(l, _)| l.clone())
                .collect();
            let current = current.filter(|c| *c < labels.len()).map(ThreadId::new);

            let eligible = |i: usize| {
                Some(i) != current.map(ThreadId::index)
                    && !ended[i]
                    && !excluded.contains(&labels[i])
            };
            match g.get_next_running(current, &excluded) {
                Some(id) => prop_assert!(eligible(id.index())),
                None => prop_assert!((0..labels.len()).all(|i| !eligible(i))),
            }
        }
    }
}
