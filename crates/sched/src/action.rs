//! Choice records and the action log.
//!
//! The on-disk format is one taken record per line:
//!
//! ```text
//! main, main, 1 -> client1
//! client1, add_2, 1 -> main
//! ```
//!
//! Exclusion sets are a search-time artifact and are never persisted.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use crate::error::SchedError;

/// Written in place of a target the explorer has not picked yet.
pub(crate) const UNRESOLVED: &str = "None";

/// One scheduling decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChoiceRecord {
    pub(crate) source: String,
    pub(crate) yield_label: String,
    /// `None` until the explorer picks a target for a free choice.
    pub(crate) target: Option<String>,
    pub(crate) count: u32,
    #[serde(skip)]
    pub(crate) remaining: u32,
    /// False for a yield that was observed but not taken.
    pub(crate) taken: bool,
    /// True when the target was chosen by the explorer and may be revised.
    pub(crate) free: bool,
    #[serde(skip)]
    pub(crate) excluded: BTreeSet<String>,
}

impl ChoiceRecord {
    /// A scheduler-directed transfer.
    pub fn transfer(
        source: impl Into<String>,
        yield_label: impl Into<String>,
        target: Option<String>,
        excluded: BTreeSet<String>,
        count: u32,
        free: bool,
    ) -> Self {
        let count = count.max(1);
        Self {
            source: source.into(),
            yield_label: yield_label.into(),
            target,
            count,
            remaining: count,
            taken: true,
            free,
            excluded,
        }
    }

    /// A yield point that was reached but not taken.
    pub fn observed(
        source: impl Into<String>,
        yield_label: impl Into<String>,
        target: Option<String>,
        free: bool,
    ) -> Self {
        Self {
            taken: false,
            ..Self::transfer(source, yield_label, target, BTreeSet::new(), 1, free)
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn yield_label(&self) -> &str {
        &self.yield_label
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_taken(&self) -> bool {
        self.taken
    }

    pub fn is_free(&self) -> bool {
        self.free
    }

    pub fn excluded(&self) -> &BTreeSet<String> {
        &self.excluded
    }

    /// Consume one occurrence. Returns true once the record is used up.
    pub(crate) fn consume_once(&mut self) -> bool {
        debug_assert!(self.remaining >= 1, "consuming an exhausted record");
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    pub(crate) fn rewind(&mut self) {
        self.remaining = self.count;
    }
}

impl fmt::Display for ChoiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {} -> {}",
            self.source,
            self.yield_label,
            self.count,
            self.target.as_deref().unwrap_or(UNRESOLVED)
        )
    }
}

impl FromStr for ChoiceRecord {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, target) = s.rsplit_once("->").ok_or("missing `->`")?;
        let (source, rest) = head.split_once(',').ok_or("missing source")?;
        let (yield_label, count) = rest.rsplit_once(',').ok_or("missing count")?;

        let source = source.trim();
        let yield_label = yield_label.trim();
        let target = target.trim();
        if source.is_empty() || yield_label.is_empty() || target.is_empty() {
            return Err("empty label".into());
        }
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|e| format!("bad count `{}`: {e}", count.trim()))?;
        if count == 0 {
            return Err("count must be at least 1".into());
        }
        let target = (target != UNRESOLVED).then(|| target.to_string());
        Ok(Self::transfer(source, yield_label, target, BTreeSet::new(), count, true))
    }
}

/// Ordered sequence of choice records that determines one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActionLog {
    pub(crate) records: Vec<ChoiceRecord>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ChoiceRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ChoiceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Parse the line format. Blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, SchedError> {
        let mut records = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = line
                .parse::<ChoiceRecord>()
                .map_err(|reason| SchedError::Parse { line: i + 1, reason })?;
            records.push(record);
        }
        Ok(Self { records })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchedError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SchedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Serialise the taken records.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for record in self.records.iter().filter(|r| r.taken) {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SchedError> {
        let path = path.as_ref();
        fs::write(path, self.to_text()).map_err(|source| SchedError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl fmt::Display for ActionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{record}")?;
        }
        Ok(())
    }
}
