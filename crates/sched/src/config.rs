//! Configuration for exploration.
//!
//! `ExploreConfig` uses a fluent, move-based builder style:
//!
//! ```
//! use interlace_sched::ExploreConfig;
//!
//! let config = ExploreConfig::new()
//!     .max_runs(10_000)
//!     .default_budget(0)
//!     .stack_size(256 * 1024);
//! assert_eq!(config.max_runs, Some(10_000));
//! ```

use std::env;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`ExploreConfig::max_runs`].
pub const MAX_RUNS_ENV: &str = "INTERLACE_MAX_RUNS";
/// Environment variable overriding [`ExploreConfig::stack_size`].
pub const STACK_SIZE_ENV: &str = "INTERLACE_STACK_SIZE";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExploreConfig {
    /// Upper bound on executed runs per search. `None` means unbounded.
    pub max_runs: Option<u64>,
    /// Preemption budget given to newly registered threads.
    ///
    /// `0` is unbounded, `1` runs a thread to completion.
    pub default_budget: u32,
    /// Reject a yield label that is used from two different call sites.
    pub check_call_sites: bool,
    /// Stack size for worker threads. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            max_runs: None,
            default_budget: 0,
            check_call_sites: true,
            stack_size: None,
        }
    }
}

impl ExploreConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `INTERLACE_MAX_RUNS` and `INTERLACE_STACK_SIZE`.
    /// Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(limit) = parse_env(MAX_RUNS_ENV) {
            config.max_runs = Some(limit);
        }
        if let Some(size) = parse_env(STACK_SIZE_ENV) {
            config.stack_size = Some(size);
        }
        config
    }

    #[must_use]
    pub fn max_runs(mut self, limit: u64) -> Self {
        self.max_runs = Some(limit);
        self
    }

    #[must_use]
    pub fn unbounded(mut self) -> Self {
        self.max_runs = None;
        self
    }

    #[must_use]
    pub fn default_budget(mut self, budget: u32) -> Self {
        self.default_budget = budget;
        self
    }

    #[must_use]
    pub fn check_call_sites(mut self, enabled: bool) -> Self {
        self.check_call_sites = enabled;
        self
    }

    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
