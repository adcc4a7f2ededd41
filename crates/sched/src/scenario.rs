//! The scenario driver: registration, the per-run state machine
//! (setup, body, teardown) and the replay / explore loops.

use std::panic::{self, Location};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::ActionLog;
use crate::config::ExploreConfig;
use crate::coroutine::{Target, FINISHING_LABEL, MAIN_LABEL, STARTING_LABEL};
use crate::error::{Fault, Outcome, Pruned, SchedError};
use crate::explorer::{Explorer, Mode, TransferEvent};
use crate::group::ThreadGroup;
use crate::runtime::{Flags, Runtime};
use crate::until::{Untils, YieldEvent};

/// A setup, body or teardown step. Runs on the driver's thread.
pub type Hook = Box<dyn FnMut(&mut Driver<'_>) -> Outcome>;

/// Result of one execution of the scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run reached the end without an assumption failure.
    Completed,
    /// The run was pruned; a new frontier has been queued if exploring.
    Pruned(Pruned),
    /// The run was pruned and no frontier is left.
    SearchExhausted,
}

/// Summary of a finished search.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub mode: Mode,
    /// Feasible paths found. Always 1 for replay and `explore_exists`.
    pub paths: u64,
    pub runs: u64,
    pub backtracks: u64,
    /// The run limit stopped the search early.
    pub truncated: bool,
    /// The schedule that will be replayed next.
    pub log: ActionLog,
}

impl Report {
    fn new(mode: Mode) -> Self {
        Self { mode, paths: 0, runs: 0, backtracks: 0, truncated: false, log: ActionLog::new() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct Scenario {
    runtime: Arc<Runtime>,
    setups: Vec<Hook>,
    body: Option<Hook>,
    teardowns: Vec<Hook>,
    path: Option<PathBuf>,
}

impl Scenario {
    /// An exploring scenario with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ExploreConfig::default())
    }

    pub fn with_config(config: ExploreConfig) -> Self {
        Self::build(Mode::Explore, ActionLog::new(), config)
    }

    /// A scenario that replays `log`.
    pub fn replaying(log: ActionLog) -> Self {
        Self::build(Mode::Replay, log, ExploreConfig::default())
    }

    fn build(mode: Mode, log: ActionLog, config: ExploreConfig) -> Self {
        let mut group = ThreadGroup::new("client group");
        group.explorer = Some(Explorer::new(mode, log));
        Self {
            runtime: Runtime::new(group, config),
            setups: Vec::new(),
            body: None,
            teardowns: Vec::new(),
            path: None,
        }
    }

    /// Load a saved schedule for replay, remembering `path` for [`save`](Self::save).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SchedError> {
        let path = path.into();
        let log = ActionLog::load(&path)?;
        let mut scenario = Self::replaying(log);
        scenario.path = Some(path);
        Ok(scenario)
    }

    /// Replay `path` if it exists, otherwise explore and remember `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchedError> {
        let path = path.into();
        if path.exists() {
            return Self::load(path);
        }
        let mut scenario = Self::new();
        scenario.path = Some(path);
        Ok(scenario)
    }

    #[must_use]
    pub fn configure(self, config: ExploreConfig) -> Self {
        self.runtime.lock().config = config;
        self
    }

    pub fn config(&self) -> ExploreConfig {
        self.runtime.lock().config.clone()
    }

    pub fn add_setup(&mut self, f: impl FnMut(&mut Driver<'_>) -> Outcome + 'static) -> &mut Self {
        self.setups.push(Box::new(f));
        self
    }

    pub fn add_teardown(&mut self, f: impl FnMut(&mut Driver<'_>) -> Outcome + 'static) -> &mut Self {
        self.teardowns.push(Box::new(f));
        self
    }

    /// Replace the default body, which lets threads run until all have ended.
    pub fn with_body(&mut self, f: impl FnMut(&mut Driver<'_>) -> Outcome + 'static) -> &mut Self {
        self.body = Some(Box::new(f));
        self
    }

    /// Register a logical thread that is restarted before every run.
    pub fn add_thread(
        &mut self,
        label: &str,
        body: impl Fn() -> Outcome + Send + Sync + 'static,
    ) -> Result<&mut Self, SchedError> {
        {
            let mut s = self.runtime.lock();
            let budget = s.config.default_budget;
            s.group.add(Some(label), Arc::new(body), budget, true)?;
        }
        Ok(self)
    }

    pub fn mode(&self) -> Mode {
        self.explorer(|e| e.mode).unwrap_or(Mode::Explore)
    }

    /// The current schedule, including untaken records mid-search.
    pub fn log(&self) -> ActionLog {
        self.explorer(|e| e.log.clone()).unwrap_or_default()
    }

    /// Taken transfers of the most recent run, in order.
    pub fn transcript(&self) -> Vec<TransferEvent> {
        self.explorer(|e| e.transcript.clone()).unwrap_or_default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn explorer<R>(&self, f: impl FnOnce(&mut Explorer) -> R) -> Option<R> {
        self.runtime.lock().group.explorer.as_mut().map(f)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write the schedule to the remembered path.
    pub fn save(&self) -> Result<(), SchedError> {
        let path = self.path.as_ref().ok_or(SchedError::NoLogPath)?;
        self.log().save(path)?;
        info!(path = %path.display(), "schedule saved");
        Ok(())
    }

    /// Write the schedule to `path` and remember it.
    pub fn save_to(&mut self, path: impl Into<PathBuf>) -> Result<(), SchedError> {
        self.path = Some(path.into());
        self.save()
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn run_hooks(hooks: &mut [Hook], driver: &mut Driver<'_>) -> Outcome {
        for hook in hooks.iter_mut() {
            hook(&mut *driver)?;
            if driver.aborting() {
                break;
            }
        }
        Ok(())
    }

    fn run_once(&mut self) -> Result<Outcome, SchedError> {
        self.runtime.restart_group();
        self.explorer(Explorer::begin_run);

        let result = {
            let _ctx = self.runtime.enter_main();
            let mut driver = Driver { runtime: &self.runtime };
            let mut result = Self::run_hooks(&mut self.setups, &mut driver);
            if result.is_ok() && !driver.aborting() {
                result = match self.body.as_mut() {
                    Some(body) => body(&mut driver),
                    None => default_body(&mut driver),
                };
            }
            if result.is_ok() && !driver.aborting() {
                result = Self::run_hooks(&mut self.teardowns, &mut driver);
            }
            result
        };

        match self.runtime.take_fault() {
            Some(Fault::Panic(payload)) => panic::resume_unwind(payload),
            Some(Fault::Fatal(e)) => Err(e),
            Some(Fault::Pruned(p)) => Ok(Err(p)),
            None => Ok(result),
        }
    }

    /// Execute the scenario once. When exploring, a pruned run queues the
    /// next frontier before returning.
    pub fn step(&mut self) -> Result<RunOutcome, SchedError> {
        let pruned = match self.run_once()? {
            Ok(()) => return Ok(RunOutcome::Completed),
            Err(p) => p,
        };
        if self.mode() == Mode::Replay {
            return Ok(RunOutcome::Pruned(pruned));
        }
        debug!(reason = %pruned.reason(), "backtracking");
        if self.backtrack() {
            Ok(RunOutcome::Pruned(pruned))
        } else {
            Ok(RunOutcome::SearchExhausted)
        }
    }

    fn backtrack(&self) -> bool {
        self.explorer(Explorer::backtrack).unwrap_or(false)
    }

    /// Replay the log in replay mode, otherwise search for one feasible path.
    pub fn run(&mut self, search_if_fails: bool) -> Result<Report, SchedError> {
        match self.mode() {
            Mode::Replay => self.replay(search_if_fails),
            Mode::Explore => self.explore_exists(),
        }
    }

    /// Run the recorded schedule once. On an assumption failure either fail or,
    /// with `search_if_fails`, start a fresh search.
    pub fn replay(&mut self, search_if_fails: bool) -> Result<Report, SchedError> {
        self.explorer(|e| e.mode = Mode::Replay);
        let mut report = Report::new(Mode::Replay);
        report.runs = 1;
        let reason = match self.step()? {
            RunOutcome::Completed => {
                report.paths = 1;
                info!("scenario replayed successfully");
                return Ok(self.finish_search(report));
            }
            RunOutcome::Pruned(p) => p.reason().to_string(),
            RunOutcome::SearchExhausted => "search exhausted".to_string(),
        };
        warn!(%reason, "some assumption does not hold, scenario should change");
        if search_if_fails {
            warn!("searching for another path");
            return self.explore_exists();
        }
        Err(SchedError::ReplayFailed { reason })
    }

    /// Depth-first search for the first run that completes.
    pub fn explore_exists(&mut self) -> Result<Report, SchedError> {
        self.explore(false)
    }

    /// Depth-first search over every feasible run, counting them.
    pub fn explore_forall(&mut self) -> Result<Report, SchedError> {
        self.explore(true)
    }

    fn explore(&mut self, forall: bool) -> Result<Report, SchedError> {
        self.explorer(Explorer::start_search);
        let limit = self.config().max_runs;
        let mut report = Report::new(Mode::Explore);

        loop {
            if let Some(limit) = limit.filter(|l| report.runs >= *l) {
                if !forall {
                    return Err(SchedError::RunLimit { limit });
                }
                warn!(limit, paths = report.paths, "run limit reached, search truncated");
                report.truncated = true;
                break;
            }
            report.runs += 1;
            match self.step()? {
                RunOutcome::Completed if !forall => {
                    report.paths = 1;
                    break;
                }
                RunOutcome::Completed => {
                    report.paths += 1;
                    info!(path = report.paths, "feasible path found");
                    if !self.backtrack() {
                        break;
                    }
                    report.backtracks += 1;
                }
                RunOutcome::Pruned(_) => report.backtracks += 1,
                RunOutcome::SearchExhausted => break,
            }
        }

        if report.paths == 0 && !report.truncated {
            return Err(SchedError::NoFeasibleExecution);
        }
        info!(paths = report.paths, runs = report.runs, "exploration completed successfully");
        Ok(self.finish_search(report))
    }

    fn finish_search(&mut self, mut report: Report) -> Report {
        report.log = self
            .explorer(|e| {
                e.preprocess(true);
                e.untils.reset();
                e.log.clone()
            })
            .unwrap_or_default();
        self.runtime.restart_group();
        info!(log = %report.log, "final schedule");
        report
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scenario {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("mode", &self.mode())
            .field("path", &self.path)
            .field("setups", &self.setups.len())
            .field("teardowns", &self.teardowns.len())
            .finish()
    }
}

fn default_body(driver: &mut Driver<'_>) -> Outcome {
    while !driver.all_ended() {
        driver.transfer(None)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Handle given to hooks for scripting a run from the driving context.
pub struct Driver<'a> {
    runtime: &'a Arc<Runtime>,
}

impl Driver<'_> {
    fn aborting(&self) -> bool {
        self.runtime.lock().group.has_fault()
    }

    fn with_untils(&mut self, f: impl FnOnce(&mut Untils)) -> &mut Self {
        if let Some(explorer) = self.runtime.lock().group.explorer.as_mut() {
            f(&mut explorer.untils);
        }
        self
    }

    /// Create the thread `label`, or rebind and restart it if it exists.
    /// Threads created here are not restarted between runs.
    pub fn thread(
        &mut self,
        label: &str,
        body: impl Fn() -> Outcome + Send + Sync + 'static,
    ) -> Result<&mut Self, Pruned> {
        let body: crate::coroutine::ThreadFn = Arc::new(body);
        let existing = {
            let mut s = self.runtime.lock();
            match s.group.member_id(label) {
                Some(id) => {
                    s.group.member_mut(id).rebind(body);
                    Some(id)
                }
                None => {
                    let budget = s.config.default_budget;
                    let added = s.group.add(Some(label), body, budget, false);
                    if let Err(e) = added {
                        drop(s);
                        return Err(self.runtime.raise_fatal(e));
                    }
                    None
                }
            }
        };
        if let Some(id) = existing {
            self.runtime.reset_threads(&[id]);
        }
        Ok(self)
    }

    /// Hold the next transfer until some thread yields at `label`.
    pub fn until(&mut self, label: &str) -> &mut Self {
        self.with_untils(|u| u.push_label(label))
    }

    pub fn until_with(
        &mut self,
        pred: impl Fn(&YieldEvent<'_>) -> bool + Send + 'static,
    ) -> &mut Self {
        self.with_untils(|u| u.push(Box::new(pred)))
    }

    /// Accept the next yield, whatever it is.
    pub fn until_star(&mut self) -> &mut Self {
        self.with_untils(Untils::clear)
    }

    pub fn until_end(&mut self) -> &mut Self {
        self.with_untils(Untils::push_end)
    }

    /// Let `target` (or a thread of the explorer's choosing) run until the
    /// pending until-conditions are met.
    #[track_caller]
    pub fn transfer(&mut self, target: Option<&str>) -> Result<&mut Self, Pruned> {
        let site = Location::caller();
        {
            let mut s = self.runtime.lock();
            if let Some(explorer) = s.group.explorer.as_mut() {
                explorer.untils.close();
            }
            if let Some(label) = target {
                let member = s.group.member_id(label);
                match member {
                    None => {
                        drop(s);
                        return Err(self.runtime.raise_fatal(SchedError::UnknownThread(label.to_string())));
                    }
                    Some(id) if s.group.member(id).is_ended() => {
                        return Err(Pruned::new(format!("target `{label}` ended")));
                    }
                    Some(_) => {}
                }
            }
        }
        let target = target.map_or(Target::Caller, Target::Thread);
        self.runtime.transfer_from_main(target, MAIN_LABEL, Flags::PLAIN, site)?;
        Ok(self)
    }

    #[track_caller]
    pub fn transfer_star(&mut self) -> Result<&mut Self, Pruned> {
        self.until_star().transfer(None)
    }

    /// Resume `label` without consulting the explorer.
    #[track_caller]
    pub fn resume(&mut self, label: &str) -> Result<&mut Self, Pruned> {
        let site = Location::caller();
        self.runtime
            .transfer_from_main(Target::Thread(label), STARTING_LABEL, Flags::INTERNAL, site)?;
        Ok(self)
    }

    /// Run `label` to completion: every further voluntary yield it makes is
    /// swallowed until it ends.
    #[track_caller]
    pub fn finish(&mut self, label: &str) -> Result<&mut Self, Pruned> {
        let site = Location::caller();
        {
            let mut s = self.runtime.lock();
            let Some(id) = s.group.member_id(label) else {
                drop(s);
                return Err(self.runtime.raise_fatal(SchedError::UnknownThread(label.to_string())));
            };
            if s.group.member(id).is_ended() {
                return Ok(self);
            }
            s.group.member_mut(id).budget = 1;
        }
        self.runtime
            .transfer_from_main(Target::Thread(label), FINISHING_LABEL, Flags::INTERNAL, site)?;
        Ok(self)
    }

    pub fn all_ended(&self) -> bool {
        self.runtime.lock().group.all_ended()
    }

    /// False for unknown threads.
    pub fn is_ended(&self, label: &str) -> bool {
        let s = self.runtime.lock();
        s.group.member_id(label).is_some_and(|id| s.group.member(id).is_ended())
    }
}
