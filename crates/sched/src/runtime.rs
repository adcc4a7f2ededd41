//! The handoff baton and the transfer algorithm.
//!
//! Every logical thread runs on its own OS worker, but only the identity
//! named by `Sched::current` may proceed; everyone else is parked on the
//! condvar. A transfer rewrites `current`, wakes the parked workers and
//! blocks until control comes back.
//!
//! Restarting a thread bumps its generation. A worker that wakes up with a
//! stale generation unwinds out of the subject code with a private payload
//! and exits; the unwind is caught at the worker boundary.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::config::ExploreConfig;
use crate::coroutine::{is_reserved, validate_label, Ident, Target, ThreadFn, ThreadId, ENDING_LABEL};
use crate::error::{Fault, Pruned, SchedError};
use crate::group::ThreadGroup;

/// Unwind payload used to retire a stale worker.
struct Cancelled;

pub(crate) struct Sched {
    pub(crate) current: Ident,
    /// Identity that performed the last handoff; read by whoever it woke.
    resumed_from: Ident,
    pub(crate) group: ThreadGroup,
    /// First call site seen for each (thread, yield label) pair.
    call_sites: HashMap<(String, String), &'static Location<'static>>,
    pub(crate) config: ExploreConfig,
}

pub(crate) struct Runtime {
    sched: Mutex<Sched>,
    baton: Condvar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Flags {
    /// Skip arbitration and listener callbacks.
    pub(crate) internal: bool,
    /// The final transfer of a thread whose body returned.
    pub(crate) ending: bool,
}

impl Flags {
    pub(crate) const PLAIN: Flags = Flags { internal: false, ending: false };
    pub(crate) const INTERNAL: Flags = Flags { internal: true, ending: false };
}

// ---------------------------------------------------------------------------
// Thread-local context
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Context {
    runtime: Arc<Runtime>,
    ident: Ident,
    generation: u64,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Restores the previous context on drop.
pub(crate) struct ContextGuard {
    prev: Option<Context>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CONTEXT.with(|c| *c.borrow_mut() = prev);
    }
}

fn enter(runtime: Arc<Runtime>, ident: Ident, generation: u64) -> ContextGuard {
    let ctx = Context { runtime, ident, generation };
    let prev = CONTEXT.with(|c| c.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

fn current_context() -> Option<Context> {
    CONTEXT.with(|c| c.borrow().clone())
}

/// Hand control to `target`, labelling this call site `label`.
///
/// Returns the identity that eventually resumed the caller. Outside a running
/// scenario this is a no-op returning [`Ident::Main`].
///
/// An `Err` means the current run is being aborted; propagate it with `?`.
#[track_caller]
pub fn transfer(target: Target<'_>, label: &str) -> Result<Ident, Pruned> {
    let site = Location::caller();
    let Some(ctx) = current_context() else {
        trace!(label, "transfer outside a scenario");
        return Ok(Ident::Main);
    };
    ctx.runtime.transfer(&ctx, target, label, Flags::PLAIN, site)
}

/// Yield point: hand control back to the driving context.
#[track_caller]
pub fn yield_point(label: &str) -> Result<(), Pruned> {
    let site = Location::caller();
    let Some(ctx) = current_context() else {
        trace!(label, "yield outside a scenario");
        return Ok(());
    };
    ctx.runtime
        .transfer(&ctx, Target::Main, label, Flags::PLAIN, site)
        .map(|_| ())
}

/// True when the calling OS thread is executing inside a scenario.
pub fn in_scenario() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

fn aborted(fault: Option<&Fault>) -> Pruned {
    match fault {
        Some(Fault::Pruned(p)) => p.clone(),
        _ => Pruned::new("run aborted"),
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

impl Runtime {
    pub(crate) fn new(group: ThreadGroup, config: ExploreConfig) -> Arc<Self> {
        Arc::new(Self {
            sched: Mutex::new(Sched {
                current: Ident::Main,
                resumed_from: Ident::Main,
                group,
                call_sites: HashMap::new(),
                config,
            }),
            baton: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Sched> {
        self.sched.lock()
    }

    /// Install the driver's context on the calling thread for one run.
    pub(crate) fn enter_main(self: &Arc<Self>) -> ContextGuard {
        enter(Arc::clone(self), Ident::Main, 0)
    }

    /// Transfer on behalf of the driver.
    pub(crate) fn transfer_from_main(
        self: &Arc<Self>,
        target: Target<'_>,
        label: &str,
        flags: Flags,
        site: &'static Location<'static>,
    ) -> Result<Ident, Pruned> {
        let ctx = Context { runtime: Arc::clone(self), ident: Ident::Main, generation: 0 };
        self.transfer(&ctx, target, label, flags, site)
    }

    fn transfer(
        &self,
        ctx: &Context,
        target: Target<'_>,
        label: &str,
        flags: Flags,
        site: &'static Location<'static>,
    ) -> Result<Ident, Pruned> {
        let me = ctx.ident;
        let mut s = self.sched.lock();
        debug_assert_eq!(s.current, me, "transfer from an identity that does not hold the baton");

        if let Some(fault) = s.group.fault.as_ref() {
            if !flags.ending {
                return Err(aborted(Some(fault)));
            }
        }
        if !flags.internal && !flags.ending {
            if let Err(e) = s.check_label(me, label, site) {
                s.group.raise(Fault::Fatal(e));
                return Err(aborted(s.group.fault.as_ref()));
            }
        }

        let resolution = s.resolve_target(me, target);
        let resolved = match resolution {
            Ok(Some(Ident::Main)) if me.is_main() => {
                trace!(label, "transfer to main from main");
                return Ok(me);
            }
            Ok(resolved) => resolved,
            Err(e) => {
                s.group.raise(Fault::Fatal(e));
                if !flags.ending {
                    return Err(aborted(s.group.fault.as_ref()));
                }
                Some(Ident::Main)
            }
        };

        if let Ident::Thread(id) = me {
            if !flags.ending && !s.group.member_mut(id).take_preemption() {
                trace!(label, thread = s.group.label_of(me), "preemption refused by budget");
                return Ok(me);
            }
        }

        let mut next = resolved;
        if !flags.internal {
            let decision = s.group.decide_next_target(me, label, resolved);
            match decision {
                Ok(Some(decided)) => next = Some(decided),
                Ok(None) if flags.ending => {}
                Ok(None) => {
                    s.group.on_yield(me, label, resolved);
                    return Ok(me);
                }
                Err(fault) => {
                    s.group.raise(fault);
                    if !flags.ending {
                        return Err(aborted(s.group.fault.as_ref()));
                    }
                }
            }
        }

        let next = match next {
            Some(Ident::Thread(id)) if s.group.member(id).is_ended() => {
                let label = s.group.member(id).label().to_string();
                s.group.raise(Fault::Fatal(SchedError::TargetTerminated(label)));
                if !flags.ending {
                    return Err(aborted(s.group.fault.as_ref()));
                }
                resolved.unwrap_or(Ident::Main)
            }
            Some(next) if next == me => return Ok(me),
            Some(next) => next,
            None => {
                trace!(label, "nothing to transfer to");
                return Ok(me);
            }
        };

        if !flags.internal && !s.group.has_fault() {
            s.group.on_transfer(me, label, next);
            if !flags.ending && s.group.has_fault() {
                return Err(aborted(s.group.fault.as_ref()));
            }
        }

        if let Ident::Thread(id) = next {
            s.group.member_mut(id).caller = Some(me);
            if !s.group.member(id).is_started() {
                if let Err(e) = self.spawn(&mut s, ctx, id) {
                    s.group.raise(Fault::Fatal(e));
                    if flags.ending {
                        s.current = Ident::Main;
                        s.resumed_from = me;
                        self.baton.notify_all();
                    }
                    return Err(aborted(s.group.fault.as_ref()));
                }
            }
        }

        trace!(
            from = s.group.label_of(me),
            to = s.group.label_of(next),
            label,
            "handoff"
        );
        s.current = next;
        s.resumed_from = me;
        self.baton.notify_all();

        if flags.ending {
            return Ok(next);
        }
        self.wait_turn(&mut s, ctx);
        let from = s.resumed_from;
        if let Some(fault) = s.group.fault.as_ref() {
            return Err(aborted(Some(fault)));
        }
        Ok(from)
    }

    /// Block until `ctx` holds the baton. A stale worker is retired by
    /// unwinding with [`Cancelled`].
    fn wait_turn(&self, s: &mut MutexGuard<'_, Sched>, ctx: &Context) {
        loop {
            if let Ident::Thread(id) = ctx.ident {
                if s.group.member(id).generation != ctx.generation {
                    panic::resume_unwind(Box::new(Cancelled));
                }
            }
            if s.current == ctx.ident {
                return;
            }
            self.baton.wait(s);
        }
    }

    fn spawn(&self, s: &mut Sched, ctx: &Context, id: ThreadId) -> Result<(), SchedError> {
        let thread = s.group.member_mut(id);
        thread.started = true;
        let label = thread.label().to_string();
        let generation = thread.generation;
        let body = Arc::clone(&thread.body);
        let runtime = Arc::clone(&ctx.runtime);

        let mut builder = thread::Builder::new().name(format!("interlace-{label}"));
        if let Some(size) = s.config.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder
            .spawn(move || worker_main(runtime, id, generation, body))
            .map_err(|source| SchedError::Spawn { label: label.clone(), source })?;
        debug!(thread = %label, generation, "started logical thread");
        s.group.member_mut(id).worker = Some(handle);
        Ok(())
    }

    /// Reset the given threads and join their old workers outside the lock.
    pub(crate) fn reset_threads(&self, ids: &[ThreadId]) {
        let handles: Vec<JoinHandle<()>> = {
            let mut s = self.sched.lock();
            let handles = ids.iter().filter_map(|&id| s.group.reset_member(id)).collect();
            self.baton.notify_all();
            handles
        };
        join_all(handles);
    }

    /// Prepare for a new run: reset the threads marked for restart, clear the
    /// pending fault and hand the baton back to main.
    pub(crate) fn restart_group(&self) {
        let ids = {
            let mut s = self.sched.lock();
            s.group.fault = None;
            s.current = Ident::Main;
            s.group.restart_list()
        };
        self.reset_threads(&ids);
    }

    /// Retire every worker.
    pub(crate) fn shutdown(&self) {
        let ids: Vec<ThreadId> = {
            let s = self.sched.lock();
            (0..s.group.len()).map(ThreadId::new).collect()
        };
        self.reset_threads(&ids);
    }

    /// Record a protocol error raised by the driver and abort the run.
    pub(crate) fn raise_fatal(&self, error: SchedError) -> Pruned {
        let mut s = self.sched.lock();
        s.group.raise(Fault::Fatal(error));
        aborted(s.group.fault.as_ref())
    }

    pub(crate) fn take_fault(&self) -> Option<Fault> {
        self.sched.lock().group.fault.take()
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            debug!("worker exited with an uncaught panic");
        }
    }
}

impl Sched {
    fn resolve_target(&self, me: Ident, target: Target<'_>) -> Result<Option<Ident>, SchedError> {
        let group = &self.group;
        match target {
            Target::Main => Ok(Some(Ident::Main)),
            Target::Caller => match me {
                Ident::Main => Ok(None),
                Ident::Thread(id) => Ok(Some(match group.member(id).caller() {
                    Some(Ident::Thread(c)) if group.member(c).is_ended() => Ident::Main,
                    Some(caller) => caller,
                    None => Ident::Main,
                })),
            },
            Target::Thread(label) => match group.resolve(label) {
                Some(Ident::Thread(id)) if group.member(id).is_ended() => {
                    Err(SchedError::TargetTerminated(label.to_string()))
                }
                Some(ident) => Ok(Some(ident)),
                None => Err(SchedError::UnknownThread(label.to_string())),
            },
        }
    }

    /// Within one thread a label may be used from one call site only.
    /// Reserved labels are the engine's own and are rejected from threads.
    fn check_label(
        &mut self,
        me: Ident,
        label: &str,
        site: &'static Location<'static>,
    ) -> Result<(), SchedError> {
        if label.is_empty() {
            return Err(SchedError::MissingLabel);
        }
        if is_reserved(label) {
            return match me {
                Ident::Main => Ok(()),
                Ident::Thread(_) => Err(SchedError::ReservedLabel(label.to_string())),
            };
        }
        validate_label(label)?;
        if !self.config.check_call_sites {
            return Ok(());
        }
        let key = (self.group.label_of(me).to_string(), label.to_string());
        match self.call_sites.get(&key) {
            Some(first) if *first != site => Err(SchedError::AmbiguousLabel {
                label: label.to_string(),
                first: first.to_string(),
                second: site.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.call_sites.insert(key, site);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

fn worker_main(runtime: Arc<Runtime>, id: ThreadId, generation: u64, body: ThreadFn) {
    let me = Ident::Thread(id);
    let _guard = enter(Arc::clone(&runtime), me, generation);
    let ctx = Context { runtime: Arc::clone(&runtime), ident: me, generation };

    let first = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut s = runtime.sched.lock();
        runtime.wait_turn(&mut s, &ctx);
    }));
    if first.is_err() {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body()));
    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(pruned)) => Some(Fault::Pruned(pruned)),
        Err(payload) if payload.is::<Cancelled>() => return,
        Err(payload) => Some(Fault::Panic(payload)),
    };

    let failed = fault.is_some();
    {
        let mut s = runtime.sched.lock();
        if s.group.member(id).generation != generation {
            return;
        }
        if let Some(fault) = fault {
            s.group.raise(fault);
        }
        s.group.member_mut(id).ended = true;
        debug!(thread = s.group.label_of(me), failed, "logical thread ended");
    }

    let flags = Flags { internal: failed, ending: true };
    let site = Location::caller();
    let _ = runtime.transfer(&ctx, Target::Caller, ENDING_LABEL, flags, site);
}
