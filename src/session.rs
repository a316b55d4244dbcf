//! The tracing session: one control thread herding every LWP of a traced
//! process tree.
//!
//! The kernel reports thread stops one at a time, per thread, with ordinary
//! and clone-style children visible under different wait flavors, and with
//! fork/vfork/clone/exec sub-events interleaved with plain signal stops. The
//! [`Session`] multiplexes all of that into a single "next debuggee event"
//! operation: [`Session::wait`] returns exactly one normalized
//! [`TargetStatus`] per call, and guarantees that every other live LWP has
//! been driven to a confirmed stop before it returns.

use std::convert::TryFrom;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::SigSet;
use nix::sys::wait::WaitStatus;
use tracing::{debug, info, trace, warn};

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

use crate::backend::{Backend, LinuxBackend, PendingSignals, WaitFlavor, WaitOutcome};
use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::hooks::{Arch, Breakpoints, Inferiors, ReportAll, SignalPolicy, SingleInferior};
use crate::registry::Registry;

/// Normalized event returned to the caller, exactly one per [`Session::wait`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetStatus {
    /// The reporting LWP stopped with `signal`.
    Stopped { signal: Signal },

    /// The whole inferior exited.
    Exited { exit_code: i32 },

    /// The whole inferior was terminated by `signal`.
    Signaled { signal: Signal, core_dumped: bool },

    /// The reporting LWP forked; `new` is the child process, not tracked by
    /// this session (the fork-list collaborator owns it).
    Forked { new: Pid },

    /// As `Forked`, but the parent is suspended until the child execs.
    Vforked { new: Pid },

    /// The reporting LWP spawned a thread; `new` is already registered.
    Cloned { new: Pid },

    /// The reporting LWP exec'd `path`.
    Execd { path: PathBuf },
}

/// Target selector for [`Session::resume`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Resume every LWP.
    All,

    /// Resume only this LWP; the rest stay parked.
    One(Pid),
}

/// What the extended-event interpreter decided about a sub-event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Decoded {
    /// Handled entirely; the wait that saw it should collect again.
    Consumed,

    /// A decoded event is queued on the reporting LWP; surface it.
    Report,
}

/// Tracing session over one or more related processes.
pub struct Session<B: Backend = LinuxBackend> {
    backend: B,

    lwps: Registry,

    /// Children whose initial stop arrived before the parent's matching
    /// fork/vfork/clone event did.
    unclaimed: Vec<(Pid, WaitStatus)>,

    /// Main process of the active inferior.
    proc_pid: Option<Pid>,

    /// LWP whose last reported event was a trap, if any.
    last_trap: Option<Pid>,

    /// Last event handed to the caller; consulted by [`Session::kill`] for
    /// unfollowed fork children.
    last_event: Option<(Pid, TargetStatus)>,

    /// A vfork parent held by the follow-fork layer, released on exec.
    vfork_parent: Option<Pid>,

    breakpoints: Option<Box<dyn Breakpoints>>,
    arch: Option<Box<dyn Arch>>,
    policy: Box<dyn SignalPolicy>,
    inferiors: Box<dyn Inferiors>,
}

impl Session<LinuxBackend> {
    pub fn new() -> Self {
        Self::with_backend(LinuxBackend::new())
    }

    /// Block an extra signal for the rest of the session, e.g. a thread
    /// library's internal cancellation signal, so it cannot interrupt the
    /// wait loop.
    pub fn block_signal(&mut self, signal: Signal) -> Result<()> {
        self.backend.block_additional(signal)
    }
}

impl Default for Session<LinuxBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Session<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            lwps: Registry::new(),
            unclaimed: Vec::new(),
            proc_pid: None,
            last_trap: None,
            last_event: None,
            vfork_parent: None,
            breakpoints: None,
            arch: None,
            policy: Box::new(ReportAll),
            inferiors: Box::new(SingleInferior),
        }
    }

    /// Install the breakpoint-query collaborator. Without one (and an arch
    /// layer), pending traps on non-reporting LWPs are never pushed back.
    pub fn set_breakpoints(&mut self, breakpoints: Box<dyn Breakpoints>) {
        self.breakpoints = Some(breakpoints);
    }

    pub fn set_arch(&mut self, arch: Box<dyn Arch>) {
        self.arch = Some(arch);
    }

    pub fn set_signal_policy(&mut self, policy: Box<dyn SignalPolicy>) {
        self.policy = policy;
    }

    pub fn set_inferiors(&mut self, inferiors: Box<dyn Inferiors>) {
        self.inferiors = inferiors;
    }

    /// The tracked LWP set.
    pub fn lwps(&self) -> &Registry {
        &self.lwps
    }

    /// LWP that reported the last trap event, if the last event was a trap.
    pub fn last_trap(&self) -> Option<Pid> {
        self.last_trap
    }

    // Lifecycle ----------------------------------------------------------

    /// Spawn `cmd` as the initial tracee.
    ///
    /// The child requests `PTRACE_TRACEME` and raises `SIGSTOP` pre-exec, so
    /// its first stop is observed race-free and normalized exactly like an
    /// attach.
    pub fn spawn(&mut self, cmd: Command) -> Result<Pid> {
        self.backend.arm_wakeup()?;

        let pid = cmd.fork_exec()?;
        self.init_leader(pid)?;

        Ok(pid)
    }

    /// Attach to a running process. Delivers a `SIGSTOP`, waits for the
    /// initial stop, and fakes a "stopped with SIGSTOP" event so the caller
    /// sees a consistent first stop.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        self.backend.arm_wakeup()?;

        self.backend.attach(pid).map_err(|err| match err {
            Error::OS(source) => Error::Attach { pid, source },
            other => other,
        })?;

        self.init_leader(pid)
    }

    // Register `pid` as the main thread of the active inferior and collect
    // its initial stop.
    fn init_leader(&mut self, pid: Pid) -> Result<()> {
        self.proc_pid = Some(pid);

        let lp = self.lwps.add(pid, pid);
        lp.resumed = true;

        let (status, cloned) = self.wait_initial_stop(pid)?;

        match status {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {},
            other => internal_error!("unexpected initial stop for {}: {:?}", pid, other),
        }

        self.backend.set_trace_options(pid)?;

        debug!(pid = pid.as_raw(), "initial stop collected, faking SIGSTOP event");

        let lp = match self.lwps.get_mut(pid) {
            Some(lp) => lp,
            None => internal_error!("leader {} vanished from registry", pid),
        };
        lp.cloned = cloned;
        lp.stopped = true;
        lp.status = Some(WaitStatus::Stopped(pid, Signal::SIGSTOP));

        Ok(())
    }

    /// Attach to a sibling thread of the traced process, as discovered by the
    /// thread layer.
    ///
    /// Returns `Ok(false)` if the thread could not be attached; tracking
    /// degrades to the remaining LWPs rather than aborting the session. One
    /// way this happens is thread creation being interrupted mid-way, leaving
    /// a thread id with nothing attachable behind it.
    pub fn attach_lwp(&mut self, pid: Pid) -> Result<bool> {
        let proc_pid = match self.proc_pid {
            Some(p) => p,
            None => internal_error!("attach_lwp {} with no active inferior", pid),
        };

        self.backend.arm_wakeup()?;

        if pid != proc_pid && !self.lwps.contains(pid) {
            if let Err(err) = self.backend.attach(pid) {
                warn!(pid = pid.as_raw(), %err, "can't attach lwp, continuing without it");
                return Ok(false);
            }

            let (status, cloned) = self.wait_initial_stop(pid)?;

            match status {
                WaitStatus::Stopped(_, _) => {},
                other => internal_error!("unexpected initial stop for {}: {:?}", pid, other),
            }

            let lp = self.lwps.add(pid, proc_pid);
            lp.cloned = cloned;
            lp.stopped = true;

            info!(pid = pid.as_raw(), "new lwp");
        } else {
            // The LWP representing the process itself was stopped by the
            // original attach; just make sure it is recorded as such.
            if !self.lwps.contains(pid) {
                self.lwps.add(pid, proc_pid);
            }
            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.stopped = true;
            }
        }

        Ok(true)
    }

    // Blocking wait for the first stop of a newly-attached LWP. ECHILD under
    // the ordinary flavor means the thread is clone-style; retry accordingly.
    fn wait_initial_stop(&mut self, pid: Pid) -> Result<(WaitStatus, bool)> {
        let mut cloned = false;

        let mut outcome = self.backend.wait(Some(pid), WaitFlavor::Ordinary, true)?;
        if outcome == WaitOutcome::NoChild {
            warn!(pid = pid.as_raw(), "lwp is a cloned process");
            outcome = self.backend.wait(Some(pid), WaitFlavor::Clone, true)?;
            cloned = true;
        }

        match outcome {
            WaitOutcome::Status(p, status) if p == pid => Ok((status, cloned)),
            other => internal_error!("waiting for initial stop of {}: {:?}", pid, other),
        }
    }

    /// Detach from every LWP, redelivering any pending stop signal so nothing
    /// is dropped, and restore the original signal mask. The LWP whose id
    /// equals the process id is detached last.
    pub fn detach(&mut self) -> Result<()> {
        for pid in self.lwps.pids() {
            self.detach_lwp(pid)?;
        }

        // Only the process leader should be left now.
        debug_assert!(self.lwps.len() <= 1);

        self.last_trap = None;
        self.lwps.clear();
        self.unclaimed.clear();
        self.backend.restore_signals()?;

        if let Some(leader) = self.proc_pid.take() {
            self.backend.detach(leader, None)?;
        }

        Ok(())
    }

    fn detach_lwp(&mut self, pid: Pid) -> Result<()> {
        loop {
            let (signalled, stopped, sig) = match self.lwps.get(pid) {
                Some(lp) => (lp.signalled, lp.stopped, lp.status.and_then(stop_signal)),
                None => return Ok(()),
            };

            if !(signalled && stopped) {
                break;
            }

            // We asked this LWP to stop ourselves; let it run again,
            // redelivering whatever it stopped with.
            if let Some(sig) = sig {
                debug!(pid = pid.as_raw(), signal = %sig, "redelivering pending signal on detach");
            }
            self.cont_if_alive(pid, sig)?;

            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.stopped = false;
                lp.signalled = false;
                lp.status = None;
            }
        }

        if Some(pid) != self.proc_pid {
            let sig = self.lwps.get(pid).and_then(|lp| lp.status).and_then(stop_signal);
            match self.backend.detach(pid, sig) {
                Ok(()) => {},
                Err(Error::OS(Errno::ESRCH)) => {
                    debug!(pid = pid.as_raw(), "lwp vanished before detach");
                },
                Err(err) => return Err(err),
            }
            self.lwps.remove(pid);
        }

        Ok(())
    }

    /// Kill every traced LWP and reap all of their statuses, so no stale
    /// events leak into a later session. Tolerates LWPs dying on their own
    /// mid-protocol.
    pub fn kill(&mut self) -> Result<()> {
        // An unfollowed fork child is nobody's responsibility but ours; kill
        // it first (a vfork parent would sleep until the child is gone).
        if let Some((_, ev)) = &self.last_event {
            match ev {
                TargetStatus::Forked { new } | TargetStatus::Vforked { new } => {
                    let new = *new;
                    let _ = self.backend.request_kill(new);
                    let _ = self.backend.wait(Some(new), WaitFlavor::Ordinary, true);
                },
                _ => {},
            }
        }

        for pid in self.lwps.pids() {
            // Best effort; the LWP may already be gone.
            let _ = self.backend.request_kill(pid);
        }

        for pid in self.lwps.pids() {
            self.reap_lwp(pid)?;
        }

        Ok(())
    }

    // Drain every remaining wait status for `pid`. Exit reporting differs by
    // creation style, so cloned LWPs are drained under both flavors.
    fn reap_lwp(&mut self, pid: Pid) -> Result<()> {
        let cloned = self.lwps.get(pid).map(|lp| lp.cloned).unwrap_or(false);

        if cloned {
            self.reap_flavor(pid, WaitFlavor::Clone)?;
        }
        self.reap_flavor(pid, WaitFlavor::Ordinary)?;

        Ok(())
    }

    fn reap_flavor(&mut self, pid: Pid, flavor: WaitFlavor) -> Result<()> {
        loop {
            match self.backend.wait(Some(pid), flavor, true)? {
                WaitOutcome::Status(p, status) => {
                    trace!(pid = p.as_raw(), ?status, "drained status while killing");
                },
                WaitOutcome::NoChild => return Ok(()),
                WaitOutcome::NotReady => internal_error!("blocking reap returned NotReady"),
            }
        }
    }

    /// Tear down the registry after the inferior is gone and restore the
    /// original signal mask. If other forks of the inferior remain, switch to
    /// the one the fork-list collaborator names instead of fully resetting.
    pub fn mourn(&mut self) -> Result<()> {
        self.last_trap = None;
        self.last_event = None;
        self.vfork_parent = None;
        self.lwps.clear();
        self.unclaimed.clear();
        self.proc_pid = None;

        self.backend.restore_signals()?;

        if self.inferiors.forks_exist() {
            if let Some(next) = self.inferiors.switch_after_mourn() {
                self.switch_fork(next);
            }
        }

        Ok(())
    }

    /// Make `pid` the active inferior, discarding all current LWP state. Only
    /// single-threaded inferiors can be switched between, so the new registry
    /// holds one stopped LWP.
    pub fn switch_fork(&mut self, pid: Pid) {
        self.lwps.clear();
        self.unclaimed.clear();
        self.proc_pid = Some(pid);

        let lp = self.lwps.add(pid, pid);
        lp.stopped = true;
    }

    /// Liveness probe for one LWP; does not consume any wait status.
    pub fn thread_alive(&mut self, pid: Pid) -> bool {
        self.backend.is_alive(pid)
    }

    /// Hold `pid` as a vfork parent, to be detached when the child execs.
    pub fn hold_vfork_parent(&mut self, pid: Pid) {
        self.vfork_parent = Some(pid);
    }

    // Resume/step dispatcher ---------------------------------------------

    /// Resume one LWP or all of them, optionally single-stepping the target,
    /// optionally delivering a signal to it.
    ///
    /// If the target already has an undelivered event cached, the resume
    /// short-circuits and the next [`Session::wait`] reports that event --
    /// unless the cache holds only our own synthetic stop and a real signal
    /// was requested, in which case the stale stop is discarded and the
    /// resume proceeds (a synthetic stop cannot be redelivered as a real
    /// signal).
    pub fn resume(&mut self, target: Resume, step: bool, signal: Option<Signal>) -> Result<()> {
        let resume_all = matches!(target, Resume::All);

        for pid in self.lwps.pids() {
            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.resumed = resume_all;
            }
        }

        let pid = match target {
            Resume::One(pid) => pid,
            Resume::All => match self.proc_pid {
                Some(pid) => pid,
                None => internal_error!("resume with no active inferior"),
            },
        };

        let mut signal = signal;

        {
            let policy = &*self.policy;
            let lp = match self.lwps.get_mut(pid) {
                Some(lp) => lp,
                None => internal_error!("resume request for unknown lwp {}", pid),
            };

            lp.step = step;
            lp.resumed = true;

            // A cached stop for a signal the engine would not report anyway
            // is folded into this resume instead of being short-circuited.
            if let Some(WaitStatus::Stopped(_, sig)) = lp.status {
                if !lp.signalled && policy.pass(sig) && !policy.report(sig) {
                    debug!(pid = pid.as_raw(), signal = %sig, "not short-circuiting ignored status");
                    debug_assert!(signal.is_none());
                    signal = Some(sig);
                    lp.status = None;
                }
            }

            if lp.has_pending() {
                let synthetic_only = lp.signalled
                    && lp.event.is_none()
                    && matches!(lp.status, Some(WaitStatus::Stopped(_, Signal::SIGSTOP)));

                if synthetic_only && signal.is_some() {
                    // Our own stop is all that's cached, and the caller wants
                    // a real signal delivered; drop the stale stop and do the
                    // real resume.
                    debug!(pid = pid.as_raw(), "discarding cached synthetic stop for signalled resume");
                    lp.status = None;
                    lp.signalled = false;
                } else {
                    debug!(pid = pid.as_raw(), "short-circuiting resume for pending status");
                    return Ok(());
                }
            }

            // Keep resume_siblings from continuing the target twice.
            lp.stopped = false;
        }

        if resume_all {
            self.resume_siblings(pid)?;
        }

        debug!(
            pid = pid.as_raw(),
            step,
            signal = signal.map(|s| s.as_str()).unwrap_or("0"),
            "resuming event lwp"
        );

        if step {
            self.backend.step(pid, signal)?;
        } else {
            self.backend.cont(pid, signal)?;
        }

        Ok(())
    }

    // Continue every stopped LWP that has nothing pending, except `skip`.
    fn resume_siblings(&mut self, skip: Pid) -> Result<()> {
        for pid in self.lwps.pids() {
            if pid == skip {
                continue;
            }

            let idle = self
                .lwps
                .get(pid)
                .map(|lp| lp.stopped && !lp.has_pending())
                .unwrap_or(false);

            if idle {
                trace!(pid = pid.as_raw(), "resuming sibling");
                self.cont_if_alive(pid, None)?;
                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.stopped = false;
                    lp.step = false;
                }
            }
        }

        Ok(())
    }

    // Stop/resume coordination -------------------------------------------

    // Continuing or signalling an LWP mid-protocol can race its death; the
    // request is dropped and the next wait on the LWP collects the exit.
    // Errors out of these only mean something other than the race.
    fn cont_if_alive(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        match self.backend.cont(pid, signal) {
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "cont raced lwp death");
                Ok(())
            },
            other => other,
        }
    }

    fn step_if_alive(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        match self.backend.step(pid, signal) {
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "step raced lwp death");
                Ok(())
            },
            other => other,
        }
    }

    fn signal_if_alive(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        match self.backend.send_signal(pid, signal) {
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "signal raced lwp death");
                Ok(())
            },
            other => other,
        }
    }

    // Ask `pid` to stop with a synthetic SIGSTOP. Idempotent: already-stopped
    // or already-signalled LWPs are left alone.
    fn request_stop(&mut self, pid: Pid) -> Result<()> {
        let send = match self.lwps.get(pid) {
            Some(lp) => {
                debug_assert!(lp.stopped || lp.signalled || lp.status.is_none());
                !lp.stopped && !lp.signalled
            },
            None => false,
        };

        if send {
            debug!(pid = pid.as_raw(), "sending synthetic stop");
            self.signal_if_alive(pid, Signal::SIGSTOP)?;
            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.signalled = true;
            }
        }

        Ok(())
    }

    // Blocking wait for one status from `pid`. Returns `None` when the LWP
    // turns out to be dead (vanished or exited), in which case its record has
    // been removed. Clone sub-events seen here are consumed and the wait
    // recurses; fork/vfork/exec sub-events are decoded onto the LWP record
    // and the raw trap status is returned.
    fn wait_lwp(&mut self, pid: Pid) -> Result<Option<WaitStatus>> {
        let flavor = match self.lwps.get(pid) {
            Some(lp) if lp.cloned => WaitFlavor::Clone,
            _ => WaitFlavor::Ordinary,
        };

        let mut outcome = self.backend.wait(Some(pid), flavor, true)?;
        if outcome == WaitOutcome::NoChild {
            // The thread may have been created the other way; and if it is
            // simply gone, some older kernels never send an exit event for
            // non-leader threads.
            outcome = self.backend.wait(Some(pid), flavor.toggled(), true)?;
        }

        let status = match outcome {
            WaitOutcome::Status(p, status) => {
                if p != pid {
                    internal_error!("wait for {} returned status for {}", pid, p);
                }
                status
            },
            WaitOutcome::NoChild => {
                debug!(pid = pid.as_raw(), "lwp vanished");
                self.exit_lwp(pid);
                return Ok(None);
            },
            WaitOutcome::NotReady => internal_error!("blocking wait returned NotReady"),
        };

        if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            debug!(pid = pid.as_raw(), ?status, "lwp exited");
            self.exit_lwp(pid);
            return Ok(None);
        }

        if let WaitStatus::PtraceEvent(_, _, code) = status {
            match self.handle_extended(pid, code, true)? {
                Decoded::Consumed => return self.wait_lwp(pid),
                Decoded::Report => {},
            }
        }

        Ok(Some(status))
    }

    // Wait until `pid` reports a stop, flushing ignorable signals and caching
    // any real event that arrives in the meantime. Never drops an event: a
    // status displaced from the cache is re-queued on the LWP via a directed
    // signal.
    fn stop_wait(&mut self, pid: Pid, flush: Option<SigSet>) -> Result<()> {
        let stopped = match self.lwps.get(pid) {
            Some(lp) => lp.stopped,
            None => return Ok(()),
        };
        if stopped {
            return Ok(());
        }

        let status = match self.wait_lwp(pid)? {
            Some(status) => status,
            None => return Ok(()),
        };

        let sig = match stop_signal(status) {
            Some(sig) => sig,
            None => internal_error!("non-stop status {:?} in stop_wait for {}", status, pid),
        };

        if let Some(mask) = flush {
            if mask.contains(sig) {
                let signalled = self.lwps.get(pid).map(|lp| lp.signalled).unwrap_or(false);

                if !signalled {
                    // Nothing of ours in flight; the flushable signal was the
                    // stop itself.
                    if let Some(lp) = self.lwps.get_mut(pid) {
                        lp.stopped = true;
                    }
                    return Ok(());
                }

                trace!(pid = pid.as_raw(), signal = %sig, "flushing ignorable signal");
                self.cont_if_alive(pid, None)?;
                return self.stop_wait(pid, flush);
            }
        }

        if sig != Signal::SIGSTOP {
            if sig == Signal::SIGTRAP {
                // A trap in an LWP we only wanted parked. Re-continue it and
                // collect the synthetic stop; the trap is cached and will be
                // reported (or re-trapped) on a later turn.
                debug!(pid = pid.as_raw(), "candidate trap event while stopping");
                self.cont_if_alive(pid, None)?;
                self.stop_wait(pid, flush)?;

                // If yet another event got cached meanwhile, push it back
                // onto the LWP's queue; the trap takes the cache slot.
                let displaced = self.lwps.get(pid).and_then(|lp| lp.status).and_then(stop_signal);
                if let Some(displaced) = displaced {
                    debug!(pid = pid.as_raw(), signal = %displaced, "re-queueing displaced signal");
                    self.signal_if_alive(pid, displaced)?;
                }

                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.status = Some(status);
                }
            } else {
                // A genuine unrelated signal. Re-continue to absorb our
                // synthetic stop separately, holding this status meanwhile.
                debug!(pid = pid.as_raw(), signal = %sig, "pending event while stopping");
                self.cont_if_alive(pid, None)?;
                self.stop_wait(pid, flush)?;

                match self.lwps.get(pid).map(|lp| lp.status.is_none()) {
                    // The LWP died while we were stopping it; the held status
                    // dies with it.
                    None => {},
                    Some(true) => {
                        if let Some(lp) = self.lwps.get_mut(pid) {
                            lp.status = Some(status);
                        }
                    },
                    Some(false) => {
                        // The cache filled up while we waited; put this one
                        // back on the LWP's signal queue instead.
                        debug!(pid = pid.as_raw(), signal = %sig, "re-queueing signal");
                        self.signal_if_alive(pid, sig)?;
                    },
                }
            }

            return Ok(());
        }

        // We caught the SIGSTOP we intended to catch.
        if let Some(lp) = self.lwps.get_mut(pid) {
            lp.stopped = true;
            lp.signalled = false;
        }

        Ok(())
    }

    // While `pid` has pending signals wholly covered by `flush`, continue it
    // and re-collect, until the pending set clears or a non-ignorable status
    // arrives. Losing an extra stop is acceptable; losing a signal is not.
    fn flush_lwp(&mut self, pid: Pid, flush: &SigSet) -> Result<()> {
        // The last LWP lingers in the registry after exiting; don't poke it.
        if self.lwps.len() == 1 && !self.backend.is_alive(pid) {
            return Ok(());
        }

        if let Some(lp) = self.lwps.get_mut(pid) {
            if let Some(sig) = lp.status.and_then(stop_signal) {
                if flush.contains(sig) {
                    trace!(pid = pid.as_raw(), signal = %sig, "dropping flushable cached status");
                    lp.status = None;
                }
            }
        }

        loop {
            let cached = self.lwps.get(pid).map(|lp| lp.status.is_some()).unwrap_or(true);
            if cached {
                break;
            }

            let sigs = self.backend.pending_signals(pid)?;
            if !has_flushable(&sigs, flush) {
                break;
            }

            trace!(pid = pid.as_raw(), "flushing pending signal queue");
            self.cont_if_alive(pid, None)?;
            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.stopped = false;
            }
            self.stop_wait(pid, Some(*flush))?;
        }

        Ok(())
    }

    // Stop a running LWP, then resume it if it survived. Used to flush exit
    // reports out of sibling threads when the leader exits.
    fn stop_and_resume(&mut self, pid: Pid) -> Result<()> {
        let running = match self.lwps.get(pid) {
            Some(lp) => !lp.stopped && !lp.signalled,
            None => false,
        };
        if !running {
            return Ok(());
        }

        self.request_stop(pid)?;
        self.stop_wait(pid, None)?;

        if self.lwps.contains(pid) {
            self.cont_if_alive(pid, None)?;
            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.stopped = false;
                lp.step = false;
                lp.resumed = true;
            }
        }

        Ok(())
    }

    // Remove the record for an LWP whose death we observed.
    fn exit_lwp(&mut self, pid: Pid) {
        if self.lwps.remove(pid).is_some() {
            info!(pid = pid.as_raw(), "lwp exited");
        }
    }

    // Extended-event interpreter -----------------------------------------

    // Decode a fork/vfork/clone/exec sub-event reported by `pid`. `stopping`
    // is true when we are driving `pid` to a parked stop rather than
    // collecting events to report.
    fn handle_extended(&mut self, pid: Pid, code: i32, stopping: bool) -> Result<Decoded> {
        match code {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                let new = Pid::from_raw(self.backend.event_payload(pid)? as i32);
                let status = self.claim_initial_stop(new, WaitFlavor::Ordinary)?;

                match status {
                    WaitStatus::Stopped(..) => {},
                    other => internal_error!("fork child {} reported {:?}", new, other),
                }

                let event = if code == libc::PTRACE_EVENT_FORK {
                    TargetStatus::Forked { new }
                } else {
                    TargetStatus::Vforked { new }
                };

                debug!(pid = pid.as_raw(), new = new.as_raw(), ?event, "fork-style event");

                // The child is a separate process; the fork-list collaborator
                // tracks it, we do not.
                self.inferiors.register_fork(new);

                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.event = Some(event);
                }

                Ok(Decoded::Report)
            },
            libc::PTRACE_EVENT_CLONE => {
                let new = Pid::from_raw(self.backend.event_payload(pid)? as i32);
                let status = self.claim_initial_stop(new, WaitFlavor::Clone)?;

                let sig = match stop_signal(status) {
                    Some(sig) => sig,
                    other => internal_error!("clone child {} reported {:?}", new, other),
                };

                let proc_pid = self.lwps.get(pid).map(|lp| lp.proc_pid).unwrap_or(pid);

                debug!(pid = pid.as_raw(), new = new.as_raw(), "clone event");

                let new_lp = self.lwps.add(new, proc_pid);
                new_lp.cloned = true;
                new_lp.stopped = true;

                if sig != Signal::SIGSTOP {
                    // Someone signalled the new thread before it ever ran, so
                    // its attach SIGSTOP is still in flight. Flag that, and
                    // keep the real signal so it is redelivered later.
                    new_lp.signalled = true;
                    new_lp.status = Some(status);
                }

                if stopping {
                    // We only wanted the parent parked; swallow the event and
                    // let the wait for its synthetic stop continue.
                    self.cont_if_alive(pid, None)?;
                    Ok(Decoded::Consumed)
                } else {
                    if let Some(lp) = self.lwps.get_mut(pid) {
                        lp.event = Some(TargetStatus::Cloned { new });
                    }
                    Ok(Decoded::Report)
                }
            },
            libc::PTRACE_EVENT_EXEC => {
                let path = self.backend.exec_path(pid)?;

                debug!(pid = pid.as_raw(), ?path, "exec event");

                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.event = Some(TargetStatus::Execd { path });
                }

                // A vfork parent held by the follow-fork layer is unblocked
                // by this exec; release it.
                if let Some(parent) = self.vfork_parent.take() {
                    debug!(parent = parent.as_raw(), "detaching held vfork parent");
                    let _ = self.backend.detach(parent, None);
                }

                Ok(Decoded::Report)
            },
            other => internal_error!("unknown ptrace event {} for lwp {}", other, pid),
        }
    }

    // Collect the initial stop of a fork/clone child: it may already be on
    // the stopped-but-unclaimed list if its stop won the race against the
    // parent's event; otherwise wait for it now.
    fn claim_initial_stop(&mut self, new: Pid, flavor: WaitFlavor) -> Result<WaitStatus> {
        if let Some(idx) = self.unclaimed.iter().position(|(p, _)| *p == new) {
            let (_, status) = self.unclaimed.swap_remove(idx);
            trace!(pid = new.as_raw(), ?status, "claimed parked initial stop");
            return Ok(status);
        }

        // The child has a pending SIGSTOP it has not hit yet; we are already
        // attached, so just wait for it.
        match self.backend.wait(Some(new), flavor, true)? {
            WaitOutcome::Status(p, status) if p == new => Ok(status),
            other => internal_error!("waiting for new child {}: {:?}", new, other),
        }
    }

    // Event multiplexer ---------------------------------------------------

    /// Block until the next reportable debuggee event and return it.
    ///
    /// With `target` set, only that LWP's events are considered. Otherwise
    /// any resumed LWP may report; simultaneous trap events are arbitrated in
    /// favor of a single-stepping LWP, then by a starvation-avoiding random
    /// pick, with the losers' events kept cached for later calls.
    ///
    /// On return, every live LWP in the registry is stopped.
    pub fn wait(&mut self, target: Option<Pid>) -> Result<(Pid, TargetStatus)> {
        self.backend.arm_wakeup()?;

        let mut flush = SigSet::empty();

        loop {
            if self.lwps.find(|lp| lp.resumed).is_none() {
                internal_error!("wait with no resumed lwp");
            }

            let (pid, status) = match self.collect(target, &mut flush)? {
                Some(hit) => hit,
                // A not-reportable signal was redelivered; go around again.
                None => continue,
            };

            // The reporting LWP is stopped now.
            if let Some(lp) = self.lwps.get_mut(pid) {
                lp.stopped = true;
            }

            debug!(pid = pid.as_raw(), ?status, "candidate event");

            // Drive every other LWP to a confirmed stop so the caller sees a
            // consistent global snapshot, then flush duplicate broadcast
            // signals so they are reported only once.
            for other in self.lwps.pids() {
                self.request_stop(other)?;
            }
            for other in self.lwps.pids() {
                self.stop_wait(other, Some(flush))?;
            }
            for other in self.lwps.pids() {
                self.flush_lwp(other, &flush)?;
            }

            let (pid, status) = if target.is_none() {
                self.select_event_lwp(pid, status)
            } else {
                (pid, status)
            };

            self.cancel_breakpoints(pid)?;

            self.last_trap = if is_trap(status) { Some(pid) } else { None };

            let decoded = self.lwps.get_mut(pid).and_then(|lp| lp.event.take());
            let target_status = match decoded {
                Some(event) => event,
                None => normalize(status)?,
            };

            self.last_event = Some((pid, target_status.clone()));

            debug!(pid = pid.as_raw(), ?target_status, "reporting event");

            return Ok((pid, target_status));
        }
    }

    // One pass of event collection: produce a raw candidate status, or `None`
    // if an unreportable signal was redelivered and the caller should retry.
    fn collect(
        &mut self,
        target: Option<Pid>,
        flush: &mut SigSet,
    ) -> Result<Option<(Pid, WaitStatus)>> {
        let mut hit: Option<(Pid, WaitStatus)> = None;

        // A pre-cached status short-circuits the wait loop entirely.
        match target {
            None => {
                let pending = self.lwps.find(|lp| lp.resumed && lp.has_pending()).map(|lp| lp.pid);
                if let Some(pid) = pending {
                    let lp = match self.lwps.get_mut(pid) {
                        Some(lp) => lp,
                        None => internal_error!("pending lwp {} vanished", pid),
                    };
                    let status = lp
                        .status
                        .take()
                        // A decoded event is queued with its raw trap status;
                        // reconstruct the trap if only the event is left.
                        .unwrap_or(WaitStatus::Stopped(pid, Signal::SIGTRAP));
                    debug!(pid = pid.as_raw(), ?status, "using pending wait status");
                    hit = Some((pid, status));
                }
            },
            Some(pid) => {
                let lp = match self.lwps.get_mut(pid) {
                    Some(lp) => lp,
                    None => internal_error!("wait requested for unknown lwp {}", pid),
                };
                if let Some(status) = lp.status.take() {
                    debug!(pid = pid.as_raw(), ?status, "using pending wait status");
                    hit = Some((pid, status));
                } else if lp.event.is_some() {
                    hit = Some((pid, WaitStatus::Stopped(pid, Signal::SIGTRAP)));
                }
            },
        }

        // A pending synthetic stop would interfere with the cached event: if
        // we report now and only later absorb the SIGSTOP, the LWP's real
        // next event (say, a single-step trap) could be lost. Collect the
        // stray stop before reporting.
        if let Some((pid, _)) = hit {
            let interference = self.lwps.get(pid).map(|lp| lp.signalled).unwrap_or(false);

            if interference {
                debug!(pid = pid.as_raw(), "collecting pending synthetic stop before reporting");

                let step = self.lwps.get(pid).map(|lp| lp.step).unwrap_or(false);
                if step {
                    self.step_if_alive(pid, None)?;
                } else {
                    self.cont_if_alive(pid, None)?;
                }
                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.stopped = false;
                    debug_assert!(lp.resumed);
                }

                self.stop_wait(pid, None)?;
            }
        }

        let mut flavor = WaitFlavor::Clone;

        let (pid, status) = loop {
            if let Some(hit) = hit.take() {
                break hit;
            }

            let outcome = match target {
                Some(pid) => {
                    let f = match self.lwps.get(pid) {
                        Some(lp) if lp.cloned => WaitFlavor::Clone,
                        _ => WaitFlavor::Ordinary,
                    };
                    self.backend.wait(Some(pid), f, true)?
                },
                None => self.backend.wait(None, flavor, false)?,
            };

            let (pid, status) = match outcome {
                WaitOutcome::Status(pid, status) => (pid, status),
                WaitOutcome::NotReady | WaitOutcome::NoChild => {
                    match target {
                        Some(pid) => {
                            // The requested LWP is gone without a trace.
                            self.exit_lwp(pid);
                            internal_error!("lwp {} vanished while being waited for", pid);
                        },
                        None => {
                            // Alternate between the two kinds of children,
                            // and sleep every time we have checked both.
                            flavor = flavor.toggled();
                            if flavor == WaitFlavor::Clone {
                                self.backend.sleep()?;
                            }
                            continue;
                        },
                    }
                },
            };

            if !self.lwps.contains(pid) {
                match status {
                    WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..) => {
                        // An initial child stop that won the race against its
                        // parent's fork/clone event. Park it until the event
                        // shows up.
                        trace!(pid = pid.as_raw(), ?status, "parking stop for unknown lwp");
                        self.unclaimed.push((pid, status));
                    },
                    _ => {
                        // Exit of a process we no longer track.
                        trace!(pid = pid.as_raw(), ?status, "ignoring status for unknown lwp");
                    },
                }
                continue;
            }

            if let WaitStatus::PtraceEvent(_, _, code) = status {
                match self.handle_extended(pid, code, false)? {
                    Decoded::Consumed => continue,
                    Decoded::Report => break (pid, status),
                }
            }

            if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                if self.lwps.len() > 1 {
                    // Exits of non-leader threads are not inferior events. A
                    // leader exit means every sibling is already gone, but we
                    // may not have collected their reports yet; stop and
                    // resume them all to shake the exits loose.
                    let is_leader = self.lwps.get(pid).map(|lp| lp.is_leader()).unwrap_or(false);
                    if is_leader {
                        if let Some(lp) = self.lwps.get_mut(pid) {
                            lp.stopped = true;
                        }
                        for other in self.lwps.pids() {
                            if other != pid {
                                self.stop_and_resume(other)?;
                            }
                        }
                    }

                    self.exit_lwp(pid);

                    if !self.lwps.is_empty() {
                        debug_assert!(self
                            .lwps
                            .find(|lp| !lp.stopped || lp.has_pending())
                            .is_some());
                        continue;
                    }
                }

                // Last LWP: this is a whole-inferior exit.
                break (pid, status);
            }

            // Non-leader threads may die without any exit report; prune a
            // stopped-but-dead LWP whenever we hear about it.
            if self.lwps.len() > 1 && !self.backend.is_alive(pid) {
                self.exit_lwp(pid);
                continue;
            }

            let signalled = self.lwps.get(pid).map(|lp| lp.signalled).unwrap_or(false);
            if signalled && matches!(status, WaitStatus::Stopped(_, Signal::SIGSTOP)) {
                // Our own synthetic stop, arriving late. Absorb it and let
                // the LWP keep going.
                debug!(pid = pid.as_raw(), "delayed synthetic stop caught");

                let step = self.lwps.get(pid).map(|lp| lp.step).unwrap_or(false);
                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.signalled = false;
                    lp.stopped = false;
                    debug_assert!(lp.resumed);
                }
                if step {
                    self.step_if_alive(pid, None)?;
                } else {
                    self.cont_if_alive(pid, None)?;
                }

                continue;
            }

            break (pid, status);
        };

        // Signals the engine neither stops on nor reports are redelivered
        // without surfacing, unless the LWP is single-stepping (stepping over
        // a handler needs the engine's attention).
        if let WaitStatus::Stopped(_, sig) = status {
            let step = self.lwps.get(pid).map(|lp| lp.step).unwrap_or(false);

            if !step && !self.policy.report(sig) {
                let deliver = if self.policy.pass(sig) { Some(sig) } else { None };

                debug!(pid = pid.as_raw(), signal = %sig, "redelivering unreported signal");

                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.stopped = false;
                }
                self.cont_if_alive(pid, deliver)?;

                return Ok(None);
            }

            if self.policy.is_broadcast(sig) {
                // Interactive interrupts go to the whole process group; every
                // sibling got a copy. Flush theirs so it is reported once.
                flush.add(sig);
            }
        }

        Ok(Some((pid, status)))
    }

    // Choose which LWP's event to report when several have one pending.
    // Single-stepping LWPs take priority; otherwise pick randomly among the
    // pending traps to avoid starving any one thread. Losers stay cached.
    fn select_event_lwp(&mut self, pid: Pid, status: WaitStatus) -> (Pid, WaitStatus) {
        // Re-cache the candidate so it competes on equal terms.
        if let Some(lp) = self.lwps.get_mut(pid) {
            lp.status = Some(status);
        }

        let mut chosen = self
            .lwps
            .find(|lp| lp.step && lp.status.is_some())
            .map(|lp| lp.pid);

        if let Some(pid) = chosen {
            debug!(pid = pid.as_raw(), "selecting single-stepping lwp");
        } else {
            let traps: Vec<Pid> = self
                .lwps
                .iter()
                .filter(|lp| lp.status.map(is_trap).unwrap_or(false))
                .map(|lp| lp.pid)
                .collect();

            if !traps.is_empty() {
                let pick = fastrand::usize(..traps.len());
                if traps.len() > 1 {
                    debug!(events = traps.len(), pick, "selecting among simultaneous traps");
                }
                chosen = Some(traps[pick]);
            }
        }

        let pid = chosen.unwrap_or(pid);
        let status = self
            .lwps
            .get_mut(pid)
            .and_then(|lp| lp.status.take())
            .unwrap_or(status);

        (pid, status)
    }

    // Any non-reporting LWP whose cached trap sits on a real breakpoint will
    // retrap identically once resumed; rewind its PC if the arch requires it
    // and discard the trap, so the event is not consumed at the wrong turn
    // (e.g. after the user deletes the breakpoint).
    fn cancel_breakpoints(&mut self, chosen: Pid) -> Result<()> {
        let (breakpoints, arch) = match (self.breakpoints.as_deref(), self.arch.as_deref_mut()) {
            (Some(b), Some(a)) => (b, a),
            _ => return Ok(()),
        };

        let decr = arch.decr_pc_after_break();

        for pid in self.lwps.pids() {
            if pid == chosen {
                continue;
            }

            let trapped = self
                .lwps
                .get(pid)
                .and_then(|lp| lp.status)
                .map(|st| matches!(st, WaitStatus::Stopped(_, Signal::SIGTRAP)))
                .unwrap_or(false);
            if !trapped {
                continue;
            }

            let pc = arch.pc(pid)?;
            if breakpoints.is_breakpoint(pc.wrapping_sub(decr)) {
                debug!(pid = pid.as_raw(), pc, "pushing back breakpoint trap");

                if decr != 0 {
                    arch.set_pc(pid, pc - decr)?;
                }
                if let Some(lp) = self.lwps.get_mut(pid) {
                    lp.status = None;
                }
            }
        }

        Ok(())
    }
}

// Signal of a stop-type status, if it is one.
fn stop_signal(status: WaitStatus) -> Option<Signal> {
    match status {
        WaitStatus::Stopped(_, sig) => Some(sig),
        WaitStatus::PtraceEvent(_, sig, _) => Some(sig),
        _ => None,
    }
}

fn is_trap(status: WaitStatus) -> bool {
    matches!(stop_signal(status), Some(Signal::SIGTRAP))
}

// True if `pid` has some pending signal that is in `flush` and neither
// blocked nor ignored by the tracee.
fn has_flushable(sigs: &PendingSignals, flush: &SigSet) -> bool {
    for raw in 1..=31 {
        let sig = match Signal::try_from(raw) {
            Ok(sig) => sig,
            Err(_) => continue,
        };

        if PendingSignals::has(sigs.pending, sig)
            && flush.contains(sig)
            && !PendingSignals::has(sigs.blocked, sig)
            && !PendingSignals::has(sigs.ignored, sig)
        {
            return true;
        }
    }

    false
}

// Map a raw terminal status to the caller-facing event.
fn normalize(status: WaitStatus) -> Result<TargetStatus> {
    let target_status = match status {
        WaitStatus::Stopped(_, signal) => TargetStatus::Stopped { signal },
        WaitStatus::Exited(_, exit_code) => TargetStatus::Exited { exit_code },
        WaitStatus::Signaled(_, signal, core_dumped) => {
            TargetStatus::Signaled { signal, core_dumped }
        },
        other => internal_error!("unreportable status {:?} reached the caller", other),
    };

    Ok(target_status)
}
