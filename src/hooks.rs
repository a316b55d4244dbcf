//! Collaborator interfaces consumed by the session.
//!
//! The tracing core does not own breakpoints, architecture details, signal
//! dispositions, or the list of forked inferiors. It queries them through
//! these traits; the defaults below make a bare session usable on its own.

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::Result;

/// Query-side of the breakpoint subsystem.
pub trait Breakpoints {
    /// True if a software breakpoint is inserted at `pc`.
    fn is_breakpoint(&self, pc: u64) -> bool;
}

/// Architecture-specific PC access, needed to push back a breakpoint trap on
/// an LWP whose trap event is not being reported this turn.
pub trait Arch {
    fn pc(&mut self, pid: Pid) -> Result<u64>;

    fn set_pc(&mut self, pid: Pid, pc: u64) -> Result<()>;

    /// How far the PC sits past the breakpoint address after a trap
    /// (e.g. 1 on x86, 0 on most RISC targets).
    fn decr_pc_after_break(&self) -> u64;
}

/// Which signals the debugger engine wants surfaced.
pub trait SignalPolicy {
    /// Report a stop with `signal` to the caller? When false (and the LWP is
    /// not single-stepping) the multiplexer redelivers the signal and keeps
    /// waiting.
    fn report(&self, _signal: Signal) -> bool {
        true
    }

    /// Pass `signal` on to the tracee when redelivering?
    fn pass(&self, _signal: Signal) -> bool {
        true
    }

    /// Is `signal` delivered to the whole process group, so that duplicate
    /// per-thread copies should be flushed once one LWP has reported it?
    fn is_broadcast(&self, signal: Signal) -> bool {
        signal == Signal::SIGINT && !self.pass(signal)
    }
}

/// Default policy: surface every signal, pass every signal.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportAll;

impl SignalPolicy for ReportAll {}

/// Hooks into the fork-list manager that tracks related inferiors.
pub trait Inferiors {
    /// A fork/vfork produced `child`, which we are not following.
    fn register_fork(&mut self, _child: Pid) {}

    /// Other forks remain alive after the active inferior exits?
    fn forks_exist(&self) -> bool {
        false
    }

    /// Called while mourning when `forks_exist()`; names the fork to make
    /// active, or `None` to tear down after all.
    fn switch_after_mourn(&mut self) -> Option<Pid> {
        None
    }
}

/// Default fork-list: single inferior, nothing to switch to.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleInferior;

impl Inferiors for SingleInferior {}
