//! The OS-facing edge of the session.
//!
//! Everything the tracing core asks of the kernel goes through the [`Backend`]
//! trait, so the event-ordering machinery can be driven by a scripted fake in
//! tests. [`LinuxBackend`] is the real implementation on top of ptrace(2) and
//! waitpid(2).

use std::fs;
use std::path::PathBuf;
use std::ptr;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::trace;

use crate::error::{Result, ResultExt};
use crate::sigmask::SigMask;

/// Which kind of children a wait call reports.
///
/// A clone-style child's stops are only reported under `__WCLONE`, and its
/// exit status only under the flavor matching how it was created. The
/// multiplexer alternates between the two; other callers pick the flavor
/// recorded on the LWP.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitFlavor {
    Ordinary,
    Clone,
}

impl WaitFlavor {
    pub fn toggled(self) -> Self {
        match self {
            WaitFlavor::Ordinary => WaitFlavor::Clone,
            WaitFlavor::Clone => WaitFlavor::Ordinary,
        }
    }
}

/// Result of one wait call, with the error returns the session must tolerate
/// folded into the value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// Some child changed state.
    Status(Pid, WaitStatus),

    /// `WNOHANG` and nothing to report.
    NotReady,

    /// `ECHILD`: no child matches under this flavor.
    NoChild,
}

/// Signal-queue state of one LWP, read from `/proc/<pid>/status`.
///
/// Bit `n - 1` of each mask corresponds to signal `n`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PendingSignals {
    pub pending: u64,
    pub blocked: u64,
    pub ignored: u64,
}

impl PendingSignals {
    pub fn has(mask: u64, signal: Signal) -> bool {
        mask & (1 << (signal as u32 - 1)) != 0
    }
}

/// Tracing syscalls consumed by the session, one control thread at a time.
pub trait Backend {
    /// Wait for a state change of `pid` (or of any child if `None`).
    ///
    /// Retries `EINTR` internally. Never returns [`WaitStatus::StillAlive`];
    /// that case is folded into [`WaitOutcome::NotReady`].
    fn wait(&mut self, pid: Option<Pid>, flavor: WaitFlavor, block: bool) -> Result<WaitOutcome>;

    fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    fn step(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    fn attach(&mut self, pid: Pid) -> Result<()>;

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// `PTRACE_KILL`: best effort, used only at session kill.
    fn request_kill(&mut self, pid: Pid) -> Result<()>;

    /// Deliver `signal` to exactly the thread `pid` (tkill semantics).
    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<()>;

    /// Enable fork/vfork/clone/exec sub-event reporting for `pid`.
    fn set_trace_options(&mut self, pid: Pid) -> Result<()>;

    /// Payload of the last extended event (`PTRACE_GETEVENTMSG`).
    fn event_payload(&mut self, pid: Pid) -> Result<i64>;

    /// Liveness probe that does not consume a wait status.
    fn is_alive(&mut self, pid: Pid) -> bool;

    /// Path of the executable `pid` is running.
    fn exec_path(&mut self, pid: Pid) -> Result<PathBuf>;

    fn pending_signals(&mut self, pid: Pid) -> Result<PendingSignals>;

    /// Arrange for child notifications to wake [`Backend::sleep`]. Idempotent.
    fn arm_wakeup(&mut self) -> Result<()>;

    /// Undo the signal-handling changes made for the session.
    fn restore_signals(&mut self) -> Result<()>;

    /// Sleep until a child has something to report.
    fn sleep(&mut self) -> Result<()>;
}

/// Sub-event reporting enabled on every traced process.
///
/// `PTRACE_O_TRACEVFORKDONE` and `PTRACE_O_TRACEEXIT` are deliberately not
/// set; the session only decodes the four events below.
const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACEFORK
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC);

/// Real ptrace backend for Linux.
pub struct LinuxBackend {
    mask: SigMask,
    tkill_failed: bool,
}

impl LinuxBackend {
    pub fn new() -> Self {
        Self {
            mask: SigMask::new(),
            tkill_failed: false,
        }
    }

    /// Block an extra signal for the session, e.g. a thread library's
    /// cancellation signal, so it cannot interrupt the wait loop.
    pub fn block_additional(&mut self, signal: Signal) -> Result<()> {
        self.mask.block_additional(signal)
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LinuxBackend {
    fn wait(&mut self, pid: Option<Pid>, flavor: WaitFlavor, block: bool) -> Result<WaitOutcome> {
        let mut flags = match flavor {
            WaitFlavor::Ordinary => WaitPidFlag::empty(),
            WaitFlavor::Clone => WaitPidFlag::__WCLONE,
        };
        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }

        loop {
            match wait::waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(WaitOutcome::NotReady),
                Ok(status) => {
                    // Every non-StillAlive status names its pid.
                    let pid = match status.pid() {
                        Some(pid) => pid,
                        None => internal_error!("wait status without a pid: {:?}", status),
                    };

                    trace!(%pid, ?status, "waitpid");

                    return Ok(WaitOutcome::Status(pid, status));
                },
                Err(Errno::ECHILD) => return Ok(WaitOutcome::NoChild),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(pid, signal).died_if_esrch(pid)
    }

    fn step(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::step(pid, signal).died_if_esrch(pid)
    }

    fn attach(&mut self, pid: Pid) -> Result<()> {
        Ok(ptrace::attach(pid)?)
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        Ok(ptrace::detach(pid, signal)?)
    }

    fn request_kill(&mut self, pid: Pid) -> Result<()> {
        Ok(ptrace::kill(pid)?)
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        // Prefer tkill so the signal lands on this thread and not the group.
        if !self.tkill_failed {
            let res = unsafe { libc::syscall(libc::SYS_tkill, pid.as_raw(), signal as i32) };

            match Errno::result(res) {
                Ok(_) => return Ok(()),
                Err(Errno::ENOSYS) => self.tkill_failed = true,
                Err(err) => return Err(err).died_if_esrch(pid),
            }
        }

        signal::kill(pid, signal).died_if_esrch(pid)
    }

    fn set_trace_options(&mut self, pid: Pid) -> Result<()> {
        Ok(ptrace::setoptions(pid, TRACE_OPTIONS)?)
    }

    fn event_payload(&mut self, pid: Pid) -> Result<i64> {
        Ok(ptrace::getevent(pid).died_if_esrch(pid)? as i64)
    }

    fn is_alive(&mut self, pid: Pid) -> bool {
        // A harmless PTRACE_PEEKUSER: if the lookup fails, the thread is gone
        // (or was never ours, which reads the same to the session).
        match ptrace::read_user(pid, ptr::null_mut()) {
            Err(Errno::ESRCH) | Err(Errno::EPERM) => false,
            _ => true,
        }
    }

    fn exec_path(&mut self, pid: Pid) -> Result<PathBuf> {
        Ok(fs::read_link(format!("/proc/{}/exe", pid))?)
    }

    fn pending_signals(&mut self, pid: Pid) -> Result<PendingSignals> {
        let status = fs::read_to_string(format!("/proc/{}/status", pid))?;

        let mut sigs = PendingSignals::default();

        for line in status.lines() {
            let (key, value) = match line.split_once(':') {
                Some(kv) => kv,
                None => continue,
            };

            let parse = || u64::from_str_radix(value.trim(), 16).unwrap_or(0);

            match key {
                // Thread-directed and process-shared queues both count.
                "SigPnd" => sigs.pending |= parse(),
                "ShdPnd" => sigs.pending |= parse(),
                "SigBlk" => sigs.blocked = parse(),
                "SigIgn" => sigs.ignored = parse(),
                _ => {},
            }
        }

        Ok(sigs)
    }

    fn arm_wakeup(&mut self) -> Result<()> {
        self.mask.ensure_wakeup_armed()
    }

    fn restore_signals(&mut self) -> Result<()> {
        self.mask.restore()
    }

    fn sleep(&mut self) -> Result<()> {
        self.mask.wait_for_wakeup()
    }
}
