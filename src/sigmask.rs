//! SIGCHLD wakeup plumbing for the wait loop.
//!
//! The multiplexer polls the two wait flavors with `WNOHANG` and must sleep
//! between rounds without missing a child notification. A process-directed
//! SIGCHLD may be delivered to any thread of the host process, so nothing
//! that hinges on this thread's signal mask can be trusted to wake us.
//! Instead a SIGCHLD handler writes a byte to a self-pipe from whichever
//! thread the kernel picks, and the sleep primitive is a blocking read on the
//! pipe's other end. A notification that fires while we are not reading
//! leaves its byte behind, so a wakeup can be duplicated (one harmless extra
//! poll) but never lost.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::{close, pipe2, read};
use tracing::debug;

use crate::error::Result;

/// The signal that wakes the multiplexer when a child changes state.
pub const WAKEUP_SIGNAL: Signal = Signal::SIGCHLD;

// Write end of the self-pipe, shared with the signal handler. One armed
// session per process.
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn note_wakeup(_: libc::c_int) {
    // Nothing in here may allocate, and errno of the interrupted thread must
    // be preserved.
    let saved = Errno::last();

    let fd = WAKEUP_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let buf = [0u8];
        unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, 1);
        }
    }

    unsafe {
        *libc::__errno_location() = saved as i32;
    }
}

/// Owns the wakeup handler and any extra signals blocked for one session.
pub struct SigMask {
    /// Disposition to restore at session teardown.
    saved_action: Option<SigAction>,

    /// Read end of the self-pipe; present exactly while the handler is armed.
    read_fd: Option<RawFd>,

    write_fd: Option<RawFd>,

    /// Signals blocked on top of the caller's mask.
    blocked: SigSet,
}

impl SigMask {
    pub fn new() -> Self {
        Self {
            saved_action: None,
            read_fd: None,
            write_fd: None,
            blocked: SigSet::empty(),
        }
    }

    /// Install the wakeup handler and the self-pipe behind it. Idempotent.
    pub fn ensure_wakeup_armed(&mut self) -> Result<()> {
        if self.saved_action.is_some() {
            return Ok(());
        }

        debug!("arming {WAKEUP_SIGNAL} wakeup handler for the session");

        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)?;
        // The handler must never block; a full pipe already means wakeups are
        // queued.
        fcntl(write_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        WAKEUP_FD.store(write_fd, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(note_wakeup),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let saved = unsafe { sigaction(WAKEUP_SIGNAL, &action)? };

        self.saved_action = Some(saved);
        self.read_fd = Some(read_fd);
        self.write_fd = Some(write_fd);

        Ok(())
    }

    /// Block an extra signal for the rest of the session, e.g. a thread
    /// library's internal cancellation signal.
    pub fn block_additional(&mut self, signal: Signal) -> Result<()> {
        if self.blocked.contains(signal) {
            return Ok(());
        }

        let mut set = SigSet::empty();
        set.add(signal);

        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
        self.blocked.add(signal);

        Ok(())
    }

    /// Sleep until a wakeup arrives, draining queued notifications.
    pub fn wait_for_wakeup(&mut self) -> Result<()> {
        let fd = match self.read_fd {
            Some(fd) => fd,
            None => internal_error!("wait_for_wakeup with no {WAKEUP_SIGNAL} handler armed"),
        };

        let mut buf = [0u8; 64];
        loop {
            match read(fd, &mut buf) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Put back the saved disposition and unblock the extra signals.
    /// Idempotent.
    pub fn restore(&mut self) -> Result<()> {
        if let Some(saved) = self.saved_action.take() {
            debug!("restoring original {WAKEUP_SIGNAL} disposition");

            unsafe { sigaction(WAKEUP_SIGNAL, &saved)? };
            WAKEUP_FD.store(-1, Ordering::SeqCst);
        }

        if let Some(fd) = self.write_fd.take() {
            let _ = close(fd);
        }
        if let Some(fd) = self.read_fd.take() {
            let _ = close(fd);
        }

        if self.blocked != SigSet::empty() {
            sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&self.blocked), None)?;
            self.blocked = SigSet::empty();
        }

        Ok(())
    }
}

impl Drop for SigMask {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}
