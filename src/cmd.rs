//! Launching a tracee under the session's control.

use std::ffi::{CString, NulError};

use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::Error;

/// Program to launch as the initial tracee of a session.
///
/// The child requests `PTRACE_TRACEME` and raises `SIGSTOP` before exec, so
/// there is no window in which it runs unwatched; the session collects that
/// first stop like any other attach.
#[derive(Clone, Debug)]
pub struct Command {
    argv: Vec<CString>,
}

impl Command {
    /// Build a command from an argument vector; `argv[0]` names the
    /// executable.
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, NulError> {
        assert!(!argv.is_empty(), "tracee argv must name an executable");

        let argv = argv.into_iter().map(CString::new).collect::<Result<_, _>>()?;

        Ok(Self { argv })
    }

    pub(crate) fn fork_exec(self) -> Result<Pid, Error> {
        // Everything that allocates happens before the fork; between fork and
        // exec only async-signal-safe calls are allowed, and a failure there
        // can only abort the child.
        let argv = self.raw_argv();

        match unsafe { fork() }? {
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    panic!("tracee could not request tracing");
                }

                if raise(Signal::SIGSTOP).is_err() {
                    panic!("tracee could not raise SIGSTOP");
                }

                // The nix exec wrappers build a Vec internally; call execv
                // directly with the pointers prepared pre-fork.
                unsafe {
                    libc::execv(argv[0], argv.as_ptr());
                }

                panic!("tracee could not exec");
            },
            ForkResult::Parent { child } => Ok(child),
        }
    }

    // NUL-terminated pointer array for execv, backed by `self.argv`.
    fn raw_argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_must_be_nul_free() {
        assert!(Command::new(vec!["/bin/echo", "a\0b"]).is_err());
        assert!(Command::new(vec!["/bin/echo", "ab"]).is_ok());
    }
}
