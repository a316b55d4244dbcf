use std::io;

use nix::errno::Errno;

use crate::session::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not attach to lwp {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("lwp {pid} died during a trace operation")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the error means the underlying LWP no longer exists.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

/// Return early with an [`Error::Internal`].
///
/// Used for ptrace protocol violations: states the kernel should never put us
/// in, like an unknown extended-event code or a status for a pid we cannot
/// explain. These abort the session rather than being retried.
macro_rules! internal_error {
    ($($arg: tt)*) => {
        return Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::TraceeDied`] for `pid`.
    ///
    /// Any ptrace request can race the death of its target. Callers that have
    /// seen `pid` stop may still get `ESRCH` if it was killed in the interim.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}
