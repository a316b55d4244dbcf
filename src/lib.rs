#[macro_use]
pub mod error;

pub mod backend;
pub mod cmd;
pub mod hooks;
pub mod registry;
pub mod session;
mod sigmask;

#[cfg(test)]
mod testing;

pub use backend::{Backend, LinuxBackend, WaitFlavor, WaitOutcome};
pub use cmd::Command;
pub use error::Error;
pub use session::{Pid, Resume, Session, Signal, TargetStatus};
