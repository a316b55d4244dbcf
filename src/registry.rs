//! Records for the kernel threads under trace, and the set that owns them.

use std::collections::BTreeMap;

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::session::TargetStatus;

/// One traced kernel thread.
///
/// A record exists from the moment we observe the LWP's creation (initial
/// attach, or a fork/clone sub-event) until we observe its exit, detach from
/// it, or tear the session down.
#[derive(Clone, Debug)]
pub struct Lwp {
    /// Thread id. Equals `proc_pid` for the main thread of a process.
    pub pid: Pid,

    /// The process this thread belongs to.
    pub proc_pid: Pid,

    /// The kernel has confirmed this thread is not running.
    pub stopped: bool,

    /// The caller considers this thread part of the active resume set.
    pub resumed: bool,

    /// We sent a synthetic SIGSTOP that has not been observed yet.
    pub signalled: bool,

    /// The last resume request was a single-step.
    pub step: bool,

    /// Created via a clone-style event, so exit reporting needs `__WCLONE`.
    pub cloned: bool,

    /// Raw wait status collected but not yet delivered to the caller.
    pub status: Option<WaitStatus>,

    /// Already-decoded event queued ahead of the next raw status.
    pub event: Option<TargetStatus>,
}

impl Lwp {
    fn new(pid: Pid, proc_pid: Pid) -> Self {
        Self {
            pid,
            proc_pid,
            stopped: false,
            resumed: false,
            signalled: false,
            step: false,
            cloned: false,
            status: None,
            event: None,
        }
    }

    /// True if this is the main thread of its process.
    pub fn is_leader(&self) -> bool {
        self.pid == self.proc_pid
    }

    /// True if there is an undelivered event (raw or decoded) for this LWP.
    pub fn has_pending(&self) -> bool {
        self.status.is_some() || self.event.is_some()
    }
}

/// The set of known LWPs, keyed by thread id.
///
/// Mutated only from the control thread. Sweeps that may remove records
/// iterate over a snapshot of the key set (see [`Registry::pids`]), never over
/// live references.
#[derive(Debug, Default)]
pub struct Registry {
    lwps: BTreeMap<i32, Lwp>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record for `pid`. Adding a pid twice is a caller bug.
    pub fn add(&mut self, pid: Pid, proc_pid: Pid) -> &mut Lwp {
        debug_assert!(
            !self.lwps.contains_key(&pid.as_raw()),
            "duplicate lwp {}",
            pid
        );

        self.lwps.entry(pid.as_raw()).or_insert_with(|| Lwp::new(pid, proc_pid))
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Lwp> {
        self.lwps.remove(&pid.as_raw())
    }

    pub fn get(&self, pid: Pid) -> Option<&Lwp> {
        self.lwps.get(&pid.as_raw())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Lwp> {
        self.lwps.get_mut(&pid.as_raw())
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lwps.contains_key(&pid.as_raw())
    }

    /// Snapshot of every known thread id, in pid order.
    pub fn pids(&self) -> Vec<Pid> {
        self.lwps.values().map(|lp| lp.pid).collect()
    }

    /// First LWP satisfying `pred`, if any.
    pub fn find<F>(&self, mut pred: F) -> Option<&Lwp>
    where
        F: FnMut(&Lwp) -> bool,
    {
        self.lwps.values().find(|lp| pred(lp))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lwp> {
        self.lwps.values()
    }

    pub fn len(&self) -> usize {
        self.lwps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lwps.is_empty()
    }

    /// Drop every record. Used on detach, mourn, and fork switches.
    pub fn clear(&mut self) {
        self.lwps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn add_find_remove() {
        let mut reg = Registry::new();
        reg.add(pid(100), pid(100));
        reg.add(pid(101), pid(100));

        assert_eq!(reg.len(), 2);
        assert!(reg.get(pid(101)).is_some());
        assert!(reg.get(pid(101)).unwrap().proc_pid == pid(100));
        assert!(!reg.get(pid(101)).unwrap().is_leader());
        assert!(reg.get(pid(100)).unwrap().is_leader());

        reg.remove(pid(100));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(pid(100)).is_none());

        reg.clear();
        assert!(reg.is_empty());
    }

    #[test]
    fn find_first_match() {
        let mut reg = Registry::new();
        reg.add(pid(100), pid(100));
        reg.add(pid(101), pid(100)).stopped = true;
        reg.add(pid(102), pid(100)).stopped = true;

        let found = reg.find(|lp| lp.stopped).expect("no stopped lwp");
        assert_eq!(found.pid, pid(101));
        assert!(reg.find(|lp| lp.cloned).is_none());
    }

    #[test]
    fn pids_snapshot_allows_removal() {
        let mut reg = Registry::new();
        reg.add(pid(100), pid(100));
        reg.add(pid(101), pid(100));
        reg.add(pid(102), pid(100));

        for p in reg.pids() {
            if p != pid(100) {
                reg.remove(p);
            }
        }

        assert_eq!(reg.pids(), vec![pid(100)]);
    }
}
