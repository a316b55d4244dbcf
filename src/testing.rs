//! A scripted [`Backend`] for driving the session deterministically.
//!
//! Tests queue wait statuses per pid; every call the session makes is
//! recorded for assertion. A directed signal to a live pid queues a matching
//! stop, so the synthetic-stop protocol plays out without a kernel.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::backend::{Backend, PendingSignals, WaitFlavor, WaitOutcome};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct FakeBackend {
    queues: BTreeMap<i32, VecDeque<WaitStatus>>,
    flavors: HashMap<i32, WaitFlavor>,
    payloads: HashMap<i32, VecDeque<i64>>,
    exec_paths: HashMap<i32, PathBuf>,
    pending: HashMap<i32, VecDeque<PendingSignals>>,
    attach_failures: HashMap<i32, Errno>,
    dead: HashSet<i32>,

    pub attaches: Vec<i32>,
    pub detaches: Vec<(i32, Option<Signal>)>,
    pub conts: Vec<(i32, Option<Signal>)>,
    pub steps: Vec<(i32, Option<Signal>)>,
    pub kills: Vec<i32>,
    pub sent_signals: Vec<(i32, Signal)>,
    pub options_set: Vec<i32>,
    pub wakeup_armed: bool,
    pub signals_restored: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&mut self, pid: i32, status: WaitStatus) {
        self.queues.entry(pid).or_default().push_back(status);
    }

    pub fn set_flavor(&mut self, pid: i32, flavor: WaitFlavor) {
        self.flavors.insert(pid, flavor);
    }

    pub fn push_payload(&mut self, pid: i32, payload: i64) {
        self.payloads.entry(pid).or_default().push_back(payload);
    }

    pub fn set_exec_path(&mut self, pid: i32, path: impl Into<PathBuf>) {
        self.exec_paths.insert(pid, path.into());
    }

    // Each scripted value is consumed by one probe; afterwards the queue
    // reads as empty, as if the signal had been taken.
    pub fn set_pending(&mut self, pid: i32, sigs: PendingSignals) {
        self.pending.entry(pid).or_default().push_back(sigs);
    }

    pub fn fail_attach(&mut self, pid: i32, errno: Errno) {
        self.attach_failures.insert(pid, errno);
    }

    pub fn mark_dead(&mut self, pid: i32) {
        self.dead.insert(pid);
    }

    fn flavor_of(&self, pid: i32) -> WaitFlavor {
        self.flavors.get(&pid).copied().unwrap_or(WaitFlavor::Ordinary)
    }

    // A request directed at a dead pid fails the way ESRCH reads after
    // mapping, even if undrained statuses are still queued for it.
    fn died(&self, pid: Pid) -> Result<()> {
        if self.dead.contains(&pid.as_raw()) {
            return Err(Error::TraceeDied { pid, source: Errno::ESRCH });
        }

        Ok(())
    }
}

impl Backend for FakeBackend {
    fn wait(&mut self, pid: Option<Pid>, flavor: WaitFlavor, block: bool) -> Result<WaitOutcome> {
        match pid {
            Some(pid) => {
                let raw = pid.as_raw();

                if self.flavor_of(raw) != flavor {
                    return Ok(WaitOutcome::NoChild);
                }

                if let Some(status) = self.queues.get_mut(&raw).and_then(|q| q.pop_front()) {
                    return Ok(WaitOutcome::Status(pid, status));
                }

                if self.dead.contains(&raw) {
                    return Ok(WaitOutcome::NoChild);
                }

                if block {
                    panic!("fake backend: blocking wait for {} would hang", raw);
                }

                Ok(WaitOutcome::NotReady)
            },
            None => {
                for (&raw, queue) in self.queues.iter_mut() {
                    if self.flavors.get(&raw).copied().unwrap_or(WaitFlavor::Ordinary) != flavor {
                        continue;
                    }
                    if let Some(status) = queue.pop_front() {
                        return Ok(WaitOutcome::Status(Pid::from_raw(raw), status));
                    }
                }

                if block {
                    panic!("fake backend: blocking wait for any child would hang");
                }

                Ok(WaitOutcome::NotReady)
            },
        }
    }

    fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.died(pid)?;
        self.conts.push((pid.as_raw(), signal));
        Ok(())
    }

    fn step(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.died(pid)?;
        self.steps.push((pid.as_raw(), signal));
        Ok(())
    }

    fn attach(&mut self, pid: Pid) -> Result<()> {
        if let Some(&errno) = self.attach_failures.get(&pid.as_raw()) {
            return Err(Error::OS(errno));
        }

        self.attaches.push(pid.as_raw());
        Ok(())
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.detaches.push((pid.as_raw(), signal));
        Ok(())
    }

    fn request_kill(&mut self, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();
        self.kills.push(raw);

        if self.dead.insert(raw) {
            self.queues
                .entry(raw)
                .or_default()
                .push_back(WaitStatus::Signaled(pid, Signal::SIGKILL, false));
        }

        Ok(())
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        self.died(pid)?;

        let raw = pid.as_raw();
        self.sent_signals.push((raw, signal));

        // The tracee will report the signal as a stop once it runs.
        self.queues
            .entry(raw)
            .or_default()
            .push_back(WaitStatus::Stopped(pid, signal));

        Ok(())
    }

    fn set_trace_options(&mut self, pid: Pid) -> Result<()> {
        self.options_set.push(pid.as_raw());
        Ok(())
    }

    fn event_payload(&mut self, pid: Pid) -> Result<i64> {
        match self.payloads.get_mut(&pid.as_raw()).and_then(|q| q.pop_front()) {
            Some(payload) => Ok(payload),
            None => panic!("fake backend: no payload scripted for {}", pid),
        }
    }

    fn is_alive(&mut self, pid: Pid) -> bool {
        !self.dead.contains(&pid.as_raw())
    }

    fn exec_path(&mut self, pid: Pid) -> Result<PathBuf> {
        Ok(self
            .exec_paths
            .get(&pid.as_raw())
            .cloned()
            .unwrap_or_else(|| PathBuf::from("/bin/true")))
    }

    fn pending_signals(&mut self, pid: Pid) -> Result<PendingSignals> {
        Ok(self
            .pending
            .get_mut(&pid.as_raw())
            .and_then(|q| q.pop_front())
            .unwrap_or_default())
    }

    fn arm_wakeup(&mut self) -> Result<()> {
        self.wakeup_armed = true;
        Ok(())
    }

    fn restore_signals(&mut self) -> Result<()> {
        self.signals_restored = true;
        Ok(())
    }

    fn sleep(&mut self) -> Result<()> {
        panic!("fake backend: sleep with nothing scripted would hang");
    }
}
