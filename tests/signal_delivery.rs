use anyhow::Result;
use lwpmux::{Command, Resume, Session, Signal, TargetStatus};
use ntest::timeout;

#[test]
#[timeout(5000)]
fn test_signal_delivery() -> Result<()> {
    let mut session = Session::new();

    let cmd = Command::new(vec!["/bin/sleep", "60"])?;
    let pid = session.spawn(cmd)?;

    let (_, status) = session.wait(None)?;
    assert_eq!(status, TargetStatus::Stopped { signal: Signal::SIGSTOP });

    session.resume(Resume::All, false, None)?;
    let (_, status) = session.wait(None)?;
    assert!(matches!(status, TargetStatus::Execd { .. }));

    session.resume(Resume::All, false, None)?;
    nix::sys::signal::kill(pid, Signal::SIGTERM)?;

    let (p, status) = session.wait(None)?;
    assert_eq!(p, pid);
    assert_eq!(status, TargetStatus::Stopped { signal: Signal::SIGTERM });

    // Redeliver; sleep installs no handler, so the inferior dies.
    session.resume(Resume::All, false, Some(Signal::SIGTERM))?;

    let (p, status) = session.wait(None)?;
    assert_eq!(p, pid);
    assert_eq!(
        status,
        TargetStatus::Signaled { signal: Signal::SIGTERM, core_dumped: false }
    );

    session.mourn()?;

    Ok(())
}
