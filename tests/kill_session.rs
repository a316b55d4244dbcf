use anyhow::Result;
use lwpmux::{Command, Session, Signal, TargetStatus};
use ntest::timeout;

#[test]
#[timeout(5000)]
fn test_kill_session() -> Result<()> {
    let mut session = Session::new();

    let cmd = Command::new(vec!["/bin/sleep", "60"])?;
    let pid = session.spawn(cmd)?;

    let (_, status) = session.wait(None)?;
    assert_eq!(status, TargetStatus::Stopped { signal: Signal::SIGSTOP });

    session.kill()?;
    session.mourn()?;

    assert!(session.lwps().is_empty());
    assert!(!session.thread_alive(pid));

    Ok(())
}
