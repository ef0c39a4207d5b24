//! Watchdog against a real progress log and, on Unix, real child processes.

use chrono::{NaiveDate, NaiveDateTime};
use std::time::{Duration, Instant};
use stockpile_core::pipeline::{ProgressEvent, ProgressLog, ResumeMode};
use stockpile_core::supervisor::{
    CommandLauncher, ExitInfo, LivenessSource, Supervisor, SupervisorConfig, SupervisorState,
    WorkerHandle, WorkerLauncher,
};
use tempfile::TempDir;

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn processing(sym: &str) -> ProgressEvent {
    ProgressEvent::ProcessingSymbol {
        symbol: sym.to_string(),
    }
}

/// Records launches; workers never exit on their own.
#[derive(Default)]
struct Launches(Vec<ResumeMode>);

/// Runs until asked to stop.
#[derive(Default)]
struct Idle {
    stopped: bool,
}

impl WorkerHandle for Idle {
    fn id(&self) -> u32 {
        0
    }

    fn try_exit(&mut self) -> std::io::Result<Option<ExitInfo>> {
        Ok(self.stopped.then_some(ExitInfo { code: None }))
    }

    fn request_stop(&mut self) -> std::io::Result<()> {
        self.stopped = true;
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.stopped = true;
        Ok(())
    }
}

impl WorkerLauncher for Launches {
    type Handle = Idle;

    fn launch(&mut self, mode: &ResumeMode) -> std::io::Result<Idle> {
        self.0.push(mode.clone());
        Ok(Idle::default())
    }
}

#[test]
fn progress_log_reports_newest_line() {
    let dir = TempDir::new().unwrap();
    let log = ProgressLog::new(dir.path().join("progress.log"));
    assert_eq!(log.last_activity(), None);

    log.append_at(at(10, 0, 0), &processing("AAA")).unwrap();
    log.append_at(at(10, 2, 0), &processing("BBB")).unwrap();
    assert_eq!(log.last_activity(), Some(at(10, 2, 0)));
    assert_eq!(LivenessSource::resume_point(&log).as_deref(), Some("BBB"));
}

#[test]
fn quiet_log_triggers_restart_from_logged_symbol() {
    let dir = TempDir::new().unwrap();
    let log = ProgressLog::new(dir.path().join("progress.log"));
    let config = SupervisorConfig {
        stall_timeout: Duration::from_secs(60),
        ..SupervisorConfig::default()
    };
    let mut sup = Supervisor::new(Launches::default(), log.clone(), config, ResumeMode::FromLog);

    let t0 = Instant::now();
    let secs = |s: u64| t0 + Duration::from_secs(s);
    sup.start(t0).unwrap();
    log.append_at(at(10, 0, 30), &processing("INFY")).unwrap();
    log.append_at(at(10, 0, 50), &processing("TCS")).unwrap();

    // The new lines are seen here.
    sup.tick(secs(60)).unwrap();
    sup.tick(secs(110)).unwrap();
    assert_eq!(sup.restarts(), 0);

    // 61s without the log changing.
    assert_eq!(sup.tick(secs(121)).unwrap(), SupervisorState::Running);
    assert_eq!(sup.restarts(), 1);
    assert_eq!(
        sup.launcher().0,
        vec![ResumeMode::FromLog, ResumeMode::From("TCS".into())]
    );
}

#[cfg(unix)]
#[test]
fn real_child_is_terminated_and_replaced() {
    let dir = TempDir::new().unwrap();
    let log = ProgressLog::new(dir.path().join("progress.log"));
    let launcher = CommandLauncher::new("sh", vec!["-c".into(), "sleep 30".into()]);
    let config = SupervisorConfig {
        stall_timeout: Duration::from_secs(5),
        terminate_grace: Duration::from_secs(2),
        ..SupervisorConfig::default()
    };
    let mut sup = Supervisor::new(launcher, log, config, ResumeMode::Start);

    let now = Instant::now();
    sup.start(now).unwrap();

    // Past the stall timeout: SIGTERM goes out and the tick returns at once.
    let mut tick_at = now + Duration::from_secs(10);
    sup.tick(tick_at).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while sup.state() == SupervisorState::Stalled && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
        sup.tick(tick_at).unwrap();
    }
    if sup.state() == SupervisorState::Stalled {
        tick_at += Duration::from_secs(3);
        sup.tick(tick_at).unwrap();
    }
    assert_eq!(sup.restarts(), 1);
    assert_eq!(sup.state(), SupervisorState::Running);

    sup.stop().unwrap();
    assert_eq!(sup.state(), SupervisorState::Stopped);
}
