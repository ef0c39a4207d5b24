//! Watchdog: keeps a fetch worker alive across crashes and silent stalls.
//!
//! The supervisor owns one worker at a time. On every tick it checks whether
//! the worker exited and whether the progress log has stopped changing for
//! longer than the stall timeout. Either condition terminates the worker and
//! relaunches it from the symbol the progress log last named.
//!
//! ```text
//! Starting ──launch──▶ Running ──exit≠0 / timeout──▶ Stalled (SIGTERM sent)
//!                        ▲                              │ exited, or grace over → SIGKILL
//!                        └──────relaunch──── Restarting ◀┘
//! Running ──exit 0 / stop()──▶ Stopped
//! ```
//!
//! Time is the supervisor's own monotonic clock. Progress-log timestamps are
//! only compared with each other: any change in the newest one counts as
//! activity, so wall-clock steps in either direction neither hide a hung
//! worker nor flag a healthy one.
//!
//! [`Supervisor::tick`] is synchronous, never blocks, and takes the current
//! instant, so the state machine is driven directly in tests;
//! [`Supervisor::run_until`] wraps it in a Tokio interval loop for the CLI.

pub mod process;

pub use process::{ChildWorker, CommandLauncher};

use crate::pipeline::{ProgressLog, ResumeMode};
use chrono::NaiveDateTime;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often a stopping worker is checked for exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stalled,
    Restarting,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stalled => "stalled",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a worker was restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallReason {
    WorkerExited { code: Option<i32> },
    LivenessTimeout { idle: Duration },
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallReason::WorkerExited { code: Some(code) } => {
                write!(f, "worker exited with code {code}")
            }
            StallReason::WorkerExited { code: None } => write!(f, "worker killed by signal"),
            StallReason::LivenessTimeout { idle } => {
                write!(f, "liveness timeout ({}s without activity)", idle.as_secs())
            }
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running worker.
pub trait WorkerHandle {
    fn id(&self) -> u32;

    /// Exit status once the worker has exited.
    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>>;

    /// Ask the worker to stop (SIGTERM). Returns without waiting.
    fn request_stop(&mut self) -> io::Result<()>;

    /// Force the worker down (SIGKILL) and reap it.
    fn kill(&mut self) -> io::Result<()>;

    /// Blocking stop: ask, wait up to `grace`, then force.
    fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        self.request_stop()?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.try_exit()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(EXIT_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        warn!(pid = self.id(), ?grace, "worker ignored SIGTERM, killing");
        self.kill()
    }
}

/// Starts workers.
pub trait WorkerLauncher {
    type Handle: WorkerHandle;

    fn launch(&mut self, mode: &ResumeMode) -> io::Result<Self::Handle>;
}

/// Where the supervisor reads worker activity from.
pub trait LivenessSource {
    /// Newest activity stamp the worker has written. Only ever compared with
    /// earlier readings of the same source.
    fn last_activity(&self) -> Option<NaiveDateTime>;

    /// Symbol to resume from after a restart.
    fn resume_point(&self) -> Option<String>;
}

impl LivenessSource for ProgressLog {
    fn last_activity(&self) -> Option<NaiveDateTime> {
        match self.scan() {
            Ok(scan) => scan.last_activity,
            Err(e) => {
                warn!(path = %self.path().display(), error = %e, "cannot read progress log");
                None
            }
        }
    }

    fn resume_point(&self) -> Option<String> {
        self.scan().ok().and_then(|scan| scan.last_symbol)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often liveness and exit status are checked.
    pub poll_interval: Duration,
    /// Silence longer than this means the worker is stuck.
    pub stall_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub terminate_grace: Duration,
    /// Pause before each relaunch.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(300),
            terminate_grace: Duration::from_secs(10),
            restart_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawning failed. The supervisor stays put and retries on the next
    /// tick.
    #[error("failed to launch worker: {0}")]
    Launch(#[source] io::Error),

    #[error("worker process error: {0}")]
    Process(#[from] io::Error),
}

/// One state change, kept for reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SupervisorState,
    pub to: SupervisorState,
}

pub struct Supervisor<L: WorkerLauncher, P: LivenessSource> {
    launcher: L,
    source: P,
    config: SupervisorConfig,
    initial: ResumeMode,
    state: SupervisorState,
    worker: Option<L::Handle>,
    /// Source reading at the last observed change.
    last_seen: Option<NaiveDateTime>,
    /// When the source last changed, or the launch time.
    last_advance: Option<Instant>,
    kill_at: Option<Instant>,
    relaunch_at: Option<Instant>,
    restarts: u32,
    history: Vec<Transition>,
}

impl<L: WorkerLauncher, P: LivenessSource> Supervisor<L, P> {
    /// `initial` is the resume mode of the first launch only; restarts always
    /// derive theirs from the source.
    pub fn new(launcher: L, source: P, config: SupervisorConfig, initial: ResumeMode) -> Self {
        Self {
            launcher,
            source,
            config,
            initial,
            state: SupervisorState::Starting,
            worker: None,
            last_seen: None,
            last_advance: None,
            kill_at: None,
            relaunch_at: None,
            restarts: 0,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Successful relaunches so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn transition(&mut self, to: SupervisorState) {
        debug!(from = %self.state, %to, "supervisor transition");
        self.history.push(Transition {
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn launch(&mut self, mode: &ResumeMode, now: Instant) -> Result<(), SupervisorError> {
        let worker = self.launcher.launch(mode).map_err(SupervisorError::Launch)?;
        info!(pid = worker.id(), ?mode, "worker running");
        self.worker = Some(worker);
        // Lines already in the log belong to earlier workers.
        self.last_seen = self.source.last_activity();
        self.last_advance = Some(now);
        self.transition(SupervisorState::Running);
        Ok(())
    }

    /// Starting → Running.
    pub fn start(&mut self, now: Instant) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Starting {
            return Ok(());
        }
        let mode = self.initial.clone();
        self.launch(&mode, now)
    }

    /// Advance the state machine once.
    ///
    /// A [`SupervisorError::Launch`] leaves the state unchanged, so the next
    /// tick tries the launch again.
    pub fn tick(&mut self, now: Instant) -> Result<SupervisorState, SupervisorError> {
        match self.state {
            SupervisorState::Starting => self.start(now)?,
            SupervisorState::Running => {
                if let Some(reason) = self.check(now)? {
                    self.stall(reason, now)?;
                }
            }
            SupervisorState::Stalled => self.finish_stall(now)?,
            SupervisorState::Restarting => self.relaunch_if_due(now)?,
            SupervisorState::Stopped => {}
        }
        Ok(self.state)
    }

    /// Exit status first, then liveness.
    fn check(&mut self, now: Instant) -> Result<Option<StallReason>, SupervisorError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(Some(StallReason::WorkerExited { code: None }));
        };

        if let Some(exit) = worker.try_exit()? {
            if exit.success() {
                info!(pid = worker.id(), "worker finished the run");
                self.worker = None;
                self.transition(SupervisorState::Stopped);
                return Ok(None);
            }
            return Ok(Some(StallReason::WorkerExited { code: exit.code }));
        }

        let seen = self.source.last_activity();
        if seen.is_some() && seen != self.last_seen {
            self.last_seen = seen;
            self.last_advance = Some(now);
        }
        let since = self.last_advance.unwrap_or(now);
        let idle = now.saturating_duration_since(since);
        if idle > self.config.stall_timeout {
            return Ok(Some(StallReason::LivenessTimeout { idle }));
        }
        Ok(None)
    }

    /// Running → Stalled: ask the worker to stop, then finish the stall as
    /// far as it can go right now.
    fn stall(&mut self, reason: StallReason, now: Instant) -> Result<(), SupervisorError> {
        self.transition(SupervisorState::Stalled);
        warn!(%reason, restarts = self.restarts, "worker stalled, restarting");

        if let Some(worker) = self.worker.as_mut() {
            if worker.try_exit()?.is_none() {
                worker.request_stop()?;
            }
        }
        self.kill_at = Some(now + self.config.terminate_grace);
        self.finish_stall(now)
    }

    /// Stalled → Restarting once the worker is gone, killing it when the
    /// grace period is over.
    fn finish_stall(&mut self, now: Instant) -> Result<(), SupervisorError> {
        if let Some(worker) = self.worker.as_mut() {
            if worker.try_exit()?.is_none() {
                if self.kill_at.is_some_and(|at| now < at) {
                    return Ok(());
                }
                warn!(pid = worker.id(), "worker ignored SIGTERM, killing");
                worker.kill()?;
            }
        }
        self.worker = None;
        self.kill_at = None;

        self.transition(SupervisorState::Restarting);
        self.relaunch_at = Some(now + self.config.restart_delay);
        self.relaunch_if_due(now)
    }

    fn relaunch_if_due(&mut self, now: Instant) -> Result<(), SupervisorError> {
        if self.relaunch_at.is_some_and(|at| now < at) {
            return Ok(());
        }
        self.relaunch_at = None;

        let mode = match self.source.resume_point() {
            Some(symbol) => ResumeMode::From(symbol),
            None => ResumeMode::Start,
        };
        info!(restart = self.restarts + 1, ?mode, "relaunching worker");
        self.launch(&mode, now)?;
        self.restarts += 1;
        Ok(())
    }

    /// Any → Stopped, terminating the worker first. Blocks for up to the
    /// grace period.
    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        if let Some(mut worker) = self.worker.take() {
            info!(pid = worker.id(), "stopping worker");
            worker.terminate(self.config.terminate_grace)?;
        }
        self.enter_stopped();
        Ok(())
    }

    /// [`stop`](Self::stop) for the async loop: the grace period is waited
    /// with the runtime's timer instead of blocking the thread.
    async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        if let Some(mut worker) = self.worker.take() {
            info!(pid = worker.id(), "stopping worker");
            if worker.try_exit()?.is_none() {
                worker.request_stop()?;
                let deadline = Instant::now() + self.config.terminate_grace;
                while worker.try_exit()?.is_none() {
                    if Instant::now() >= deadline {
                        warn!(pid = worker.id(), "worker ignored SIGTERM, killing");
                        worker.kill()?;
                        break;
                    }
                    tokio::time::sleep(EXIT_POLL).await;
                }
            }
        }
        self.enter_stopped();
        Ok(())
    }

    fn enter_stopped(&mut self) {
        self.kill_at = None;
        self.relaunch_at = None;
        if self.state != SupervisorState::Stopped {
            self.transition(SupervisorState::Stopped);
        }
    }

    /// Poll until the worker completes or `shutdown` resolves.
    ///
    /// Launch failures are logged and retried on the next tick; other process
    /// errors stop the worker and end the loop.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future,
    {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return self.shutdown().await;
                }
                _ = ticker.tick() => {
                    match self.tick(Instant::now()) {
                        Ok(SupervisorState::Stopped) => return Ok(()),
                        Ok(_) => {}
                        Err(SupervisorError::Launch(e)) => {
                            warn!(state = %self.state, error = %e, "worker launch failed, retrying next tick");
                        }
                        Err(e) => {
                            error!(error = %e, "supervisor failed");
                            self.shutdown().await?;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct World {
        launches: Vec<ResumeMode>,
        attempts: usize,
        /// Launch attempt (0-based) that fails with EAGAIN.
        failing_attempt: Option<usize>,
        /// The first worker exits with code 1 straight away.
        crash_first: bool,
        /// Workers ignore SIGTERM.
        stubborn: bool,
        terminations: usize,
        kills: usize,
        exit: Option<ExitInfo>,
        activity: Option<NaiveDateTime>,
        last_symbol: Option<String>,
    }

    type Shared = Arc<Mutex<World>>;

    struct FakeHandle {
        id: u32,
        world: Shared,
    }

    impl WorkerHandle for FakeHandle {
        fn id(&self) -> u32 {
            self.id
        }

        fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
            Ok(self.world.lock().unwrap().exit)
        }

        fn request_stop(&mut self) -> io::Result<()> {
            let mut world = self.world.lock().unwrap();
            world.terminations += 1;
            if !world.stubborn {
                world.exit = Some(ExitInfo { code: None });
            }
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            let mut world = self.world.lock().unwrap();
            world.kills += 1;
            world.exit = Some(ExitInfo { code: None });
            Ok(())
        }
    }

    struct FakeLauncher(Shared);

    impl WorkerLauncher for FakeLauncher {
        type Handle = FakeHandle;

        fn launch(&mut self, mode: &ResumeMode) -> io::Result<FakeHandle> {
            let mut world = self.0.lock().unwrap();
            let attempt = world.attempts;
            world.attempts += 1;
            if world.failing_attempt == Some(attempt) {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "EAGAIN"));
            }
            world.exit = (world.crash_first && world.launches.is_empty())
                .then_some(ExitInfo { code: Some(1) });
            world.launches.push(mode.clone());
            Ok(FakeHandle {
                id: world.launches.len() as u32,
                world: Arc::clone(&self.0),
            })
        }
    }

    struct FakeSource(Shared);

    impl LivenessSource for FakeSource {
        fn last_activity(&self) -> Option<NaiveDateTime> {
            self.0.lock().unwrap().activity
        }

        fn resume_point(&self) -> Option<String> {
            self.0.lock().unwrap().last_symbol.clone()
        }
    }

    /// Log stamp `s` seconds into the (wall-clock) day.
    fn stamp(s: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(s)
    }

    fn supervisor(config: SupervisorConfig) -> (Shared, Supervisor<FakeLauncher, FakeSource>) {
        let world: Shared = Arc::default();
        let sup = Supervisor::new(
            FakeLauncher(Arc::clone(&world)),
            FakeSource(Arc::clone(&world)),
            config,
            ResumeMode::FromLog,
        );
        (world, sup)
    }

    fn transitions(sup: &Supervisor<FakeLauncher, FakeSource>) -> Vec<(SupervisorState, SupervisorState)> {
        sup.history().iter().map(|t| (t.from, t.to)).collect()
    }

    #[test]
    fn frozen_liveness_restarts_exactly_once() {
        use SupervisorState::*;
        let t0 = Instant::now();
        let secs = |s: u64| t0 + Duration::from_secs(s);
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        sup.start(t0).unwrap();

        {
            let mut w = world.lock().unwrap();
            w.activity = Some(stamp(1));
            w.last_symbol = Some("CCC".into());
        }
        // The new line is noticed at 200s.
        assert_eq!(sup.tick(secs(200)).unwrap(), Running);
        assert_eq!(sup.tick(secs(500)).unwrap(), Running);
        assert_eq!(sup.restarts(), 0);

        // 301s since the line was noticed.
        assert_eq!(sup.tick(secs(501)).unwrap(), Running);
        assert_eq!(sup.restarts(), 1);
        assert_eq!(
            transitions(&sup),
            vec![
                (Starting, Running),
                (Running, Stalled),
                (Stalled, Restarting),
                (Restarting, Running),
            ]
        );

        let w = world.lock().unwrap();
        assert_eq!(w.terminations, 1);
        assert_eq!(w.kills, 0);
        assert_eq!(
            w.launches,
            vec![ResumeMode::FromLog, ResumeMode::From("CCC".into())]
        );
    }

    #[test]
    fn advancing_activity_keeps_worker_running() {
        let t0 = Instant::now();
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        sup.start(t0).unwrap();

        for minute in 1..=30 {
            world.lock().unwrap().activity = Some(stamp(minute * 60 - 5));
            sup.tick(t0 + Duration::from_secs(minute as u64 * 60)).unwrap();
        }
        assert_eq!(sup.restarts(), 0);
        assert_eq!(world.lock().unwrap().terminations, 0);
    }

    #[test]
    fn log_stamps_ahead_of_the_clock_do_not_hide_a_hang() {
        // Lines written before a DST fall-back sit an hour ahead of "now".
        let t0 = Instant::now();
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        world.lock().unwrap().activity = Some(stamp(59 * 60));
        sup.start(t0).unwrap();

        let mut restarted_at = None;
        for minute in 1..=40u64 {
            sup.tick(t0 + Duration::from_secs(minute * 60)).unwrap();
            if sup.restarts() == 1 && restarted_at.is_none() {
                restarted_at = Some(minute);
            }
        }
        assert_eq!(restarted_at, Some(6));
    }

    #[test]
    fn log_stamps_moving_backwards_still_count_as_activity() {
        let t0 = Instant::now();
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        world.lock().unwrap().activity = Some(stamp(3600));
        sup.start(t0).unwrap();

        for minute in 1..=30i64 {
            world.lock().unwrap().activity = Some(stamp(3600 - minute));
            sup.tick(t0 + Duration::from_secs(minute as u64 * 60)).unwrap();
        }
        assert_eq!(sup.restarts(), 0);
    }

    #[test]
    fn relaunch_baseline_is_the_relaunch_time() {
        let t0 = Instant::now();
        let secs = |s: u64| t0 + Duration::from_secs(s);
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        sup.start(t0).unwrap();
        sup.tick(secs(301)).unwrap();
        assert_eq!(sup.restarts(), 1);

        // No new activity at all, but the new worker has its own full window.
        sup.tick(secs(500)).unwrap();
        assert_eq!(sup.restarts(), 1);
        sup.tick(secs(602)).unwrap();
        assert_eq!(sup.restarts(), 2);
        assert_eq!(world.lock().unwrap().terminations, 2);
    }

    #[test]
    fn crashed_worker_restarts_from_start_without_hint() {
        let t0 = Instant::now();
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        sup.start(t0).unwrap();

        world.lock().unwrap().exit = Some(ExitInfo { code: Some(1) });
        assert_eq!(
            sup.tick(t0 + Duration::from_secs(10)).unwrap(),
            SupervisorState::Running
        );
        assert_eq!(sup.restarts(), 1);
        let w = world.lock().unwrap();
        assert_eq!(w.launches[1], ResumeMode::Start);
        assert_eq!(w.terminations, 0);
    }

    #[test]
    fn successful_exit_stops_without_relaunch() {
        let t0 = Instant::now();
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        sup.start(t0).unwrap();

        world.lock().unwrap().exit = Some(ExitInfo { code: Some(0) });
        assert_eq!(
            sup.tick(t0 + Duration::from_secs(10)).unwrap(),
            SupervisorState::Stopped
        );
        assert_eq!(world.lock().unwrap().launches.len(), 1);
        assert_eq!(
            sup.tick(t0 + Duration::from_secs(20)).unwrap(),
            SupervisorState::Stopped
        );
    }

    #[test]
    fn restart_delay_holds_in_restarting() {
        let t0 = Instant::now();
        let secs = |s: u64| t0 + Duration::from_secs(s);
        let config = SupervisorConfig {
            restart_delay: Duration::from_secs(30),
            ..SupervisorConfig::default()
        };
        let (world, mut sup) = supervisor(config);
        sup.start(t0).unwrap();

        world.lock().unwrap().exit = Some(ExitInfo { code: None });
        assert_eq!(sup.tick(secs(10)).unwrap(), SupervisorState::Restarting);
        assert_eq!(sup.tick(secs(20)).unwrap(), SupervisorState::Restarting);
        assert_eq!(world.lock().unwrap().launches.len(), 1);
        assert_eq!(sup.tick(secs(40)).unwrap(), SupervisorState::Running);
        assert_eq!(world.lock().unwrap().launches.len(), 2);
    }

    #[test]
    fn stubborn_worker_is_killed_after_grace_without_blocking() {
        let t0 = Instant::now();
        let secs = |s: u64| t0 + Duration::from_secs(s);
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        world.lock().unwrap().stubborn = true;
        sup.start(t0).unwrap();

        let started = Instant::now();
        assert_eq!(sup.tick(secs(301)).unwrap(), SupervisorState::Stalled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sup.tick(secs(305)).unwrap(), SupervisorState::Stalled);
        assert_eq!(world.lock().unwrap().kills, 0);

        // Grace of 10s is over.
        assert_eq!(sup.tick(secs(312)).unwrap(), SupervisorState::Running);
        let w = world.lock().unwrap();
        assert_eq!((w.terminations, w.kills), (1, 1));
        assert_eq!(w.launches.len(), 2);
    }

    #[test]
    fn failed_relaunch_stays_restarting_and_retries() {
        let t0 = Instant::now();
        let secs = |s: u64| t0 + Duration::from_secs(s);
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        world.lock().unwrap().failing_attempt = Some(1);
        sup.start(t0).unwrap();

        world.lock().unwrap().exit = Some(ExitInfo { code: Some(1) });
        let err = sup.tick(secs(10)).unwrap_err();
        assert!(matches!(err, SupervisorError::Launch(_)));
        assert_eq!(sup.state(), SupervisorState::Restarting);
        assert_eq!(sup.restarts(), 0);

        assert_eq!(sup.tick(secs(20)).unwrap(), SupervisorState::Running);
        assert_eq!(sup.restarts(), 1);
        assert_eq!(world.lock().unwrap().launches.len(), 2);
    }

    #[test]
    fn stop_terminates_the_worker() {
        let (world, mut sup) = supervisor(SupervisorConfig::default());
        sup.start(Instant::now()).unwrap();
        sup.stop().unwrap();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(world.lock().unwrap().terminations, 1);
    }

    #[test]
    fn stall_reason_messages() {
        assert_eq!(
            StallReason::WorkerExited { code: Some(2) }.to_string(),
            "worker exited with code 2"
        );
        assert_eq!(
            StallReason::LivenessTimeout {
                idle: Duration::from_secs(305)
            }
            .to_string(),
            "liveness timeout (305s without activity)"
        );
    }

    #[tokio::test]
    async fn shutdown_future_stops_the_loop() {
        let (world, mut sup) = supervisor(SupervisorConfig {
            poll_interval: Duration::from_millis(10),
            ..SupervisorConfig::default()
        });

        sup.run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        let w = world.lock().unwrap();
        assert_eq!(w.launches.len(), 1);
        assert_eq!(w.terminations, 1);
    }

    #[tokio::test]
    async fn loop_survives_a_failed_relaunch() {
        let (world, mut sup) = supervisor(SupervisorConfig {
            poll_interval: Duration::from_millis(10),
            ..SupervisorConfig::default()
        });
        {
            let mut w = world.lock().unwrap();
            w.crash_first = true;
            w.failing_attempt = Some(1);
        }

        sup.run_until(tokio::time::sleep(Duration::from_millis(150)))
            .await
            .unwrap();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sup.restarts(), 1);
        let w = world.lock().unwrap();
        assert_eq!(w.attempts, 3);
        assert_eq!(w.launches.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_kills_a_stubborn_worker_after_grace() {
        let (world, mut sup) = supervisor(SupervisorConfig {
            poll_interval: Duration::from_millis(10),
            terminate_grace: Duration::from_millis(50),
            ..SupervisorConfig::default()
        });
        world.lock().unwrap().stubborn = true;

        sup.run_until(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        let w = world.lock().unwrap();
        assert_eq!((w.terminations, w.kills), (1, 1));
    }
}
