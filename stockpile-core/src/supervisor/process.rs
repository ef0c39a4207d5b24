//! Real worker processes: `stockpile fetch ...` children.

use super::{ExitInfo, WorkerHandle, WorkerLauncher};
use crate::pipeline::ResumeMode;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

/// Launches the worker as a subprocess of `program`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    base_args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Relaunch the running binary with `base_args` (e.g. `fetch --config x`).
    pub fn current_exe(base_args: Vec<OsString>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, base_args))
    }

    /// Full argument list for a launch.
    pub fn args_for(&self, mode: &ResumeMode) -> Vec<OsString> {
        let mut args = self.base_args.clone();
        match mode {
            ResumeMode::Start => args.push("--start".into()),
            ResumeMode::FromLog => args.push("--resume".into()),
            ResumeMode::From(sym) => {
                args.push("--resume-from".into());
                args.push(sym.into());
            }
        }
        args
    }
}

impl WorkerLauncher for CommandLauncher {
    type Handle = ChildWorker;

    fn launch(&mut self, mode: &ResumeMode) -> io::Result<ChildWorker> {
        let args = self.args_for(mode);
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()?;
        info!(pid = child.id(), ?args, "worker launched");
        Ok(ChildWorker::new(child))
    }
}

/// A spawned worker. Killed on drop if still running.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
    exit: Option<ExitInfo>,
}

impl ChildWorker {
    pub fn new(child: Child) -> Self {
        Self { child, exit: None }
    }
}

impl WorkerHandle for ChildWorker {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        if self.exit.is_none() {
            self.exit = self
                .child
                .try_wait()?
                .map(|status| ExitInfo { code: status.code() });
        }
        Ok(self.exit)
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            // ESRCH: exited since the last poll.
            debug!(pid = self.child.id(), error = %e, "SIGTERM failed");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match self.child.kill() {
            Ok(()) => {}
            // Already gone between the last poll and now.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        let status = self.child.wait()?;
        self.exit = Some(ExitInfo {
            code: status.code(),
        });
        Ok(())
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn resume_mode_maps_to_worker_flags() {
        let launcher = CommandLauncher::new("stockpile", vec!["fetch".into()]);
        assert_eq!(launcher.args_for(&ResumeMode::Start), vec!["fetch", "--start"]);
        assert_eq!(launcher.args_for(&ResumeMode::FromLog), vec!["fetch", "--resume"]);
        assert_eq!(
            launcher.args_for(&ResumeMode::From("INFY".into())),
            vec!["fetch", "--resume-from", "INFY"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn terminate_stops_a_sleeping_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut worker = ChildWorker::new(child);
        assert_eq!(worker.try_exit().unwrap(), None);

        worker.terminate(Duration::from_secs(5)).unwrap();
        let exit = worker.try_exit().unwrap().unwrap();
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[test]
    fn stop_request_does_not_wait_for_exit() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut worker = ChildWorker::new(child);

        let started = Instant::now();
        worker.request_stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.try_exit().unwrap().is_none() {
            assert!(Instant::now() < deadline, "child ignored SIGTERM");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(unix)]
    #[test]
    fn kill_reaps_the_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut worker = ChildWorker::new(child);
        worker.kill().unwrap();
        assert_eq!(worker.try_exit().unwrap(), Some(ExitInfo { code: None }));
        worker.kill().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_is_reported() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut worker = ChildWorker::new(child);
        let deadline = Instant::now() + Duration::from_secs(5);
        let exit = loop {
            if let Some(exit) = worker.try_exit().unwrap() {
                break exit;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(exit.code, Some(3));
    }
}
