//! Starting long-term process, capture its stdout/stderr and terminate it with its helpers.

use crate::utils::{absolute, io::BackgroundIoHandle};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid},
};
use std::{
    collections::BTreeMap,
    fmt, io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tokio::process::{Child, Command};

/// Upper bound for draining the output pipes after the process is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start one external process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg<S: Into<String>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(&mut self, key: K, val: V) -> &mut Self {
        self.env.insert(key.into(), val.into());
        self
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn command(&self) -> io::Result<Command> {
        let mut cmd = match self.work_dir.as_ref() {
            // relative program paths stay relative to our directory, not to `work_dir`.
            Some(dir) => {
                let program = if self.program.components().count() > 1 {
                    absolute(&self.program)?
                } else {
                    self.program.clone()
                };
                let mut cmd = Command::new(program);
                cmd.current_dir(dir);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.args(&self.args).envs(&self.env);
        Ok(cmd)
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.env {
            write!(f, "{}={} ", k, v)?;
        }
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{0}' exited before its pid could be read")]
    NoPid(String),
}

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    TimedOut,
}

/// A spawned process running in its own session.
///
/// The process group is killed on every exit path: explicit `terminate`, natural exit of the
/// leader (stragglers are reaped) and drop.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    program: String,
    output: BackgroundIoHandle,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, SpawnError> {
        let program = spec.program.display().to_string();
        let mut cmd = spec.command().map_err(|source| SpawnError::Io {
            program: program.clone(),
            source,
        })?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Io {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SpawnError::NoPid(program.clone()))?;
        let mut output = BackgroundIoHandle::new();
        if let Some(stdout) = child.stdout.take() {
            output.read_background(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            output.read_background(stderr);
        }
        log::debug!("spawned {} (pid {})", program, pid);

        Ok(Self {
            child,
            pid,
            program,
            output,
            status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code of a finished process, `None` while it is running.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.map(exit_code)
    }

    /// Signal that terminated the process, if any.
    pub fn signal(&self) -> Option<i32> {
        self.status.and_then(|s| s.signal())
    }

    pub async fn wait(&mut self) -> io::Result<i32> {
        if let Some(status) = self.status {
            return Ok(exit_code(status));
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        self.kill_group();
        Ok(exit_code(status))
    }

    /// Waits for the process, at most `timeout` if given. The process is left running on timeout.
    pub async fn wait_timeout(&mut self, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        match timeout {
            None => self.wait().await.map(WaitOutcome::Exited),
            Some(du) => match tokio::time::timeout(du, self.wait()).await {
                Ok(code) => code.map(WaitOutcome::Exited),
                Err(_) => Ok(WaitOutcome::TimedOut),
            },
        }
    }

    /// Kills the whole process group and reaps the leader. Idempotent.
    pub async fn terminate(&mut self) -> io::Result<i32> {
        if let Some(status) = self.status {
            return Ok(exit_code(status));
        }
        self.kill_group();
        // setsid may have failed, the leader then is not in its own group.
        if let Err(e) = self.child.start_kill() {
            log::debug!("start_kill {}: {}", self.pid, e);
        }
        self.wait().await
    }

    pub fn is_alive(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                self.kill_group();
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::debug!("try_wait {}: {}", self.pid, e);
                false
            }
        }
    }

    /// Combined stdout and stderr read so far.
    pub fn combined_output(&self) -> Vec<u8> {
        self.output.current_data()
    }

    /// Combined output after the process is gone, drained with a bounded wait.
    pub async fn finish_output(&mut self) -> Vec<u8> {
        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, self.output.wait_finish()).await {
            Ok(data) => data,
            Err(_) => {
                log::debug!("{}: output pipes still open, using partial output", self.program);
                self.output.current_data()
            }
        }
    }

    fn kill_group(&self) {
        match killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::debug!("killpg {}: {}", self.pid, e),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.kill_group();
        }
    }
}

/// Exit code of `status`, signal terminations map to `128 + signo` like a shell does.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
