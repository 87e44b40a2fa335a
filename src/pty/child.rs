//! A program started through `tokio::process`, used by every backend except
//! the Windows pseudo-console.

use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{ExitStatus, ProcessSpec, RunningProcess, WindowSize};
use crate::error::{LaunchError, ResizeError, RuntimeError, SignalDeliveryError};
use crate::signals::Signal;

/// Terminal side kept alive for as long as the program runs.
pub(crate) trait Terminal: Send {
    fn resize(&self, size: WindowSize) -> io::Result<()>;
}

/// Builds a command with exactly the environment in `spec`.
pub(crate) fn command(spec: &ProcessSpec) -> Command {
    let mut cmd = Command::new(spec.program());
    cmd.args(spec.args()).env_clear();
    for (key, value) in spec.env.iter() {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    cmd
}

pub(crate) fn spawn(mut cmd: Command) -> Result<Child, LaunchError> {
    // Dropping the command releases our copies of the child's stdio.
    cmd.spawn().map_err(|e| LaunchError::new("spawn", e))
}

pub struct ChildProcess {
    child: Child,
    pid: u32,
    terminal: Option<Box<dyn Terminal>>,
    pumps: Vec<JoinHandle<()>>,
    wait_delay: Duration,
    status: Option<ExitStatus>,
    drain_deadline: Option<Instant>,
}

impl ChildProcess {
    pub(crate) fn new(child: Child, wait_delay: Duration) -> Result<Self, LaunchError> {
        let pid = child.id().ok_or_else(|| {
            LaunchError::new("process id", io::Error::new(io::ErrorKind::Other, "child already reaped"))
        })?;
        Ok(Self {
            child,
            pid,
            terminal: None,
            pumps: Vec::new(),
            wait_delay,
            status: None,
            drain_deadline: None,
        })
    }

    pub(crate) fn with_terminal(mut self, terminal: Box<dyn Terminal>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    /// Output pumps to drain before the exit status is reported.
    pub(crate) fn with_pumps(mut self, pumps: Vec<JoinHandle<()>>) -> Self {
        self.pumps = pumps;
        self
    }

    async fn wait_and_drain(&mut self) -> Result<ExitStatus, RuntimeError> {
        let status = match self.status {
            Some(status) => status,
            None => {
                let status = self.child.wait().await.map_err(RuntimeError::Wait)?;
                let status = ExitStatus::from(status);
                debug!("Child process {} exited: {:?}", self.pid, status);
                self.status = Some(status);
                self.drain_deadline = Some(Instant::now() + self.wait_delay);
                status
            }
        };

        let deadline = self.drain_deadline.unwrap_or_else(Instant::now);
        while let Some(pump) = self.pumps.last_mut() {
            if tokio::time::timeout_at(deadline, &mut *pump).await.is_err() {
                debug!("Output of {} still open after exit, abandoning it", self.pid);
                pump.abort();
            }
            self.pumps.pop();
        }
        Ok(status)
    }

    fn exited(&self) -> bool {
        self.status.is_some()
    }
}

impl RunningProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<ExitStatus, RuntimeError>> {
        Box::pin(self.wait_and_drain())
    }

    fn signal(&mut self, signal: Signal) -> Result<(), SignalDeliveryError> {
        let pid = self.pid;
        let failed = |source| SignalDeliveryError {
            signal: signal.name(),
            pid,
            source,
        };
        // Once reaped the pid may belong to someone else.
        if self.exited() {
            return Err(failed(io::Error::from(io::ErrorKind::NotFound)));
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            kill(Pid::from_raw(pid as i32), nix::sys::signal::Signal::from(signal))
                .map_err(|e| failed(e.into()))
        }
        #[cfg(not(unix))]
        {
            debug!("No native {} here, terminating {}", signal, pid);
            self.child.start_kill().map_err(failed)
        }
    }

    fn resize(&mut self, size: WindowSize) -> Result<(), ResizeError> {
        match &self.terminal {
            Some(terminal) => Ok(terminal.resize(size)?),
            None => Err(ResizeError::Unsupported),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.terminal = None;
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        Ok(())
    }
}
