//! One remote execution, from raw command to exit status.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::command;
use crate::config::Config;
use crate::error::BridgeError;
use crate::pty::{
    BoxedReader, ExitStatus, Launched, ProcessIo, ProcessProvider, ProcessSpec, WindowSize,
    SENTINEL_EXIT_CODE,
};
use crate::relay::{OutputSink, Relays};
use crate::signals::{self, Signal};

pub mod local;

/// Terminal the remote side asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub width: u32,
    pub height: u32,
}

/// Everything the transport hands over for one session.
pub struct SessionRequest {
    /// Who is asking; only used in logs.
    pub remote: String,
    /// Empty means an interactive login shell.
    pub command: String,
    pub pty: Option<PtyRequest>,
    /// `KEY=VALUE` assignments sent by the client.
    pub env: Vec<String>,
    pub input: BoxedReader,
    pub output: OutputSink,
    pub signals: mpsc::UnboundedReceiver<String>,
    pub window_changes: mpsc::UnboundedReceiver<(u32, u32)>,
    /// Fires when the underlying connection goes away.
    pub cancel: CancellationToken,
}

/// The transport's side of a session: where signal and window-change
/// requests are pushed.
#[derive(Clone)]
pub struct SessionControl {
    pub signals: mpsc::UnboundedSender<String>,
    pub window_changes: mpsc::UnboundedSender<(u32, u32)>,
    pub cancel: CancellationToken,
}

impl SessionRequest {
    pub fn new(
        remote: impl Into<String>,
        command: impl Into<String>,
        input: BoxedReader,
        output: OutputSink,
    ) -> (Self, SessionControl) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let request = Self {
            remote: remote.into(),
            command: command.into(),
            pty: None,
            env: Vec::new(),
            input,
            output,
            signals: signal_rx,
            window_changes: resize_rx,
            cancel: cancel.clone(),
        };
        let control = SessionControl {
            signals: signal_tx,
            window_changes: resize_tx,
            cancel,
        };
        (request, control)
    }

    pub fn with_pty(mut self, pty: PtyRequest) -> Self {
        self.pty = Some(pty);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// The final word on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: SENTINEL_EXIT_CODE,
            message: Some(message.into()),
        }
    }

    fn exited(status: ExitStatus) -> Self {
        let message = match status {
            ExitStatus::Code(_) => None,
            ExitStatus::Signal(sig) => Some(format!("terminated by {}", signals::describe(sig))),
            ExitStatus::Unknown => Some("exit status unknown".to_string()),
        };
        Self {
            code: status.exit_code(),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Composing,
    Launching,
    Running,
    Exited,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Session {
    request: SessionRequest,
    config: Arc<Config>,
    provider: Arc<dyn ProcessProvider>,
    state: SessionState,
}

impl Session {
    pub fn new(
        request: SessionRequest,
        config: Arc<Config>,
        provider: Arc<dyn ProcessProvider>,
    ) -> Self {
        Self {
            request,
            config,
            provider,
            state: SessionState::Init,
        }
    }

    /// Drives the session to completion. Always yields exactly one outcome.
    pub async fn run(self) -> ExitOutcome {
        let span = info_span!("session", client = %self.request.remote);
        self.drive().instrument(span).await
    }

    fn advance(&mut self, next: SessionState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }

    async fn fail(&mut self, err: BridgeError) -> ExitOutcome {
        self.advance(SessionState::Failed);
        let line = match &err {
            BridgeError::Launch(e) => format!("cannot start program: {e}"),
            e => e.to_string(),
        };
        error!("{}", line);
        if let Err(e) = self.request.output.write_line(&line).await {
            debug!("Failed to report error to client: {}", e);
        }
        ExitOutcome::failed(line)
    }

    async fn drive(mut self) -> ExitOutcome {
        self.advance(SessionState::Composing);
        let argv = match command::compose(&self.request.command, &self.config.shell) {
            Ok(argv) => argv,
            Err(e) => return self.fail(e.into()).await,
        };
        let term = self.request.pty.as_ref().map(|pty| pty.term.as_str());
        let spec = ProcessSpec::new(argv, &self.config, &self.request.env, term);

        self.advance(SessionState::Launching);
        if self.request.cancel.is_cancelled() {
            return self.fail(BridgeError::Cancelled).await;
        }

        info!("start {:?}", spec.argv);
        let launched = match &self.request.pty {
            Some(pty) => {
                let size = WindowSize::new(pty.width, pty.height).unwrap_or_else(|e| {
                    warn!("Initial {}, using the default size", e);
                    WindowSize::default()
                });
                self.provider.start_interactive(&spec, size)
            }
            None => self.provider.start_piped(&spec, self.request.output.clone()),
        };
        let Launched { io, mut process } = match launched {
            Ok(launched) => launched,
            Err(e) => return self.fail(e.into()).await,
        };

        self.advance(SessionState::Running);
        let input: BoxedReader = Box::new(tokio::io::empty());
        let input = std::mem::replace(&mut self.request.input, input);
        let relays = match io {
            ProcessIo::Pty { reader, writer } => {
                Relays::pty(input, self.request.output.clone(), reader, writer)
            }
            ProcessIo::Piped { stdin } => Relays::piped(input, stdin),
        };
        let interactive = self.request.pty.is_some();

        info!("waiting");
        let mut connected = true;
        let status = loop {
            tokio::select! {
                status = process.wait() => break status,
                Some(name) = self.request.signals.recv(), if connected => {
                    let signal = Signal::from_name(&name);
                    debug!("Forwarding {} (requested {:?}) to {}", signal, name, process.pid());
                    if let Err(e) = process.signal(signal) {
                        warn!("{}", e);
                    }
                }
                Some((width, height)) = self.request.window_changes.recv(), if connected => {
                    if !interactive {
                        debug!("Ignoring window change without a terminal");
                        continue;
                    }
                    let resized = WindowSize::new(width, height)
                        .and_then(|size| process.resize(size));
                    if let Err(e) = resized {
                        warn!("Window change to {}x{} rejected: {}", width, height, e);
                    }
                }
                _ = self.request.cancel.cancelled(), if connected => {
                    info!("Connection closed while running");
                    connected = false;
                    if !interactive {
                        if let Err(e) = process.signal(Signal::Kill) {
                            debug!("{}", e);
                        }
                    }
                }
            }
        };

        let status = status.unwrap_or_else(|e| {
            error!("{}", e);
            ExitStatus::Unknown
        });
        relays.finish(self.config.wait_delay).await;
        if let Err(e) = process.close() {
            debug!("Closing terminal failed: {}", e);
        }

        self.advance(SessionState::Exited);
        let outcome = ExitOutcome::exited(status);
        info!("exit status {} ({:?})", outcome.code, status);
        outcome
    }
}
