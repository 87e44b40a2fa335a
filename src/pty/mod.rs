//! Launching programs behind a pseudo-terminal or plain pipes.
//!
//! One native provider is compiled per target: `unix` opens a pty pair,
//! `windows` builds a pseudo-console and falls back to pipes when the
//! console API is missing.

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{LaunchError, ResizeError, RuntimeError, SignalDeliveryError};
use crate::relay::OutputSink;
use crate::signals::Signal;

pub mod child;
pub mod lifecycle;
pub mod spec;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use lifecycle::{ExitStatus, SENTINEL_EXIT_CODE};
pub use spec::{Environment, ProcessSpec};

#[cfg(unix)]
pub use self::unix::NativeProvider;
#[cfg(windows)]
pub use self::windows::NativeProvider;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Terminal dimensions in character cells. Both values fit an `i16`, which
/// is what pseudo-consoles accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u16,
    pub height: u16,
}

impl WindowSize {
    pub fn new(width: u32, height: u32) -> Result<Self, ResizeError> {
        let limit = i16::MAX as u32;
        if width > limit || height > limit {
            return Err(ResizeError::OutOfRange { width, height });
        }
        Ok(Self {
            width: width as u16,
            height: height as u16,
        })
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// How the session talks to a freshly started program.
pub enum ProcessIo {
    /// Both directions of the terminal.
    Pty {
        reader: BoxedReader,
        writer: BoxedWriter,
    },
    /// The program's stdin. Its output is already flowing into the sink.
    Piped { stdin: BoxedWriter },
}

pub struct Launched {
    pub io: ProcessIo,
    pub process: Box<dyn RunningProcess>,
}

pub trait ProcessProvider: Send + Sync {
    fn start_interactive(
        &self,
        spec: &ProcessSpec,
        size: WindowSize,
    ) -> Result<Launched, LaunchError>;

    /// Starts `spec` on pipes; stdout and stderr are copied into `output`.
    fn start_piped(&self, spec: &ProcessSpec, output: OutputSink) -> Result<Launched, LaunchError>;
}

/// A started program owned by exactly one session.
pub trait RunningProcess: Send {
    fn pid(&self) -> u32;

    /// Resolves once the program has exited. Cancel-safe: dropping the
    /// future and calling again picks up where it left off.
    fn wait(&mut self) -> BoxFuture<'_, Result<ExitStatus, RuntimeError>>;

    fn signal(&mut self, signal: Signal) -> Result<(), SignalDeliveryError>;

    fn resize(&mut self, size: WindowSize) -> Result<(), ResizeError>;

    /// Releases terminal resources. Idempotent; also done on drop.
    fn close(&mut self) -> std::io::Result<()>;
}
