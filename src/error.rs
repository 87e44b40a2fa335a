use std::io;

use thiserror::Error;

/// Failure to turn a raw command into argv. Terminal for the session.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("failed to construct shell command from {shell:?}: {reason}")]
    Lex { shell: String, reason: String },

    #[error("shell command {0:?} contains no program")]
    EmptyShell(String),

    #[error("failed to encode command {0:?}: it contains a NUL character")]
    Encoding(String),
}

/// A native call failed while starting the program. Terminal for the session.
#[derive(Error, Debug)]
#[error("{op}: {source}")]
pub struct LaunchError {
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

impl LaunchError {
    pub fn new(op: &'static str, source: io::Error) -> Self {
        Self { op, source }
    }

    /// Wraps the calling thread's last OS error.
    pub fn last_os_error(op: &'static str) -> Self {
        Self::new(op, io::Error::last_os_error())
    }
}

/// Relay or wait fault once the program runs. Logged, never fatal.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("relay {direction} failed: {source}")]
    Relay {
        direction: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("waiting for process failed: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Error, Debug)]
#[error("failed to deliver {signal} to process {pid}: {source}")]
pub struct SignalDeliveryError {
    pub signal: &'static str,
    pub pid: u32,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("window size {width}x{height} out of range")]
    OutOfRange { width: u32, height: u32 },

    #[error("resize is not supported without a terminal")]
    Unsupported,

    #[error("resize failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    SignalDelivery(#[from] SignalDeliveryError),

    #[error(transparent)]
    Resize(#[from] ResizeError),

    #[error("connection closed before launch")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
