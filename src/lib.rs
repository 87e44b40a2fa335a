//! Shellbridge - run a client's command on this host and relay it back
//!
//! The pieces of one remote execution, from the raw command string to the
//! exit status reported to the client.
//!
//! ## Components
//!
//! - **Command**: raw command to argv, according to the configured shell
//! - **Signals**: abstract signal names to native signals
//! - **PTY**: starting programs on a pseudo-terminal or on pipes
//! - **Relay**: byte copying between the session and the program
//! - **Session**: one execution from start to exit status

pub mod command;
pub mod config;
pub mod error;
pub mod pty;
pub mod relay;
pub mod session;
pub mod signals;

// Re-export commonly used types
pub use command::{compose, Dialect};
pub use config::Config;
pub use error::{BridgeError, Result};
pub use pty::{ExitStatus, NativeProvider, ProcessProvider, ProcessSpec, WindowSize};
pub use relay::OutputSink;
pub use session::{ExitOutcome, PtyRequest, Session, SessionControl, SessionRequest};
pub use signals::Signal;
