//! Runs a session against this process's own stdio, standing in for a
//! remote client.

use std::io::IsTerminal;
use std::sync::Arc;

use tracing::{info, warn};

use super::{ExitOutcome, PtyRequest, Session, SessionControl, SessionRequest};
use crate::config::Config;
use crate::pty::{NativeProvider, ProcessProvider};
use crate::relay::OutputSink;

const DEFAULT_TERM: &str = "xterm-256color";

pub struct LocalOptions {
    pub command: String,
    /// Never allocate a terminal, even when stdin is one.
    pub force_pipes: bool,
}

pub async fn run(config: Arc<Config>, options: LocalOptions) -> ExitOutcome {
    let provider: Arc<dyn ProcessProvider> = Arc::new(NativeProvider::new(config.wait_delay));
    let interactive = !options.force_pipes && std::io::stdin().is_terminal();

    let (mut request, control) = SessionRequest::new(
        "local",
        options.command,
        Box::new(tokio::io::stdin()),
        OutputSink::new(tokio::io::stdout()),
    );

    let mut _raw_mode = None;
    if interactive {
        let term = std::env::var("TERM").unwrap_or_else(|_| DEFAULT_TERM.to_string());
        let (width, height) = host_window_size().unwrap_or((80, 24));
        request = request.with_pty(PtyRequest { term, width, height });
        _raw_mode = raw_mode();
    }
    info!(
        "Running locally with shell {:?} ({})",
        config.shell,
        if interactive { "pty" } else { "pipes" }
    );

    let forwarder = tokio::spawn(forward_host_signals(control));
    let outcome = Session::new(request, config, provider).run().await;
    forwarder.abort();
    outcome
}

#[cfg(unix)]
async fn forward_host_signals(control: SessionControl) {
    use crate::signals::{HostEvent, HostSignals};

    let mut signals = match HostSignals::new() {
        Ok(signals) => signals,
        Err(e) => {
            warn!("Cannot listen for host signals: {}", e);
            return;
        }
    };
    while let Some(event) = signals.recv().await {
        let sent = match event {
            HostEvent::Signal(signal) => control.signals.send(signal.name().to_string()).is_ok(),
            HostEvent::WindowChange => match host_window_size() {
                Some(size) => control.window_changes.send(size).is_ok(),
                None => true,
            },
        };
        if !sent {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn forward_host_signals(control: SessionControl) {
    use crate::signals::Signal;

    while tokio::signal::ctrl_c().await.is_ok() {
        if control.signals.send(Signal::Int.name().to_string()).is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn host_window_size() -> Option<(u32, u32)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `ws` is a valid out pointer for the duration of the call.
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ as _, &mut ws as *mut _) };
    if rc < 0 || ws.ws_col == 0 || ws.ws_row == 0 {
        return None;
    }
    Some((u32::from(ws.ws_col), u32::from(ws.ws_row)))
}

#[cfg(not(unix))]
fn host_window_size() -> Option<(u32, u32)> {
    None
}

/// Puts the host terminal in raw mode until dropped, so keystrokes reach the
/// program untouched.
#[cfg(unix)]
struct RawModeGuard {
    saved: nix::sys::termios::Termios,
}

#[cfg(unix)]
fn raw_mode() -> Option<RawModeGuard> {
    use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

    let stdin = std::io::stdin();
    let saved = match tcgetattr(&stdin) {
        Ok(saved) => saved,
        Err(e) => {
            warn!("Cannot read terminal attributes: {}", e);
            return None;
        }
    };
    let mut raw = saved.clone();
    cfmakeraw(&mut raw);
    if let Err(e) = tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
        warn!("Cannot switch terminal to raw mode: {}", e);
        return None;
    }
    Some(RawModeGuard { saved })
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};

        if let Err(e) = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.saved) {
            tracing::debug!("Restoring terminal attributes failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn raw_mode() -> Option<()> {
    None
}
