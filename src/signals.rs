//! Abstract signal names and their native counterparts.

use std::fmt;
use std::str::FromStr;

/// The POSIX signals a session may ask for by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
}

impl Signal {
    pub const ALL: [Signal; 11] = [
        Signal::Abrt,
        Signal::Alrm,
        Signal::Fpe,
        Signal::Hup,
        Signal::Ill,
        Signal::Int,
        Signal::Kill,
        Signal::Pipe,
        Signal::Quit,
        Signal::Segv,
        Signal::Term,
    ];

    /// Resolves a signal name. Unknown names become `Kill`, so a request is
    /// never silently dropped.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(Signal::Kill)
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Abrt => "ABRT",
            Signal::Alrm => "ALRM",
            Signal::Fpe => "FPE",
            Signal::Hup => "HUP",
            Signal::Ill => "ILL",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Pipe => "PIPE",
            Signal::Quit => "QUIT",
            Signal::Segv => "SEGV",
            Signal::Term => "TERM",
        }
    }
}

/// Host name of signal number `signo`, such as `SIGKILL`. Numbers the
/// host does not know are rendered as `signal <n>`.
pub fn describe(signo: i32) -> String {
    #[cfg(unix)]
    if let Ok(sig) = nix::sys::signal::Signal::try_from(signo) {
        return sig.as_str().to_string();
    }
    format!("signal {signo}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSignal(pub String);

impl fmt::Display for UnknownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown signal {:?}", self.0)
    }
}

impl std::error::Error for UnknownSignal {}

impl FromStr for Signal {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("SIG").unwrap_or(s);
        Signal::ALL
            .into_iter()
            .find(|sig| sig.name() == bare)
            .ok_or_else(|| UnknownSignal(s.to_string()))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

#[cfg(unix)]
impl From<Signal> for nix::sys::signal::Signal {
    fn from(sig: Signal) -> Self {
        use nix::sys::signal::Signal as Native;
        match sig {
            Signal::Abrt => Native::SIGABRT,
            Signal::Alrm => Native::SIGALRM,
            Signal::Fpe => Native::SIGFPE,
            Signal::Hup => Native::SIGHUP,
            Signal::Ill => Native::SIGILL,
            Signal::Int => Native::SIGINT,
            Signal::Kill => Native::SIGKILL,
            Signal::Pipe => Native::SIGPIPE,
            Signal::Quit => Native::SIGQUIT,
            Signal::Segv => Native::SIGSEGV,
            Signal::Term => Native::SIGTERM,
        }
    }
}

#[cfg(unix)]
pub use host::{HostEvent, HostSignals};

#[cfg(unix)]
mod host {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::debug;

    use super::Signal;

    /// Host signals turned into session events: forwardable signals and
    /// terminal window changes.
    pub struct HostSignals {
        sigint: tokio::signal::unix::Signal,
        sigterm: tokio::signal::unix::Signal,
        sighup: tokio::signal::unix::Signal,
        sigquit: tokio::signal::unix::Signal,
        sigwinch: tokio::signal::unix::Signal,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum HostEvent {
        Signal(Signal),
        WindowChange,
    }

    impl HostSignals {
        pub fn new() -> Result<Self, std::io::Error> {
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
                sigquit: signal(SignalKind::quit())?,
                sigwinch: signal(SignalKind::window_change())?,
            })
        }

        /// Waits for the next host signal. Returns `None` once the signal
        /// streams are closed.
        pub async fn recv(&mut self) -> Option<HostEvent> {
            let event = tokio::select! {
                r = self.sigint.recv() => r.map(|_| HostEvent::Signal(Signal::Int)),
                r = self.sigterm.recv() => r.map(|_| HostEvent::Signal(Signal::Term)),
                r = self.sighup.recv() => r.map(|_| HostEvent::Signal(Signal::Hup)),
                r = self.sigquit.recv() => r.map(|_| HostEvent::Signal(Signal::Quit)),
                r = self.sigwinch.recv() => r.map(|_| HostEvent::WindowChange),
            };
            debug!("Host signal: {:?}", event);
            event
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_name_resolves_to_itself() {
        for sig in Signal::ALL {
            assert_eq!(Signal::from_name(sig.name()), sig);
            assert_eq!(Signal::from_name(&format!("SIG{}", sig.name())), sig);
        }
    }

    #[test]
    fn test_unknown_names_terminate() {
        for name in ["USR1", "WINCH", "", "int", "SIG", "SIGSTOP"] {
            assert_eq!(Signal::from_name(name), Signal::Kill, "{name}");
        }
    }

    #[test]
    fn test_parse_reports_unknown_name() {
        assert_eq!(
            "USR2".parse::<Signal>(),
            Err(UnknownSignal("USR2".to_string()))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Signal::Term.to_string(), "SIGTERM");
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_names_host_signals() {
        assert_eq!(describe(9), "SIGKILL");
        assert_eq!(describe(15), "SIGTERM");
        assert_eq!(describe(1000), "signal 1000");
    }

    #[cfg(unix)]
    #[test]
    fn test_native_translation() {
        use nix::sys::signal::Signal as Native;
        assert_eq!(Native::from(Signal::Int), Native::SIGINT);
        assert_eq!(Native::from(Signal::Kill), Native::SIGKILL);
        assert_eq!(Native::from(Signal::Segv), Native::SIGSEGV);
    }
}
