#![cfg(unix)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use shellbridge::pty::BoxedReader;
use shellbridge::{
    Config, ExitOutcome, NativeProvider, OutputSink, PtyRequest, Session, SessionControl,
    SessionRequest,
};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for Capture {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn config(shell: &str) -> Config {
    Config {
        shell: shell.to_string(),
        wait_delay: Duration::from_millis(500),
        ..Config::default()
    }
}

struct Running {
    output: Capture,
    control: SessionControl,
    session: tokio::task::JoinHandle<ExitOutcome>,
}

fn start(
    config: Config,
    command: &str,
    input: BoxedReader,
    customize: impl FnOnce(SessionRequest) -> SessionRequest,
) -> Running {
    let config = Arc::new(config);
    let provider = Arc::new(NativeProvider::new(config.wait_delay));
    let output = Capture::default();
    let (request, control) =
        SessionRequest::new("integration", command, input, OutputSink::new(output.clone()));
    let session = tokio::spawn(Session::new(customize(request), config, provider).run());
    Running {
        output,
        control,
        session,
    }
}

async fn run(config: Config, command: &str) -> (String, ExitOutcome) {
    let running = start(config, command, Box::new(tokio::io::empty()), |r| r);
    finish(running).await
}

async fn finish(running: Running) -> (String, ExitOutcome) {
    let outcome = tokio::time::timeout(Duration::from_secs(20), running.session)
        .await
        .expect("session did not finish")
        .unwrap();
    (running.output.text(), outcome)
}

fn terminal(width: u32, height: u32) -> PtyRequest {
    PtyRequest {
        term: "xterm".to_string(),
        width,
        height,
    }
}

#[tokio::test]
async fn test_echo_through_sh() {
    let (output, outcome) = run(config("sh"), "echo hi").await;
    assert_eq!(output, "hi\n");
    assert_eq!(outcome.code, 0);
    assert_eq!(outcome.message, None);
}

#[tokio::test]
async fn test_echo_on_a_pty() {
    let running = start(config("sh"), "echo hi", Box::new(tokio::io::empty()), |r| {
        r.with_pty(terminal(80, 24))
    });
    let (output, outcome) = finish(running).await;
    assert!(output.contains("hi"), "{output:?}");
    assert_eq!(outcome.code, 0);
}

#[tokio::test]
async fn test_exit_code_passes_through() {
    let (_, outcome) = run(config("sh"), "exit 3").await;
    assert_eq!(outcome.code, 3);
}

#[tokio::test]
async fn test_stderr_is_merged() {
    let (output, outcome) = run(config("sh"), "echo oops >&2; exit 1").await;
    assert_eq!(output, "oops\n");
    assert_eq!(outcome.code, 1);
}

#[tokio::test]
async fn test_killed_by_signal_reports_128_plus_n() {
    let (_, outcome) = run(config("sh"), "kill -TERM $$").await;
    assert_eq!(outcome.code, 143);
    assert_eq!(outcome.message.as_deref(), Some("terminated by SIGTERM"));
}

#[tokio::test]
async fn test_missing_shell_reports_and_exits_127() {
    let shell = "shellbridge-no-such-shell";
    let (output, outcome) = run(config(shell), "Get-Date").await;
    assert_eq!(outcome.code, 127);
    assert!(output.starts_with("cannot start program: spawn:"), "{output:?}");
    assert!(output.ends_with('\n'));
}

#[tokio::test]
async fn test_missing_powershell_reports_and_exits_127() {
    let installed = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).any(|dir| dir.join("powershell").exists()))
        .unwrap_or(false);
    if installed {
        return;
    }
    let (output, outcome) = run(config("powershell"), "Get-Date").await;
    assert_eq!(outcome.code, 127);
    assert!(output.starts_with("cannot start program"), "{output:?}");
}

#[tokio::test]
async fn test_unlexable_shell_reports_and_exits_127() {
    let (output, outcome) = run(config("sh -c 'oops"), "true").await;
    assert_eq!(outcome.code, 127);
    assert!(output.starts_with("failed to construct shell command"), "{output:?}");
}

#[tokio::test]
async fn test_input_reaches_program_and_eof_closes_stdin() {
    let input: &'static [u8] = b"one\ntwo\n";
    let running = start(config("sh"), "cat", Box::new(input), |r| r);
    let (output, outcome) = finish(running).await;
    assert_eq!(output, "one\ntwo\n");
    assert_eq!(outcome.code, 0);
}

#[tokio::test]
async fn test_environment_precedence() {
    let mut config = config("sh");
    config.env = vec!["A=config".to_string()];
    let running = start(
        config,
        "echo $A $B $TERM",
        Box::new(tokio::io::empty()),
        |r| {
            r.with_env(vec![
                "A=session".to_string(),
                "B=session".to_string(),
                "TERM=session".to_string(),
            ])
        },
    );
    let (output, _) = finish(running).await;
    assert_eq!(output, "config session session\n");
}

#[tokio::test]
async fn test_no_env_starts_from_empty_environment() {
    let mut config = config("/bin/sh");
    config.no_env = true;
    config.env = vec!["X=1".to_string()];
    std::env::set_var("SHELLBRIDGE_TEST_LEAK", "leaked");

    let (output, outcome) = run(config, "echo ${SHELLBRIDGE_TEST_LEAK:-unset} $X").await;
    assert_eq!(output, "unset 1\n");
    assert_eq!(outcome.code, 0);
}

#[tokio::test]
async fn test_chdir() {
    let dir = std::env::temp_dir().canonicalize().unwrap();
    let mut config = config("sh");
    config.chdir = Some(dir.clone());

    let (output, _) = run(config, "pwd -P").await;
    assert_eq!(output.trim_end(), dir.to_string_lossy());
}

#[tokio::test]
async fn test_forwarded_term_ends_program() {
    let running = start(config("sh"), "exec sleep 10", Box::new(tokio::io::empty()), |r| r);
    running.control.signals.send("TERM".to_string()).unwrap();
    let (_, outcome) = finish(running).await;
    assert_eq!(outcome.code, 143);
}

#[tokio::test]
async fn test_cancel_kills_piped_program() {
    let running = start(config("sh"), "exec sleep 30", Box::new(tokio::io::empty()), |r| r);
    tokio::time::sleep(Duration::from_millis(100)).await;
    running.control.cancel.cancel();
    let (_, outcome) = finish(running).await;
    assert_eq!(outcome.code, 137);
}

#[tokio::test]
async fn test_window_change_reaches_pty() {
    let (mut keyboard, input) = tokio::io::duplex(64);
    let running = start(config("sh"), "read line; stty size", Box::new(input), |r| {
        r.with_pty(terminal(80, 24))
    });

    running.control.window_changes.send((40000, 24)).unwrap();
    running.control.window_changes.send((100, 30)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    keyboard.write_all(b"go\n").await.unwrap();

    let (output, outcome) = finish(running).await;
    assert!(output.contains("30 100"), "{output:?}");
    assert_eq!(outcome.code, 0);
}
