//! Byte relays between a session and its program.
//!
//! Relays are detached tasks. Their end, clean or not, never ends the
//! session; only the program exiting does.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::RuntimeError;
use crate::pty::{BoxedReader, BoxedWriter};

const BUFFER_SIZE: usize = 8192;

/// Session output shared by every writer: relays, output pumps and
/// diagnostics.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl OutputSink {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Writes `line` followed by a newline.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        self.write_all(format!("{line}\n").as_bytes()).await
    }
}

/// Copies `reader` into `sink` until EOF or error.
pub fn spawn_output_pump<R>(reader: R, sink: OutputSink, direction: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = pump(reader, sink).await {
            log_relay_end(RuntimeError::Relay {
                direction,
                source: e,
            });
        }
    })
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: OutputSink) -> io::Result<()> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            // A pty master reports EIO once the last subordinate fd closes.
            Err(e) if is_hangup(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        sink.write_all(&buffer[..n]).await?;
    }
}

fn spawn_input_relay(
    mut input: BoxedReader,
    mut writer: BoxedWriter,
    close_on_eof: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let result: io::Result<()> = async {
            loop {
                let n = input.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buffer[..n]).await?;
                writer.flush().await?;
            }
            if close_on_eof {
                writer.shutdown().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => debug!("Session input closed"),
            Err(e) => log_relay_end(RuntimeError::Relay {
                direction: "input",
                source: e,
            }),
        }
    })
}

fn is_hangup(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    e.kind() == io::ErrorKind::BrokenPipe
}

fn log_relay_end(e: RuntimeError) {
    debug!("{}", e);
}

/// The relay tasks of one running session.
pub struct Relays {
    input: JoinHandle<()>,
    output: Option<JoinHandle<()>>,
}

impl Relays {
    /// Terminal mode: session input into the pty, pty output into the sink.
    pub fn pty(input: BoxedReader, sink: OutputSink, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            input: spawn_input_relay(input, writer, false),
            output: Some(spawn_output_pump(reader, sink, "output")),
        }
    }

    /// Pipe mode: only session input needs relaying. The program sees EOF
    /// when the session input ends.
    pub fn piped(input: BoxedReader, stdin: BoxedWriter) -> Self {
        Self {
            input: spawn_input_relay(input, stdin, true),
            output: None,
        }
    }

    /// Stops reading session input and gives the output relay up to
    /// `wait_delay` to drain.
    pub async fn finish(self, wait_delay: Duration) {
        self.input.abort();
        if let Some(mut output) = self.output {
            if tokio::time::timeout(wait_delay, &mut output).await.is_err() {
                debug!("Output still open after {:?}, abandoning it", wait_delay);
                output.abort();
            }
        }
    }
}
