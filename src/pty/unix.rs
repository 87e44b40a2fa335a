use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::process::Stdio;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::pty::{self, PtyMaster};
use tracing::{debug, info};

use super::child::{self, ChildProcess, Terminal};
use super::{Launched, ProcessIo, ProcessProvider, ProcessSpec, RunningProcess, WindowSize};
use crate::error::LaunchError;
use crate::relay::{self, OutputSink};

/// Starts programs on a pty pair or on pipes.
#[derive(Debug, Clone)]
pub struct NativeProvider {
    wait_delay: Duration,
}

impl NativeProvider {
    pub fn new(wait_delay: Duration) -> Self {
        Self { wait_delay }
    }
}

struct PtyTerminal {
    master: PtyMaster,
}

impl Terminal for PtyTerminal {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        debug!("Resizing PTY to {}x{}", size.width, size.height);
        set_window_size(&self.master, size)
    }
}

fn set_window_size(master: &PtyMaster, size: WindowSize) -> io::Result<()> {
    let winsize = libc::winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: the fd is open for the lifetime of `master` and `winsize`
    // outlives the call.
    unsafe {
        if libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize as *const _) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn open_master() -> Result<(PtyMaster, String), LaunchError> {
    let errno = |op| move |e: nix::Error| LaunchError::new(op, e.into());

    let master = pty::posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(errno("posix_openpt"))?;
    pty::grantpt(&master).map_err(errno("grantpt"))?;
    pty::unlockpt(&master).map_err(errno("unlockpt"))?;

    // SAFETY: no other thread calls ptsname while the name is copied out.
    let slave_name = unsafe { pty::ptsname(&master) }.map_err(errno("ptsname"))?;

    // Children must not inherit the controlling side.
    // SAFETY: plain fcntl on an fd we own.
    if unsafe { libc::fcntl(master.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(LaunchError::last_os_error("fcntl"));
    }
    Ok((master, slave_name))
}

/// A second handle on the controlling side, for async I/O.
fn dup_master(master: &PtyMaster) -> Result<tokio::fs::File, LaunchError> {
    // SAFETY: the fd stays open while `master` is borrowed.
    let fd = unsafe { BorrowedFd::borrow_raw(master.as_raw_fd()) };
    let owned: OwnedFd = fd
        .try_clone_to_owned()
        .map_err(|e| LaunchError::new("dup pty master", e))?;
    Ok(tokio::fs::File::from_std(File::from(owned)))
}

impl ProcessProvider for NativeProvider {
    fn start_interactive(
        &self,
        spec: &ProcessSpec,
        size: WindowSize,
    ) -> Result<Launched, LaunchError> {
        let (master, slave_name) = open_master()?;
        debug!("PTY slave created: {}", slave_name);
        set_window_size(&master, size).map_err(|e| LaunchError::new("TIOCSWINSZ", e))?;

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&slave_name)
            .map_err(|e| LaunchError::new("open pty slave", e))?;
        let clone_slave = |slave: &File| {
            slave
                .try_clone()
                .map_err(|e| LaunchError::new("dup pty slave", e))
        };

        let reader = dup_master(&master)?;
        let writer = dup_master(&master)?;

        let mut cmd = child::command(spec);
        cmd.stdin(Stdio::from(clone_slave(&slave)?))
            .stdout(Stdio::from(clone_slave(&slave)?))
            .stderr(Stdio::from(slave));
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = child::spawn(cmd)?;

        let process = ChildProcess::new(child, self.wait_delay)?
            .with_terminal(Box::new(PtyTerminal { master }));
        info!("Started {:?} on {} as pid {}", spec.argv, slave_name, process.pid());

        Ok(Launched {
            io: ProcessIo::Pty {
                reader: Box::new(reader),
                writer: Box::new(writer),
            },
            process: Box::new(process),
        })
    }

    fn start_piped(&self, spec: &ProcessSpec, output: OutputSink) -> Result<Launched, LaunchError> {
        let mut cmd = child::command(spec);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = child::spawn(cmd)?;

        let missing = |op| LaunchError::new(op, io::Error::from(io::ErrorKind::BrokenPipe));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin pipe"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout pipe"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr pipe"))?;

        let pumps = vec![
            relay::spawn_output_pump(stdout, output.clone(), "stdout"),
            relay::spawn_output_pump(stderr, output, "stderr"),
        ];
        let process = ChildProcess::new(child, self.wait_delay)?.with_pumps(pumps);
        info!("Started {:?} on pipes as pid {}", spec.argv, process.pid());

        Ok(Launched {
            io: ProcessIo::Piped {
                stdin: Box::new(stdin),
            },
            process: Box::new(process),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::config::Config;
    use crate::pty::ExitStatus;

    fn spec(script: &str) -> ProcessSpec {
        ProcessSpec::new(
            vec!["sh".into(), "-c".into(), script.into()],
            &Config::default(),
            &[],
            Some("xterm"),
        )
    }

    async fn read_until(reader: &mut crate::pty::BoxedReader, needle: &str) -> String {
        let mut seen = Vec::new();
        let mut buffer = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&seen).contains(needle) {
            let n = tokio::time::timeout_at(deadline, reader.read(&mut buffer))
                .await
                .expect("timed out waiting for pty output")
                .unwrap_or(0);
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buffer[..n]);
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[tokio::test]
    async fn test_pty_spawn_sees_a_terminal() {
        let provider = NativeProvider::new(Duration::from_millis(100));
        let launched = provider
            .start_interactive(
                &spec("test -t 0 && test -t 1 && echo tty:$TERM; stty size"),
                WindowSize::new(100, 30).unwrap(),
            )
            .unwrap();
        let Launched { io, mut process } = launched;
        let ProcessIo::Pty { mut reader, .. } = io else {
            panic!("expected a pty");
        };

        let output = read_until(&mut reader, "30 100").await;
        assert!(output.contains("tty:xterm"), "{output:?}");
        assert!(output.contains("30 100"), "{output:?}");
        assert_eq!(process.wait().await.unwrap(), ExitStatus::Code(0));
        process.close().unwrap();
    }

    #[tokio::test]
    async fn test_pty_resize() {
        let provider = NativeProvider::new(Duration::from_millis(100));
        let Launched { io, mut process } = provider
            .start_interactive(&spec("read line; stty size"), WindowSize::default())
            .unwrap();
        let ProcessIo::Pty { mut reader, mut writer } = io else {
            panic!("expected a pty");
        };

        process.resize(WindowSize::new(120, 40).unwrap()).unwrap();
        writer.write_all(b"go\n").await.unwrap();
        writer.flush().await.unwrap();

        let output = read_until(&mut reader, "40 120").await;
        assert!(output.contains("40 120"), "{output:?}");
        assert_eq!(process.wait().await.unwrap(), ExitStatus::Code(0));
    }

    #[tokio::test]
    async fn test_piped_output_reaches_sink_before_exit() {
        let (sink_writer, mut sink_reader) = tokio::io::duplex(1024);
        let provider = NativeProvider::new(Duration::from_millis(500));
        let Launched { mut process, .. } = provider
            .start_piped(&spec("echo out; echo err >&2; exit 4"), OutputSink::new(sink_writer))
            .unwrap();

        assert_eq!(process.wait().await.unwrap(), ExitStatus::Code(4));
        drop(process);

        let mut output = String::new();
        sink_reader.read_to_string(&mut output).await.unwrap();
        assert!(output.contains("out\n"), "{output:?}");
        assert!(output.contains("err\n"), "{output:?}");
    }

    #[tokio::test]
    async fn test_piped_wait_bounded_by_lingering_output() {
        let (sink_writer, mut sink_reader) = tokio::io::duplex(1024);
        let provider = NativeProvider::new(Duration::from_millis(200));
        // The background sleep keeps stdout open long after the shell exits.
        let Launched { mut process, .. } = provider
            .start_piped(&spec("sleep 5 & echo done"), OutputSink::new(sink_writer))
            .unwrap();

        let started = std::time::Instant::now();
        assert_eq!(process.wait().await.unwrap(), ExitStatus::Code(0));
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        process.close().unwrap();
        drop(process);

        let mut output = String::new();
        sink_reader.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "done\n");
    }

    #[tokio::test]
    async fn test_signal_reaches_piped_program() {
        let (sink_writer, _sink_reader) = tokio::io::duplex(1024);
        let provider = NativeProvider::new(Duration::from_millis(100));
        let Launched { mut process, .. } = provider
            .start_piped(&spec("exec sleep 10"), OutputSink::new(sink_writer))
            .unwrap();

        process.signal(crate::signals::Signal::Int).unwrap();
        assert_eq!(process.wait().await.unwrap(), ExitStatus::Signal(2));
    }
}
