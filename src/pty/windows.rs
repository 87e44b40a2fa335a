//! Pseudo-console backend, with a plain-pipe fallback for hosts whose
//! kernel32 predates ConPTY.
//!
//! Every native handle is owned by a guard the moment it exists. Locals are
//! dropped in reverse order, so the oldest handle is released last.

use std::ffi::{c_void, OsStr};
use std::fs::File;
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::ptr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use windows::core::{s, w, HRESULT, PCWSTR, PWSTR};
use windows::Win32::Foundation::{HANDLE, WAIT_FAILED};
use windows::Win32::System::Console::COORD;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
    STARTUPINFOEXW,
};

use super::child::{self, ChildProcess};
use super::{
    ExitStatus, Launched, ProcessIo, ProcessProvider, ProcessSpec, RunningProcess, WindowSize,
};
use crate::error::{LaunchError, ResizeError, RuntimeError, SignalDeliveryError};
use crate::relay::{self, OutputSink};
use crate::signals::Signal;

/// Exit code given to a program we terminate on its behalf.
const TERMINATED_EXIT_CODE: u32 = 1;

type RawPcon = isize;
type CreatePseudoConsoleFn =
    unsafe extern "system" fn(COORD, HANDLE, HANDLE, u32, *mut RawPcon) -> HRESULT;
type ResizePseudoConsoleFn = unsafe extern "system" fn(RawPcon, COORD) -> HRESULT;
type ClosePseudoConsoleFn = unsafe extern "system" fn(RawPcon);

/// The ConPTY entry points, looked up at runtime so older systems can still
/// load the binary and fall back to pipes.
struct ConptyApi {
    create: CreatePseudoConsoleFn,
    resize: ResizePseudoConsoleFn,
    close: ClosePseudoConsoleFn,
}

fn conpty_api() -> Option<&'static ConptyApi> {
    static API: OnceLock<Option<ConptyApi>> = OnceLock::new();
    API.get_or_init(|| {
        // SAFETY: the looked-up symbols have exactly the declared signatures.
        unsafe {
            let kernel32 = GetModuleHandleW(w!("kernel32.dll")).ok()?;
            let create = GetProcAddress(kernel32, s!("CreatePseudoConsole"))?;
            let resize = GetProcAddress(kernel32, s!("ResizePseudoConsole"))?;
            let close = GetProcAddress(kernel32, s!("ClosePseudoConsole"))?;
            Some(ConptyApi {
                create: mem::transmute::<_, CreatePseudoConsoleFn>(create),
                resize: mem::transmute::<_, ResizePseudoConsoleFn>(resize),
                close: mem::transmute::<_, ClosePseudoConsoleFn>(close),
            })
        }
    })
    .as_ref()
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle() as _)
}

fn os_error(op: &'static str, e: windows::core::Error) -> LaunchError {
    LaunchError::new(op, e.into())
}

/// Anonymous pipe as (read end, write end).
fn pipe() -> Result<(OwnedHandle, OwnedHandle), LaunchError> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    // SAFETY: both out-pointers are valid; on success we own both handles.
    unsafe {
        CreatePipe(&mut read, &mut write, None, 0).map_err(|e| os_error("CreatePipe", e))?;
        Ok((
            OwnedHandle::from_raw_handle(read.0 as RawHandle),
            OwnedHandle::from_raw_handle(write.0 as RawHandle),
        ))
    }
}

fn async_file(handle: OwnedHandle) -> tokio::fs::File {
    tokio::fs::File::from_std(File::from(handle))
}

struct PseudoConsole {
    handle: RawPcon,
    api: &'static ConptyApi,
}

impl PseudoConsole {
    fn new(
        api: &'static ConptyApi,
        size: WindowSize,
        input: &OwnedHandle,
        output: &OwnedHandle,
    ) -> Result<Self, LaunchError> {
        let mut handle: RawPcon = 0;
        // SAFETY: the pipe ends are valid; the console duplicates them.
        unsafe { (api.create)(coord(size), raw(input), raw(output), 0, &mut handle) }
            .ok()
            .map_err(|e| os_error("CreatePseudoConsole", e))?;
        Ok(Self { handle, api })
    }

    fn resize(&self, size: WindowSize) -> io::Result<()> {
        // SAFETY: the console lives as long as `self`.
        unsafe { (self.api.resize)(self.handle, coord(size)) }
            .ok()
            .map_err(io::Error::from)
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        debug!("Closing pseudo console");
        // SAFETY: closed exactly once, here.
        unsafe { (self.api.close)(self.handle) }
    }
}

fn coord(size: WindowSize) -> COORD {
    // `WindowSize` guarantees both values fit an i16.
    COORD {
        X: size.width as i16,
        Y: size.height as i16,
    }
}

/// Process-creation attribute list carrying one pseudo-console.
struct AttributeList {
    buffer: Vec<usize>,
}

impl AttributeList {
    fn with_pseudo_console(console: &PseudoConsole) -> Result<Self, LaunchError> {
        let mut size = 0usize;
        // SAFETY: a null list only queries the required size; that call is
        // documented to fail with ERROR_INSUFFICIENT_BUFFER.
        let _ = unsafe {
            InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST(ptr::null_mut()), 1, 0, &mut size)
        };
        let words = size.div_ceil(mem::size_of::<usize>());
        let mut buffer = vec![0usize; words.max(1)];

        // SAFETY: `buffer` is at least `size` bytes and pointer aligned.
        unsafe {
            InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST(buffer.as_mut_ptr().cast()),
                1,
                0,
                &mut size,
            )
        }
        .map_err(|e| os_error("InitializeProcThreadAttributeList", e))?;
        let list = Self { buffer };

        // SAFETY: the attribute value is the console handle itself, which
        // outlives the list.
        unsafe {
            UpdateProcThreadAttribute(
                list.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                Some(console.handle as *const c_void),
                mem::size_of::<RawPcon>(),
                None,
                None,
            )
        }
        .map_err(|e| os_error("UpdateProcThreadAttribute", e))?;
        Ok(list)
    }

    fn as_raw(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_ptr() as *mut c_void)
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        // SAFETY: initialized in `with_pseudo_console`, deleted once.
        unsafe { DeleteProcThreadAttributeList(self.as_raw()) }
    }
}

fn wide(value: &OsStr, what: &'static str) -> Result<Vec<u16>, LaunchError> {
    let mut buffer: Vec<u16> = value.encode_wide().collect();
    if buffer.contains(&0) {
        return Err(LaunchError::new(
            what,
            io::Error::new(io::ErrorKind::InvalidInput, "contains a NUL character"),
        ));
    }
    buffer.push(0);
    Ok(buffer)
}

/// `KEY=VALUE\0...\0\0`. Always non-null so an empty environment stays
/// empty instead of inheriting ours.
fn environment_block(spec: &ProcessSpec) -> Result<Vec<u16>, LaunchError> {
    let mut block = Vec::new();
    for (key, value) in spec.env.iter() {
        let mut entry = key.to_os_string();
        entry.push("=");
        entry.push(value);
        block.extend(wide(&entry, "creating utf16 envp")?);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}

/// Joins argv into one command line using the MSVCRT quoting rules.
fn compose_command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\u{b}', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::from('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            c => {
                quoted.extend(iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

/// Finds `program` the way a shell would: as given when it has a directory
/// part, otherwise on the session's `PATH` with `PATHEXT` extensions.
fn resolve_program(spec: &ProcessSpec) -> Result<PathBuf, LaunchError> {
    let program = Path::new(spec.program());
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }

    let extensions: Vec<String> = spec
        .env
        .get("PATHEXT")
        .and_then(OsStr::to_str)
        .unwrap_or(".COM;.EXE;.BAT;.CMD")
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    let path = spec.env.get("PATH").map(OsStr::to_os_string).unwrap_or_default();

    let mut dirs: Vec<PathBuf> = spec.cwd.iter().cloned().collect();
    dirs.extend(std::env::split_paths(&path));
    for dir in dirs {
        let candidate = dir.join(program);
        if program.extension().is_some() && candidate.is_file() {
            return Ok(candidate);
        }
        for ext in &extensions {
            let mut with_ext = candidate.clone().into_os_string();
            with_ext.push(ext);
            let with_ext = PathBuf::from(with_ext);
            if with_ext.is_file() {
                return Ok(with_ext);
            }
        }
    }
    Err(LaunchError::new(
        "resolve program",
        io::Error::new(io::ErrorKind::NotFound, format!("{} not found", spec.program())),
    ))
}

/// Starts programs on a pseudo-console, or on pipes where there is none.
#[derive(Debug, Clone)]
pub struct NativeProvider {
    wait_delay: Duration,
}

impl NativeProvider {
    pub fn new(wait_delay: Duration) -> Self {
        Self { wait_delay }
    }

    fn start_conpty(
        &self,
        api: &'static ConptyApi,
        spec: &ProcessSpec,
        size: WindowSize,
    ) -> Result<Launched, LaunchError> {
        // Console side reads `pts_in` and writes `pts_out`; we keep the others.
        let (pts_in, pty_in) = pipe()?;
        let (pty_out, pts_out) = pipe()?;
        let console = PseudoConsole::new(api, size, &pts_in, &pts_out)?;
        let attributes = AttributeList::with_pseudo_console(&console)?;

        let program = wide(resolve_program(spec)?.as_os_str(), "creating utf16 progname")?;
        let mut command_line = wide(
            OsStr::new(&compose_command_line(&spec.argv)),
            "creating utf16 cmdline",
        )?;
        let workdir = spec
            .cwd
            .as_ref()
            .map(|dir| wide(dir.as_os_str(), "creating utf16 workdir"))
            .transpose()?;
        let environment = environment_block(spec)?;

        let mut startup = STARTUPINFOEXW::default();
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        startup.lpAttributeList = attributes.as_raw();
        let mut info = PROCESS_INFORMATION::default();

        // SAFETY: every buffer is NUL terminated and outlives the call.
        unsafe {
            CreateProcessW(
                PCWSTR(program.as_ptr()),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
                Some(environment.as_ptr().cast()),
                workdir
                    .as_ref()
                    .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
                &startup.StartupInfo,
                &mut info,
            )
        }
        .map_err(|e| os_error("CreateProcess", e))?;

        // SAFETY: CreateProcessW handed us ownership of both handles.
        let process = unsafe { OwnedHandle::from_raw_handle(info.hProcess.0 as RawHandle) };
        drop(unsafe { OwnedHandle::from_raw_handle(info.hThread.0 as RawHandle) });
        drop(attributes);

        info!("Started {:?} on a pseudo console as pid {}", spec.argv, info.dwProcessId);
        Ok(Launched {
            io: ProcessIo::Pty {
                reader: Box::new(async_file(pty_out)),
                writer: Box::new(async_file(pty_in)),
            },
            process: Box::new(ConptyProcess {
                process: Arc::new(process),
                pid: info.dwProcessId,
                console: Some(console),
                waiter: None,
                status: None,
            }),
        })
    }

    /// Starts `spec` with stdout and stderr sharing one pipe.
    fn start_merged(&self, spec: &ProcessSpec) -> Result<(ChildProcess, tokio::fs::File, tokio::process::ChildStdin), LaunchError> {
        let (output_read, output_write) = pipe()?;
        let stderr_write = output_write
            .try_clone()
            .map_err(|e| LaunchError::new("DuplicateHandle", e))?;

        let mut cmd = child::command(spec);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::from(output_write))
            .stderr(Stdio::from(stderr_write))
            .kill_on_drop(true);
        let mut child = child::spawn(cmd)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            LaunchError::new("stdin pipe", io::Error::from(io::ErrorKind::BrokenPipe))
        })?;
        let process = ChildProcess::new(child, self.wait_delay)?;
        Ok((process, async_file(output_read), stdin))
    }
}

impl ProcessProvider for NativeProvider {
    fn start_interactive(
        &self,
        spec: &ProcessSpec,
        size: WindowSize,
    ) -> Result<Launched, LaunchError> {
        if let Some(api) = conpty_api() {
            return self.start_conpty(api, spec, size);
        }

        warn!("Pseudo console unavailable, starting {:?} on pipes", spec.argv);
        let (process, output, stdin) = self.start_merged(spec)?;
        Ok(Launched {
            io: ProcessIo::Pty {
                reader: Box::new(output),
                writer: Box::new(stdin),
            },
            process: Box::new(process),
        })
    }

    fn start_piped(&self, spec: &ProcessSpec, sink: OutputSink) -> Result<Launched, LaunchError> {
        let (process, output, stdin) = self.start_merged(spec)?;
        let pump = relay::spawn_output_pump(output, sink, "output");
        info!("Started {:?} on pipes as pid {}", spec.argv, process.pid());
        Ok(Launched {
            io: ProcessIo::Piped {
                stdin: Box::new(stdin),
            },
            process: Box::new(process.with_pumps(vec![pump])),
        })
    }
}

struct ConptyProcess {
    process: Arc<OwnedHandle>,
    pid: u32,
    console: Option<PseudoConsole>,
    waiter: Option<JoinHandle<Result<ExitStatus, RuntimeError>>>,
    status: Option<ExitStatus>,
}

fn wait_for_exit(process: &OwnedHandle) -> Result<ExitStatus, RuntimeError> {
    // SAFETY: the handle stays open for the duration of both calls.
    unsafe {
        if WaitForSingleObject(raw(process), INFINITE) == WAIT_FAILED {
            return Err(RuntimeError::Wait(io::Error::last_os_error()));
        }
        let mut code = 0u32;
        GetExitCodeProcess(raw(process), &mut code)
            .map_err(|e| RuntimeError::Wait(e.into()))?;
        Ok(ExitStatus::Code(code as i32))
    }
}

impl ConptyProcess {
    async fn wait_inner(&mut self) -> Result<ExitStatus, RuntimeError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let waiter = self.waiter.get_or_insert_with(|| {
            let process = Arc::clone(&self.process);
            tokio::task::spawn_blocking(move || wait_for_exit(&process))
        });
        let result = waiter
            .await
            .map_err(|e| RuntimeError::Wait(io::Error::new(io::ErrorKind::Other, e)));
        self.waiter = None;
        let status = result??;
        debug!("Process {} exited: {:?}", self.pid, status);
        self.status = Some(status);
        self.release_console().await;
        Ok(status)
    }

    /// Closing the console flushes its last frame and ends the output pipe,
    /// so it has to happen while the output relay is still reading.
    async fn release_console(&mut self) {
        if let Some(console) = self.console.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || drop(console)).await {
                warn!("Closing pseudo console failed: {}", e);
            }
        }
    }
}

impl RunningProcess for ConptyProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<ExitStatus, RuntimeError>> {
        Box::pin(self.wait_inner())
    }

    fn signal(&mut self, signal: Signal) -> Result<(), SignalDeliveryError> {
        let pid = self.pid;
        let failed = |source| SignalDeliveryError {
            signal: signal.name(),
            pid,
            source,
        };
        if self.status.is_some() {
            return Err(failed(io::Error::from(io::ErrorKind::NotFound)));
        }
        debug!("No native {} here, terminating {}", signal, pid);
        // SAFETY: the process handle is open until `self` drops.
        unsafe { TerminateProcess(raw(&self.process), TERMINATED_EXIT_CODE) }
            .map_err(|e| failed(e.into()))
    }

    fn resize(&mut self, size: WindowSize) -> Result<(), ResizeError> {
        match &self.console {
            Some(console) => Ok(console.resize(size)?),
            None => Err(ResizeError::Unsupported),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Already released by `wait` unless the program was never waited on.
        self.console = None;
        Ok(())
    }
}
