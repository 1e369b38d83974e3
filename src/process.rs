// Process execution for external tools: interpreter-line resolution, output
// multiplexing through pluggable visibility strategies, and failure bookkeeping

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use crate::container::Container;
use crate::error::{CibootError, ProcessError, Result};
use crate::logging::Printer;

/// Written to the console once per heartbeat interval.
pub const HEARTBEAT_MARKER: &str = ".";

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Abort the whole invocation if this command fails.
    pub instant_fail: bool,
    pub working_dir: Option<PathBuf>,
    /// Overrides layered on top of the container's environment table.
    pub environment: BTreeMap<String, String>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instant_fail(mut self, instant_fail: bool) -> Self {
        self.instant_fail = instant_fail;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Decides what the user sees of a running child's output.
///
/// Implementations own the child until it exits and must drain both pipes
/// concurrently with the wait.
#[async_trait]
pub trait OutputStrategy: Send + Sync {
    async fn drive(&self, command: &str, child: Child, printer: Arc<Printer>)
        -> Result<ExitStatus>;
}

/// Capture everything and show it only if the command fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOnFail;

/// Stream stdout as it arrives; show stderr after exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningOutput;

/// Like `OutputOnFail`, with a heartbeat marker every `interval` while the
/// child runs so CI services don't consider the job stalled.
#[derive(Debug, Clone, Copy)]
pub struct LongRunningSuppressed {
    pub interval: Duration,
}

impl LongRunningSuppressed {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

fn capture_failed(command: &str, message: String) -> CibootError {
    CibootError::Process(Box::new(ProcessError::OutputCaptureFailed {
        message,
        command: command.to_string(),
    }))
}

fn wait_failed(command: &str, error: std::io::Error) -> CibootError {
    CibootError::Process(Box::new(ProcessError::WaitFailed {
        command: command.to_string(),
        error: error.to_string(),
    }))
}

fn drain<R>(stream: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            stream.read_to_end(&mut buffer).await?;
        }
        Ok(buffer)
    })
}

async fn join_buffer(
    command: &str,
    name: &str,
    task: JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>> {
    task.await
        .map_err(|e| capture_failed(command, format!("{name} reader panicked: {e}")))?
        .map_err(|e| capture_failed(command, format!("Failed to read {name}: {e}")))
}

/// Wait for `child` while both pipes drain into private buffers.
async fn wait_captured(command: &str, mut child: Child) -> Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let status = child.wait().await.map_err(|e| wait_failed(command, e))?;
    let stdout = join_buffer(command, "stdout", stdout).await?;
    let stderr = join_buffer(command, "stderr", stderr).await?;
    Ok((status, stdout, stderr))
}

fn show_captured(printer: &Printer, stdout: &[u8], stderr: &[u8]) {
    printer.finish_line();
    printer.write_raw(stdout);
    printer.finish_line();
    printer.write_raw(stderr);
    printer.finish_line();
}

#[async_trait]
impl OutputStrategy for OutputOnFail {
    async fn drive(
        &self,
        command: &str,
        child: Child,
        printer: Arc<Printer>,
    ) -> Result<ExitStatus> {
        let (status, stdout, stderr) = wait_captured(command, child).await?;
        if !status.success() {
            show_captured(&printer, &stdout, &stderr);
        }
        Ok(status)
    }
}

#[async_trait]
impl OutputStrategy for RunningOutput {
    async fn drive(
        &self,
        command: &str,
        mut child: Child,
        printer: Arc<Printer>,
    ) -> Result<ExitStatus> {
        let stdout = child.stdout.take();
        let live = printer.clone();
        let streamer: JoinHandle<std::io::Result<bool>> = tokio::spawn(async move {
            let mut printed = false;
            if let Some(mut stdout) = stdout {
                let mut chunk = [0u8; 4096];
                loop {
                    let read = stdout.read(&mut chunk).await?;
                    if read == 0 {
                        break;
                    }
                    live.write_raw(&chunk[..read]);
                    printed = true;
                }
            }
            Ok(printed)
        });
        let stderr = drain(child.stderr.take());

        let status = child.wait().await.map_err(|e| wait_failed(command, e))?;

        let printed = streamer
            .await
            .map_err(|e| capture_failed(command, format!("stdout reader panicked: {e}")))?
            .map_err(|e| capture_failed(command, format!("Failed to read stdout: {e}")))?;
        if printed {
            printer.finish_line();
        }

        let stderr = join_buffer(command, "stderr", stderr).await?;
        if !stderr.is_empty() {
            printer.write_raw(&stderr);
            printer.finish_line();
        }
        Ok(status)
    }
}

#[async_trait]
impl OutputStrategy for LongRunningSuppressed {
    async fn drive(
        &self,
        command: &str,
        mut child: Child,
        printer: Arc<Printer>,
    ) -> Result<ExitStatus> {
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (stop, mut stopped) = oneshot::channel::<()>();
        let interval = self.interval;
        let beat = printer.clone();
        let heartbeat: JoinHandle<usize> = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            let mut beats = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        beat.write_raw(HEARTBEAT_MARKER.as_bytes());
                        beats += 1;
                    }
                }
            }
            beats
        });

        let waited = child.wait().await;

        // Only stop the heartbeat once the wait is over.
        let _ = stop.send(());
        let beats = heartbeat
            .await
            .map_err(|e| capture_failed(command, format!("heartbeat task panicked: {e}")))?;
        tracing::debug!(command, beats, "Heartbeat stopped");
        printer.finish_line();

        let status = waited.map_err(|e| wait_failed(command, e))?;
        let stdout = join_buffer(command, "stdout", stdout).await?;
        let stderr = join_buffer(command, "stderr", stderr).await?;
        if !status.success() {
            show_captured(&printer, &stdout, &stderr);
        }
        Ok(status)
    }
}

/// Numeric status of an exited child. Signal deaths map to `128 + signal`.
pub fn status_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    if let Some(signal) = status.signal() {
        return 128 + signal;
    }
    1
}

/// Status as shown in failure reports, naming the signal for signal deaths.
pub fn describe_status(status: &ExitStatus) -> String {
    #[cfg(unix)]
    if let Some(signal) = status.signal() {
        let name = nix::sys::signal::Signal::try_from(signal)
            .map(|signal| signal.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {signal}"));
        return format!("{} ({name})", 128 + signal);
    }
    status_code(status).to_string()
}

#[cfg(unix)]
fn is_directly_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_directly_executable(_path: &Path) -> bool {
    false
}

fn read_interpreter_line(path: &Path) -> std::io::Result<Option<String>> {
    let file = std::fs::File::open(path)?;
    let mut line = Vec::new();
    BufReader::new(file.take(1024)).read_until(b'\n', &mut line)?;
    if !line.starts_with(b"#!") {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&line[2..]);
    Ok(Some(line.trim().to_string()))
}

/// Rewrite `argv` so scripts that carry an interpreter line but cannot be
/// executed directly run through that interpreter.
///
/// `#!/usr/bin/env tool` resolves `tool` against `path_var`.
pub fn resolve_interpreter(
    argv: &[String],
    path_var: Option<&str>,
    working_dir: &Path,
) -> Result<Vec<String>> {
    let Some(program) = argv.first() else {
        return Err(CibootError::Process(Box::new(ProcessError::EmptyCommand)));
    };

    let candidate = working_dir.join(program);
    if !candidate.is_file() || is_directly_executable(&candidate) {
        return Ok(argv.to_vec());
    }

    let Some(line) = read_interpreter_line(&candidate)? else {
        return Ok(argv.to_vec());
    };

    let mut parts = line.split_whitespace();
    let Some(interpreter) = parts.next() else {
        return Err(CibootError::Process(Box::new(
            ProcessError::InvalidInterpreter {
                path: candidate,
                line,
            },
        )));
    };
    let mut extra: Vec<&str> = parts.collect();

    let is_env = Path::new(interpreter)
        .file_stem()
        .is_some_and(|stem| stem == "env");
    let mut interpreter = interpreter.to_string();
    if is_env && !extra.is_empty() {
        interpreter = extra.remove(0).to_string();
    }

    if is_env || cfg!(windows) {
        let name = Path::new(&interpreter)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| interpreter.clone());
        let resolved = which::which_in(&name, path_var, working_dir).map_err(|_| {
            CibootError::Process(Box::new(ProcessError::CommandNotFound {
                command: name.clone(),
                suggestion: Some(format!(
                    "{} asks for {name}; make sure it is installed and on PATH",
                    candidate.display()
                )),
            }))
        })?;
        interpreter = resolved.to_string_lossy().to_string();
    }

    let mut rewritten = Vec::with_capacity(argv.len() + extra.len() + 1);
    rewritten.push(interpreter);
    rewritten.extend(extra.into_iter().map(str::to_string));
    rewritten.push(candidate.to_string_lossy().to_string());
    rewritten.extend(argv[1..].iter().cloned());
    tracing::debug!(?rewritten, "Resolved interpreter line");
    Ok(rewritten)
}

/// Run `argv` under `strategy` inside `container` and return its status.
///
/// A non-zero status is logged and counted against the container. With
/// `instant_fail` set, counting it ends the invocation with
/// `CibootError::InstantFail`.
pub async fn execute_async(
    container: &Container,
    strategy: &dyn OutputStrategy,
    argv: &[String],
    options: &ExecuteOptions,
) -> Result<i32> {
    let working_dir = match &options.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let (mut environment, opaque) = {
        let table = container.environment().lock();
        let opaque: Vec<(OsString, OsString)> = table
            .opaque_vars()
            .map(|(name, value)| (name.to_os_string(), value.to_os_string()))
            .collect();
        (table.snapshot(), opaque)
    };
    environment.extend(
        options
            .environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    let argv = resolve_interpreter(
        argv,
        environment.get("PATH").map(String::as_str),
        &working_dir,
    )?;
    let command = argv.join(" ");
    tracing::debug!(command, dir = %working_dir.display(), "Spawning");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&working_dir)
        .env_clear()
        .envs(opaque)
        .envs(&environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CibootError::Process(Box::new(ProcessError::CommandNotFound {
                command: argv[0].clone(),
                suggestion: Some("Check that the tool is installed and on PATH".to_string()),
            }))
        } else {
            CibootError::Process(Box::new(ProcessError::SpawnFailed {
                command: command.clone(),
                error: e.to_string(),
            }))
        }
    })?;

    let printer = container.printer().clone();
    let status = strategy.drive(&command, child, printer.clone()).await?;
    let code = status_code(&status);

    if code != 0 {
        printer.line(&format!(
            "!!! Process {command} failed with {}",
            describe_status(&status)
        ));
        tracing::error!(command, status = code, "Command failed");
        container.note_failure(options.instant_fail)?;
    }

    Ok(code)
}

/// Synchronous facade over `execute_async` with its own single-threaded
/// runtime.
pub struct ProcessRunner {
    runtime: tokio::runtime::Runtime,
}

impl ProcessRunner {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                CibootError::Process(Box::new(ProcessError::RuntimeFailed {
                    error: e.to_string(),
                }))
            })?;
        Ok(Self { runtime })
    }

    pub fn execute(
        &self,
        container: &Container,
        strategy: &dyn OutputStrategy,
        argv: &[String],
        options: &ExecuteOptions,
    ) -> Result<i32> {
        self.runtime
            .block_on(execute_async(container, strategy, argv, options))
    }
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner").finish_non_exhaustive()
    }
}
