//! Engine abstraction for opaque agent processes.
//!
//! Engines are the only components that talk to an actual agent runtime.
//! Each engine maps a prompt to a concrete command line and parses that
//! runtime's response-stream schema back into one uniform shape:
//! response text, token counts, and a cost-or-duration metric. The
//! process plumbing (spawn, stdin prompt, stdout tee, stderr log,
//! timeout, escalating stop) is shared by every engine.

use crate::core::error::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write as _};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Upper bound on captured stdout/stderr per invocation.
const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Grace period between the stop signal and the kill signal.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// One engine invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Full prompt, delivered on stdin.
    pub prompt: String,
    /// File receiving the complete parseable stdout.
    pub output_file: PathBuf,
    /// Working directory for the agent (the task's worktree).
    pub working_dir: Option<PathBuf>,
    /// File receiving stderr.
    pub log_file: Option<PathBuf>,
    /// File receiving a live copy of stdout for progress classification.
    pub tee_file: Option<PathBuf>,
    /// Wall-clock bound on the invocation.
    pub timeout: Duration,
}

impl InvokeRequest {
    /// Creates a request with a prompt and output file.
    #[must_use]
    pub fn new(prompt: impl Into<String>, output_file: PathBuf) -> Self {
        Self {
            prompt: prompt.into(),
            output_file,
            working_dir: None,
            log_file: None,
            tee_file: None,
            timeout: Duration::from_secs(1800),
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn in_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Sets the stderr log file.
    #[must_use]
    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Sets the stdout tee file.
    #[must_use]
    pub fn with_tee(mut self, path: PathBuf) -> Self {
        self.tee_file = Some(path);
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Cost or duration, whichever the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Actual spend in USD.
    CostUsd(f64),
    /// Wall-clock duration in milliseconds.
    DurationMs(u64),
}

/// An error record found in the parsed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub code: String,
    pub message: String,
}

impl StreamError {
    /// Creates a stream error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The uniform parse of an engine's response stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedStream {
    /// Concatenated agent response text.
    pub response_text: String,
    /// Input tokens, when the engine reports them.
    pub input_tokens: Option<u64>,
    /// Output tokens, when the engine reports them.
    pub output_tokens: Option<u64>,
    /// Cost or duration, when the engine reports either.
    pub metric: Option<Metric>,
    /// Error record, if one appeared in the stream.
    pub error: Option<StreamError>,
}

impl ParsedStream {
    /// True when the stream carried neither text nor an error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.response_text.trim().is_empty() && self.error.is_none()
    }
}

/// Common engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine name.
    pub name: String,
    /// Runtime binary.
    pub binary_path: PathBuf,
    /// Fixed arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Default invocation timeout.
    pub timeout: Duration,
}

impl EngineConfig {
    /// Creates a config.
    pub fn new(name: impl Into<String>, binary_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            binary_path,
            args: Vec::new(),
            env: HashMap::new(),
            timeout: Duration::from_secs(1800),
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// An agent engine: distinct command line, distinct stream schema.
pub trait Engine: Send + Sync + std::fmt::Debug {
    /// Engine name.
    fn name(&self) -> &str;

    /// Shared configuration.
    fn config(&self) -> &EngineConfig;

    /// Parses this engine's raw stdout into the uniform shape.
    fn parse(&self, raw: &str) -> ParsedStream;

    /// Runs the agent to completion, honoring the cancellation token.
    fn execute(&self, request: &InvokeRequest, cancel: &AtomicBool) -> Result<ParsedStream> {
        let mut cmd = Command::new(&self.config().binary_path);
        cmd.args(&self.config().args);
        for (key, value) in &self.config().env {
            cmd.env(key, value);
        }
        let capture = run_streaming(cmd, request, cancel, self.name())?;
        let parsed = self.parse(&capture.stdout);
        Ok(parsed)
    }

    /// Verifies the runtime binary responds. Tries `--version`, then
    /// `--help`.
    fn health_check(&self) -> Result<()> {
        let binary = &self.config().binary_path;
        for flag in ["--version", "--help"] {
            let status = Command::new(binary)
                .arg(flag)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if matches!(status, Ok(s) if s.success()) {
                return Ok(());
            }
        }
        Err(ConductorError::environment(
            "engine_unavailable",
            format!("Engine binary {} is not responding", binary.display()),
            format!("engine:{}", self.name()),
        )
        .with_hint("Install the runtime or pass a different --engine"))
    }
}

/// Raw capture of an engine process.
#[derive(Debug)]
struct RawCapture {
    stdout: String,
    #[allow(dead_code)]
    exit_code: i32,
}

/// Spawns the command, feeds the prompt on stdin, streams stdout to the
/// buffer and tee file, stderr to the log file, and enforces the timeout
/// and cancellation token. Partial output is flushed to disk even when
/// the child is stopped mid-stream.
fn run_streaming(
    mut cmd: Command,
    request: &InvokeRequest,
    cancel: &AtomicBool,
    engine_name: &str,
) -> Result<RawCapture> {
    let origin = format!("engine:{engine_name}");

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &request.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        ConductorError::agent("spawn_failed", format!("Failed to spawn agent: {e}"), &origin)
            .recoverable(false)
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(request.prompt.as_bytes()).map_err(|e| {
            ConductorError::agent(
                "stdin_write_failed",
                format!("Failed to write prompt: {e}"),
                &origin,
            )
        })?;
    }

    let stdout = child.stdout.take().ok_or_else(|| {
        ConductorError::agent("stdout_capture_failed", "Missing stdout pipe", &origin)
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        ConductorError::agent("stderr_capture_failed", "Missing stderr pipe", &origin)
    })?;

    let tee_path = request.tee_file.clone();
    let stdout_handle = std::thread::spawn(move || {
        let mut tee = tee_path.and_then(|p| std::fs::File::create(p).ok());
        read_limited(stdout, OUTPUT_LIMIT_BYTES, |chunk| {
            if let Some(tee) = tee.as_mut() {
                let _ = tee.write_all(chunk);
                let _ = tee.flush();
            }
        })
    });

    let log_path = request.log_file.clone();
    let stderr_handle = std::thread::spawn(move || {
        let mut log = log_path.and_then(|p| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .ok()
        });
        read_limited(stderr, OUTPUT_LIMIT_BYTES, |chunk| {
            if let Some(log) = log.as_mut() {
                let _ = log.write_all(chunk);
            }
        })
    });

    let started = Instant::now();
    let mut stop_cause: Option<&str> = None;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(|e| {
            ConductorError::agent("wait_failed", format!("Failed to wait for agent: {e}"), &origin)
        })? {
            break status;
        }

        if cancel.load(Ordering::SeqCst) {
            stop_cause = Some("canceled");
            stop_child(&mut child);
            break child.wait().map_err(|e| {
                ConductorError::agent("wait_failed", e.to_string(), &origin)
            })?;
        }
        if started.elapsed() > request.timeout {
            stop_cause = Some("timeout");
            stop_child(&mut child);
            break child.wait().map_err(|e| {
                ConductorError::agent("wait_failed", e.to_string(), &origin)
            })?;
        }

        std::thread::sleep(Duration::from_millis(25));
    };

    // Join readers so partial output lands in the tee/log files before we
    // report anything.
    let stdout_content = stdout_handle.join().unwrap_or_default();
    let _ = stderr_handle.join();

    std::fs::write(&request.output_file, &stdout_content)?;

    match stop_cause {
        Some("canceled") => Err(ConductorError::agent(
            "canceled",
            "Agent execution canceled by graceful stop",
            &origin,
        )
        .recoverable(false)),
        Some(_) => Err(ConductorError::agent(
            "timeout",
            format!("Agent timeout after {:?}", request.timeout),
            &origin,
        )),
        None => Ok(RawCapture {
            stdout: stdout_content,
            exit_code: status.code().unwrap_or(-1),
        }),
    }
}

/// Sends the stop signal, waits a short grace, then kills.
fn stop_child(child: &mut Child) {
    let pid = child.id().to_string();
    let _ = Command::new("kill").arg(&pid).status();
    if child.wait_timeout(STOP_GRACE).ok().flatten().is_none() {
        let _ = child.kill();
    }
}

/// Reads a stream to a bounded string, passing every chunk to `sink`
/// (tee/log) even past the in-memory limit.
fn read_limited<R: Read>(
    mut reader: R,
    limit: usize,
    mut sink: impl FnMut(&[u8]),
) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                sink(&chunk[..n]);
                let keep = n.min(limit.saturating_sub(buf.len()));
                buf.extend_from_slice(&chunk[..keep]);
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A scripted engine for tests.
///
/// Pops one response per invocation, records every prompt, and writes
/// scripted stream content to the tee file so progress classification can
/// be exercised without a subprocess.
#[derive(Debug, Default)]
pub struct MockEngine {
    config: EngineConfig,
    state: Mutex<MockEngineState>,
}

#[derive(Debug, Default)]
struct MockEngineState {
    responses: Vec<ParsedStream>,
    tee_content: Option<String>,
    prompts: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("mock", PathBuf::from("/bin/true"))
    }
}

impl MockEngine {
    /// Creates a mock that answers every invocation with plain text.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            state: Mutex::new(MockEngineState::default()),
        }
    }

    /// Queues a response. Responses are consumed in order; when the queue
    /// runs dry the mock answers with a default non-empty stream.
    pub fn push_response(&self, response: ParsedStream) {
        self.state
            .lock()
            .expect("mock engine lock")
            .responses
            .push(response);
    }

    /// Sets content written to the tee file on every invocation.
    pub fn set_tee_content(&self, content: impl Into<String>) {
        self.state.lock().expect("mock engine lock").tee_content = Some(content.into());
    }

    /// Prompts received so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.state.lock().expect("mock engine lock").prompts.clone()
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn parse(&self, raw: &str) -> ParsedStream {
        ParsedStream {
            response_text: raw.to_string(),
            ..ParsedStream::default()
        }
    }

    fn execute(&self, request: &InvokeRequest, _cancel: &AtomicBool) -> Result<ParsedStream> {
        let mut state = self.state.lock().expect("mock engine lock");
        state.prompts.push(request.prompt.clone());

        if let Some(tee) = &state.tee_content {
            if let Some(path) = &request.tee_file {
                let _ = std::fs::write(path, tee);
            }
        }

        let response = if state.responses.is_empty() {
            ParsedStream {
                response_text: "ok".to_string(),
                ..ParsedStream::default()
            }
        } else {
            state.responses.remove(0)
        };

        let _ = std::fs::write(&request.output_file, &response.response_text);
        Ok(response)
    }

    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
