//! Terminal sessions and ownership.
//!
//! The engine never owns a terminal emulator buffer; it talks to a
//! [`TerminalSession`] and always asks for a fresh snapshot. The built-in
//! [`PipeTerminal`] drives a child shell over pipes (local `sh`, or an
//! `ssh` client for remote hosts); GUI terminals implement the same trait
//! elsewhere.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub mod awareness;

use crate::config::{HostEntry, HostKind};
use crate::errors::{AgentError, TerminalError};

/// Kind of shell behind a session; drives prompt-detection confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Posix,
    Ssh,
    Unknown,
}

/// A live terminal the agent can drive.
#[async_trait]
pub trait TerminalSession: Send + Sync {
    fn id(&self) -> &str;
    fn shell_kind(&self) -> ShellKind;

    /// Write raw bytes (commands must include their trailing newline).
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Last `last_n` visible lines, oldest first. The trailing partial
    /// line (an unterminated prompt) is included as the final entry.
    async fn read_buffer(&self, last_n: usize) -> Vec<String>;

    /// Absolute count of lines produced so far; used to read deltas.
    async fn total_lines(&self) -> usize;

    /// Lines from absolute index `start` onward (clamped to retained
    /// scrollback), plus the trailing partial line.
    async fn lines_from(&self, start: usize) -> Vec<String>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Time since the session last produced output.
    fn last_output_age(&self) -> Duration;
}

impl std::fmt::Debug for dyn TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession").field("id", &self.id()).finish()
    }
}

/// Map a named control key to the bytes to send.
pub fn control_bytes(key: &str) -> Option<&'static [u8]> {
    match key.to_ascii_lowercase().as_str() {
        "ctrl+c" => Some(&[0x03]),
        "ctrl+d" => Some(&[0x04]),
        "ctrl+z" => Some(&[0x1a]),
        "ctrl+l" => Some(&[0x0c]),
        "enter" => Some(b"\n"),
        "tab" => Some(b"\t"),
        "esc" | "escape" => Some(&[0x1b]),
        "space" => Some(b" "),
        "up" => Some(b"\x1b[A"),
        "down" => Some(b"\x1b[B"),
        "right" => Some(b"\x1b[C"),
        "left" => Some(b"\x1b[D"),
        _ => None,
    }
}

/// Retained scrollback per session.
const SCROLLBACK_LINES: usize = 5000;

struct OutputBuffer {
    /// Completed lines, capped at SCROLLBACK_LINES.
    lines: VecDeque<String>,
    /// Absolute index of `lines[0]`.
    base: usize,
    /// Unterminated trailing output (e.g. a prompt).
    partial: String,
}

impl OutputBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            base: 0,
            partial: String::new(),
        }
    }

    fn push_bytes(&mut self, data: &str) {
        self.partial.push_str(data);
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.truncate(line.len() - 1);
            if line.ends_with('\r') {
                line.truncate(line.len() - 1);
            }
            self.lines.push_back(line);
            if self.lines.len() > SCROLLBACK_LINES {
                self.lines.pop_front();
                self.base += 1;
            }
        }
    }

    fn total(&self) -> usize {
        self.base + self.lines.len()
    }

    fn tail(&self, last_n: usize) -> Vec<String> {
        let mut out: Vec<String> = self
            .lines
            .iter()
            .rev()
            .take(last_n)
            .rev()
            .cloned()
            .collect();
        if !self.partial.is_empty() {
            out.push(self.partial.clone());
        }
        out
    }

    fn from_index(&self, start: usize) -> Vec<String> {
        let skip = start.saturating_sub(self.base);
        let mut out: Vec<String> = self.lines.iter().skip(skip).cloned().collect();
        if !self.partial.is_empty() {
            out.push(self.partial.clone());
        }
        out
    }
}

struct PipeShared {
    buffer: Mutex<OutputBuffer>,
    last_output: std::sync::Mutex<Instant>,
}

/// A terminal backed by a child process with piped stdio. No real PTY is
/// allocated, so `resize` is a no-op and full-screen programs will not
/// behave; the awareness layer steers the model away from them.
pub struct PipeTerminal {
    id: String,
    kind: ShellKind,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    shared: Arc<PipeShared>,
}

impl PipeTerminal {
    /// Spawn a local shell session. The shell runs with `-i` so it prints
    /// prompts over the pipe, which is what idle detection keys on.
    pub fn spawn_local(id: impl Into<String>, shell: Option<&str>) -> Result<Self> {
        let shell = shell.unwrap_or(if cfg!(target_os = "windows") {
            "cmd"
        } else {
            "sh"
        });
        let mut cmd = Command::new(shell);
        if !cfg!(target_os = "windows") {
            cmd.arg("-i");
        }
        Self::spawn(id.into(), cmd, ShellKind::Posix)
    }

    /// Spawn an `ssh` client session to `user@host`.
    pub fn spawn_ssh(id: impl Into<String>, connection: &str) -> Result<Self> {
        let mut cmd = Command::new("ssh");
        // Batch-ish interactive: no host-key prompt hangs in unattended runs.
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg(connection);
        Self::spawn(id.into(), cmd, ShellKind::Ssh)
    }

    fn spawn(id: String, mut cmd: Command, kind: ShellKind) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .context("child shell has no stdin handle")?;
        let stdout = child.stdout.take().context("child shell has no stdout")?;
        let stderr = child.stderr.take().context("child shell has no stderr")?;

        let shared = Arc::new(PipeShared {
            buffer: Mutex::new(OutputBuffer::new()),
            last_output: std::sync::Mutex::new(Instant::now()),
        });

        spawn_reader(stdout, Arc::clone(&shared), &id);
        spawn_reader(stderr, Arc::clone(&shared), &id);

        Ok(Self {
            id,
            kind,
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            shared,
        })
    }

    /// True while the underlying process is alive.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

fn spawn_reader<R>(mut reader: R, shared: Arc<PipeShared>, id: &str)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    let id = id.to_string();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(terminal = %id, "terminal output stream closed");
                    break;
                }
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    shared.buffer.lock().await.push_bytes(&text);
                    *shared.last_output.lock().expect("clock lock") = Instant::now();
                }
                Err(e) => {
                    warn!(terminal = %id, "terminal read failed: {}", e);
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl TerminalSession for PipeTerminal {
    fn id(&self) -> &str {
        &self.id
    }

    fn shell_kind(&self) -> ShellKind {
        self.kind
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| TerminalError::Write(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| TerminalError::Write(e.to_string()))?;
        Ok(())
    }

    async fn read_buffer(&self, last_n: usize) -> Vec<String> {
        self.shared.buffer.lock().await.tail(last_n)
    }

    async fn total_lines(&self) -> usize {
        self.shared.buffer.lock().await.total()
    }

    async fn lines_from(&self, start: usize) -> Vec<String> {
        self.shared.buffer.lock().await.from_index(start)
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        // Pipes have no window size; GUI-backed sessions implement this.
        Ok(())
    }

    fn last_output_age(&self) -> Duration {
        self.shared.last_output.lock().expect("clock lock").elapsed()
    }
}

struct ManagedTerminal {
    session: Arc<dyn TerminalSession>,
    owner: Option<String>,
}

/// Registry of open terminals with exclusive run ownership: a terminal is
/// bound to at most one AgentRun at a time.
#[derive(Default)]
pub struct TerminalManager {
    terminals: Mutex<HashMap<String, ManagedTerminal>>,
}

impl TerminalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an externally created session under its id.
    pub async fn insert(&self, session: Arc<dyn TerminalSession>) {
        let id = session.id().to_string();
        self.terminals
            .lock()
            .await
            .insert(id, ManagedTerminal { session, owner: None });
    }

    /// Open a terminal for a host catalog entry and register it.
    pub async fn open_for_host(&self, host: &HostEntry) -> Result<Arc<dyn TerminalSession>> {
        let terminal_id = format!("term-{}", host.id);
        let session: Arc<dyn TerminalSession> = match host.kind {
            HostKind::Local => Arc::new(PipeTerminal::spawn_local(
                terminal_id.clone(),
                host.connection.as_deref(),
            )?),
            HostKind::Ssh => {
                let connection = host
                    .connection
                    .as_deref()
                    .with_context(|| format!("host {} has no connection string", host.id))?;
                Arc::new(PipeTerminal::spawn_ssh(terminal_id.clone(), connection)?)
            }
        };
        self.insert(Arc::clone(&session)).await;
        Ok(session)
    }

    pub async fn get(&self, terminal_id: &str) -> Option<Arc<dyn TerminalSession>> {
        self.terminals
            .lock()
            .await
            .get(terminal_id)
            .map(|m| Arc::clone(&m.session))
    }

    /// Bind a terminal to a run. Fails if another run already owns it.
    pub async fn bind(&self, terminal_id: &str, run_id: &str) -> Result<Arc<dyn TerminalSession>> {
        let mut terminals = self.terminals.lock().await;
        let managed = terminals
            .get_mut(terminal_id)
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()))?;
        match &managed.owner {
            Some(owner) if owner != run_id => Err(AgentError::TerminalBusy {
                terminal_id: terminal_id.to_string(),
                owner: owner.clone(),
            }
            .into()),
            _ => {
                managed.owner = Some(run_id.to_string());
                Ok(Arc::clone(&managed.session))
            }
        }
    }

    /// Release a binding. A non-owner release is a no-op.
    pub async fn release(&self, terminal_id: &str, run_id: &str) {
        if let Some(managed) = self.terminals.lock().await.get_mut(terminal_id) {
            if managed.owner.as_deref() == Some(run_id) {
                managed.owner = None;
            }
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.terminals.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
