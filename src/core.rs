// SPDX-License-Identifier: MIT
//! Core process handles.
//!
//! A `CoreInstance` owns one graph-engine child process: its stdin writer,
//! the FIFO of client commands waiting to run on it, and the two-flag reply
//! state machine that decides what the next line on its stdout means.  The
//! child's stdout and stderr are read by plumbing tasks that convert pipe
//! data into server events; all queue and state mutation happens on the
//! server task.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::linebuf::LineBuffer;
use crate::protocol::{self, PROTOCOL_VERSION, SUCCESS_STR};
use crate::server::ServerEvent;
use crate::writer::Writer;

/// How long a freshly spawned core gets to answer the version handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// One queued client command, with its data set if the command line carried
/// the trailing colon.
#[derive(Debug)]
pub struct CommandEntry {
    /// The verbatim command line, trailing colon and newline included, so the
    /// core sees exactly the framing the client sent.
    pub command: String,
    pub client_id: u32,
    pub accepts_data: bool,
    pub data_finished: bool,
    pub data: Vec<String>,
}

impl CommandEntry {
    pub fn new(client_id: u32, mut line: String) -> Self {
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let accepts_data = protocol::line_indicates_dataset(&line);
        Self {
            command: line,
            client_id,
            accepts_data,
            data_finished: false,
            data: Vec::new(),
        }
    }

    /// A command may be written to the core once its data set (if any) has
    /// been fully received.
    pub fn flushable(&self) -> bool {
        !self.accepts_data || self.data_finished
    }

    /// Append one data record. A blank line terminates the set; the
    /// terminator itself is stored so it reaches the core.
    pub fn append_data(&mut self, line: String) {
        let blank = protocol::is_blank(&line);
        self.data.push(line);
        if blank {
            self.data_finished = true;
        }
    }

    /// Terminate a half-open data set so the core is not left mid-record.
    pub fn force_finish_data(&mut self) {
        if self.accepts_data && !self.data_finished {
            self.data.push("\n".to_string());
            self.data_finished = true;
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreStartError {
    #[error("couldn't spawn '{path}': {source}")]
    Spawn {
        path: String,
        source: std::io::Error,
    },
    #[error("core replied: {0}")]
    Handshake(String),
    #[error("protocol version mismatch (server: {server} core: {core})")]
    VersionMismatch { server: String, core: String },
    #[error("child process exited: {0}")]
    ChildExited(String),
    #[error("no reply to version handshake")]
    HandshakeTimeout,
}

/// A running graph-engine child process.
pub struct CoreInstance {
    id: u32,
    name: String,
    pid: u32,
    /// Flips false exactly once: on stdout EOF or terminate().
    pub running: bool,
    /// Session that ran the last command, i.e. who receives current output.
    pub last_client_id: u32,
    /// Expecting a status reply from the core.
    pub expecting_reply: bool,
    /// Expecting data-set lines from the core.
    pub expecting_dataset: bool,
    writer: Writer,
    queue: VecDeque<CommandEntry>,
}

impl CoreInstance {
    /// Spawn the core binary and run the protocol-version handshake.  The
    /// child runs in the binary's directory; on a mismatch or a dead child
    /// the process is reaped and the reason surfaced to the caller.
    pub async fn start(
        id: u32,
        name: String,
        core_path: &Path,
        events: UnboundedSender<ServerEvent>,
    ) -> Result<Self, CoreStartError> {
        let (dir, bin) = split_binary_path(core_path);
        let mut child = Command::new(&bin)
            .current_dir(&dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| CoreStartError::Spawn {
                path: core_path.display().to_string(),
                source: e,
            })?;
        let pid = child.id().unwrap_or(0);

        let mut stdin = child.stdin.take().expect("child stdin is piped");
        let mut stdout = child.stdout.take().expect("child stdout is piped");
        let stderr = child.stderr.take().expect("child stderr is piped");

        // Version handshake: one command out, exactly one line back.
        let mut linebuf = LineBuffer::new();
        let mut extra_lines = VecDeque::new();
        let handshake = async {
            stdin.write_all(b"protocol-version\n").await?;
            read_one_line(&mut stdout, &mut linebuf, &mut extra_lines).await
        };
        let reply = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                // EOF before any reply: reap and report why the child died.
                return Err(CoreStartError::ChildExited(reap_exit_reason(child).await));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(CoreStartError::Spawn {
                    path: core_path.display().to_string(),
                    source: e,
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(CoreStartError::HandshakeTimeout);
            }
        };

        let reply = reply.trim_end();
        let Some(version) = reply.strip_prefix(SUCCESS_STR) else {
            let _ = child.kill().await;
            return Err(CoreStartError::Handshake(reply.to_string()));
        };
        let version = version.trim();
        if version != PROTOCOL_VERSION {
            let _ = child.kill().await;
            return Err(CoreStartError::VersionMismatch {
                server: PROTOCOL_VERSION.to_string(),
                core: version.to_string(),
            });
        }

        let writer = {
            let events = events.clone();
            Writer::spawn(stdin, move |error| {
                // Stdout will reach EOF shortly; teardown happens there.
                let _ = events.send(ServerEvent::CoreWriteFailed { id, error });
            })
        };
        spawn_stdout_reader(id, child, stdout, linebuf, extra_lines, events.clone());
        spawn_stderr_reader(name.clone(), id, stderr);

        Ok(Self {
            id,
            name,
            pid,
            running: true,
            last_client_id: 0,
            expecting_reply: false,
            expecting_dataset: false,
            writer,
            queue: VecDeque::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Display name; unnamed cores show as `Core<id>`.
    pub fn name(&self) -> String {
        if self.name.is_empty() {
            format!("Core{:02}", self.id)
        } else {
            self.name.clone()
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The reply state machine is idle: the next queued command may run.
    pub fn is_idle(&self) -> bool {
        !self.expecting_reply && !self.expecting_dataset
    }

    /// Send SIGTERM. The reactor reaps the child once stdout reaches EOF.
    pub fn terminate(&mut self) {
        self.running = false;
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(core = %self.name(), pid = self.pid, "kill(SIGTERM) failed");
        }
    }

    /// Append a command to the queue tail. Strictly FIFO across all clients
    /// sharing this core.
    pub fn queue_command(&mut self, entry: CommandEntry) {
        self.queue.push_back(entry);
    }

    /// Write out queued commands while the head is complete and the state
    /// machine is idle.
    pub fn flush_command_queue(&mut self) {
        while self.is_idle() {
            let Some(head) = self.queue.front() else {
                break;
            };
            if !head.flushable() {
                break;
            }
            let entry = self.queue.pop_front().expect("head exists");
            debug!(core = %self.name(), client = entry.client_id, command = %entry.command.trim_end(),
                "writing command to core");
            self.writer.enqueue(entry.command);
            for record in entry.data {
                self.writer.enqueue(record);
            }
            self.last_client_id = entry.client_id;
            self.expecting_reply = true;
        }
    }

    /// True if the core is currently producing output for this client or has
    /// one of its commands queued.
    pub fn has_data_for_client(&self, client_id: u32) -> bool {
        (self.last_client_id == client_id && !self.is_idle())
            || self.queue.iter().any(|e| e.client_id == client_id)
    }

    /// Most recently queued command for this client, if any.
    pub fn find_last_client_command(&mut self, client_id: u32) -> Option<&mut CommandEntry> {
        self.queue.iter_mut().rev().find(|e| e.client_id == client_id)
    }

    /// Bytes queued for the core's stdin but not yet written.
    pub fn stdin_pending_bytes(&self) -> usize {
        self.writer.pending_bytes()
    }
}

/// The binary's directory and its basename, exec'd relative to that
/// directory so cores find their data files next to the binary.
fn split_binary_path(path: &Path) -> (PathBuf, PathBuf) {
    let dir = match path.parent() {
        Some(d) if d.as_os_str().is_empty() => PathBuf::from("."),
        Some(d) => d.to_path_buf(),
        None => PathBuf::from("."),
    };
    let bin = path
        .file_name()
        .map(|n| Path::new(".").join(n))
        .unwrap_or_else(|| path.to_path_buf());
    (dir, bin)
}

/// Read whole chunks until one complete line is available. Lines completed
/// beyond the first are queued for the stdout reader task.
async fn read_one_line(
    stdout: &mut ChildStdout,
    linebuf: &mut LineBuffer,
    extra: &mut VecDeque<String>,
) -> std::io::Result<Option<String>> {
    use tokio::io::AsyncReadExt;
    if let Some(line) = extra.pop_front() {
        return Ok(Some(line));
    }
    let mut buf = [0u8; 256];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let mut lines = linebuf.feed(&buf[..n]).into_iter();
        if let Some(first) = lines.next() {
            extra.extend(lines);
            return Ok(Some(first));
        }
    }
}

/// Wait for a dead child and describe why it died, decoding the defined
/// child setup exit codes.
async fn reap_exit_reason(mut child: tokio::process::Child) -> String {
    match child.wait().await {
        Ok(status) => match status.code() {
            Some(101) => "setup failed.".to_string(),
            Some(102) => "couldn't exec.".to_string(),
            Some(103) => "couldn't change directory.".to_string(),
            Some(code) => format!("unknown error code {code}"),
            None => "child process terminated by signal".to_string(),
        },
        Err(e) => format!("waitpid failed: {e}"),
    }
}

/// Forward complete stdout lines as events; on EOF reap the child and
/// schedule core removal.
fn spawn_stdout_reader(
    id: u32,
    mut child: tokio::process::Child,
    mut stdout: ChildStdout,
    mut linebuf: LineBuffer,
    extra_lines: VecDeque<String>,
    events: UnboundedSender<ServerEvent>,
) {
    use tokio::io::AsyncReadExt;
    tokio::spawn(async move {
        for line in extra_lines {
            if events.send(ServerEvent::CoreLine { id, line }).is_err() {
                return;
            }
        }
        let mut buf = [0u8; 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in linebuf.feed(&buf[..n]) {
                        if events.send(ServerEvent::CoreLine { id, line }).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        let status = child.wait().await.ok();
        let _ = events.send(ServerEvent::CoreExited { id, status });
    });
}

/// Core stderr goes to the log, tagged with the core's name.
fn spawn_stderr_reader(name: String, id: u32, mut stderr: ChildStderr) {
    use tokio::io::AsyncReadExt;
    tokio::spawn(async move {
        let mut linebuf = LineBuffer::new();
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in linebuf.feed(&buf[..n]) {
                        info!(target: "core_stderr", core = %name, id, "{}", line.trim_end());
                    }
                }
            }
        }
    });
}
