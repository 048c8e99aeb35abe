// SPDX-License-Identifier: MIT
//! Per-client session state.
//!
//! A session owns everything belonging to one connection: its access level,
//! the core it is bound to, the queue of lines parked while a core reply is
//! outstanding, the command currently accumulating a data set, and the
//! outbound writer.  TCP and HTTP connections share all of it; they differ
//! only in how replies are framed, which the three forward hooks below
//! dispatch on.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::core::CommandEntry;
use crate::http;
use crate::protocol::{self, AccessLevel, FAIL_STR};
use crate::writer::Writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp,
    Http,
}

/// Extra state for one-shot HTTP conversations.
#[derive(Debug, Default)]
pub struct HttpState {
    /// Header lines received so far; cleared once the blank line arrives.
    pub request_lines: Vec<String>,
    /// The request start line, kept for logging.
    pub request_line: String,
    /// The response header has been written; later status lines go to the
    /// body as-is.
    pub header_sent: bool,
    /// Set once the reply is complete; the connection is shut down as soon
    /// as the core has nothing more for this client.
    pub conversation_finished: bool,
}

/// Rolling per-session counters, reset roughly every 10 seconds by the
/// housekeeping tick. Mostly useful for debugging chatty clients.
#[derive(Debug)]
pub struct SessionStats {
    pub window_started: Instant,
    pub lines_received: u64,
    pub bytes_received: u64,
    pub core_commands: u64,
    pub server_commands: u64,
    pub data_records: u64,
    pub lines_parked: u64,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            window_started: Instant::now(),
            lines_received: 0,
            bytes_received: 0,
            core_commands: 0,
            server_commands: 0,
            data_records: 0,
            lines_parked: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

pub struct Session {
    pub id: u32,
    pub access_level: AccessLevel,
    pub kind: ConnectionKind,
    /// Zero until bound to a core.
    pub core_id: u32,
    /// The bound core went away; the next core-bound command gets one
    /// synthesized ERROR status line.
    pub lost_core: bool,
    pub writer: Writer,
    /// Lines held back while this session waits for a core reply.
    pub parked_lines: VecDeque<String>,
    /// Command currently accumulating its data set, not yet dispatched.
    pub pending_command: Option<CommandEntry>,
    /// Set once we half-closed the socket; the session is destroyed when the
    /// peer's EOF is observed.
    pub shutdown_sent: bool,
    pub http: HttpState,
    pub stats: SessionStats,
}

impl Session {
    pub fn new(id: u32, kind: ConnectionKind, writer: Writer) -> Self {
        Self {
            id,
            access_level: AccessLevel::Read,
            kind,
            core_id: 0,
            lost_core: false,
            writer,
            parked_lines: VecDeque::new(),
            pending_command: None,
            shutdown_sent: false,
            http: HttpState::default(),
            stats: SessionStats::new(),
        }
    }

    pub fn is_http(&self) -> bool {
        self.kind == ConnectionKind::Http
    }

    // ─── Forward hooks ───────────────────────────────────────────────────────
    //
    // Every byte a client receives flows through one of these three.

    /// Forward a status line. For HTTP this also emits the response header,
    /// mapped from the status token, on the first status line of the
    /// conversation.
    pub fn forward_statusline(&mut self, line: &str) {
        match self.kind {
            ConnectionKind::Tcp => self.writer.enqueue(line),
            ConnectionKind::Http => {
                if !self.http.header_sent {
                    let (code, title) = http::status_for_line(line);
                    self.writer
                        .enqueue(http::response_header(code, title, Some(line)));
                    self.http.header_sent = true;
                }
                self.writer.enqueue(line);
                if !protocol::line_indicates_dataset(line) {
                    self.http.conversation_finished = true;
                }
            }
        }
    }

    /// Forward one data-set line verbatim. The blank terminator completes an
    /// HTTP conversation.
    pub fn forward_dataset(&mut self, line: &str) {
        self.writer.enqueue(line);
        if self.is_http() && protocol::is_blank(line) {
            self.http.conversation_finished = true;
        }
    }

    /// Tell the client a command does not exist. HTTP uses a dedicated 501
    /// status here, so this cannot go through `forward_statusline`.
    pub fn command_not_found(&mut self, text: &str) {
        match self.kind {
            ConnectionKind::Tcp => self.writer.enqueue(format!("{FAIL_STR} {text}\n")),
            ConnectionKind::Http => {
                if !self.http.header_sent {
                    self.writer
                        .enqueue(http::response_header(501, "Not Implemented", None));
                    self.http.header_sent = true;
                }
                self.writer.enqueue(format!("{FAIL_STR} {text}\n"));
                self.http.conversation_finished = true;
            }
        }
    }

    /// Log and reset the rolling stats window if it has run its ~10 seconds.
    pub fn roll_stats_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.stats.window_started).as_secs_f64();
        if elapsed < 10.0 {
            return;
        }
        debug!(
            client = self.id,
            lines_per_s = format!("{:.1}", self.stats.lines_received as f64 / elapsed),
            bytes_per_s = format!("{:.0}", self.stats.bytes_received as f64 / elapsed),
            core_commands = self.stats.core_commands,
            server_commands = self.stats.server_commands,
            parked = self.stats.lines_parked,
            "session window"
        );
        self.stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn drain(mut rx: tokio::io::DuplexStream, writer: &Writer) -> String {
        writer.shutdown();
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn tcp_forwarding_is_verbatim() {
        let (tx, rx) = tokio::io::duplex(4096);
        let mut s = Session::new(1, ConnectionKind::Tcp, Writer::spawn(tx, |_| {}));
        s.forward_statusline("OK roots:\n");
        s.forward_dataset("a\n");
        s.forward_dataset("\n");
        assert_eq!(drain(rx, &s.writer).await, "OK roots:\na\n\n");
    }

    #[tokio::test]
    async fn http_status_line_gets_wrapped_once() {
        let (tx, rx) = tokio::io::duplex(4096);
        let mut s = Session::new(1, ConnectionKind::Http, Writer::spawn(tx, |_| {}));
        s.forward_statusline("OK roots:\n");
        assert!(!s.http.conversation_finished);
        s.forward_dataset("a\n");
        s.forward_dataset("\n");
        assert!(s.http.conversation_finished);

        let out = drain(rx, &s.writer).await;
        assert_eq!(
            out,
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nX-GraphProcessor: OK roots:\r\n\r\nOK roots:\na\n\n"
        );
    }

    #[tokio::test]
    async fn http_value_status_maps_to_222() {
        let (tx, rx) = tokio::io::duplex(4096);
        let mut s = Session::new(1, ConnectionKind::Http, Writer::spawn(tx, |_| {}));
        s.forward_statusline("VALUE 42\n");
        assert!(s.http.conversation_finished);
        let out = drain(rx, &s.writer).await;
        assert!(out.starts_with("HTTP/1.0 222 Value Follows\r\n"));
        assert!(out.contains("X-GraphProcessor: VALUE 42\r\n"));
    }

    #[tokio::test]
    async fn http_command_not_found_is_501() {
        let (tx, rx) = tokio::io::duplex(4096);
        let mut s = Session::new(1, ConnectionKind::Http, Writer::spawn(tx, |_| {}));
        s.command_not_found("no such core command 'zap'.");
        assert!(s.http.conversation_finished);
        let out = drain(rx, &s.writer).await;
        assert!(out.starts_with("HTTP/1.0 501 Not Implemented\r\n"));
        assert!(out.ends_with("FAILURE no such core command 'zap'.\n"));
    }
}
