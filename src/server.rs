// SPDX-License-Identifier: MIT
//! The server task.
//!
//! All sessions and cores live in two id-keyed tables owned by `Server`;
//! cross-references are integer ids resolved through lookup, never pointers,
//! which keeps deferred removal trivial (a stale id simply fails to resolve).
//! Every mutation happens on the one task running `Server::run`.  Connection
//! readers, writers and core pipe readers are plumbing tasks that turn I/O
//! into ordered `ServerEvent`s on a single channel, so the externally
//! observable ordering is that of a single-threaded readiness loop:
//!
//! - within one session, lines reach the router in arrival order;
//! - commands sharing a core enter its FIFO in event-arrival order;
//! - a core's replies go to the session recorded at dispatch time, or are
//!   discarded if it is gone, with the reply state machine advancing either
//!   way.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::auth::{Authority, PasswordAuth};
use crate::commands;
use crate::config::ServerConfig;
use crate::core::{CommandEntry, CoreInstance};
use crate::http::{self, RequestError, UriTarget};
use crate::linebuf::LineBuffer;
use crate::protocol::{self, ERROR_STR, FAIL_STR, PROTOCOL_VERSION, SUCCESS_STR};
use crate::session::{ConnectionKind, Session};
use crate::writer::Writer;

const LISTEN_BACKLOG: u32 = 100;
/// Housekeeping cadence: deferred-removal drain, stats windows, HTTP sweep.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(2);
/// How long to stop accepting after running out of file descriptors.
const ACCEPT_DEFER: Duration = Duration::from_secs(3);

/// Everything the plumbing tasks can tell the server task.
pub enum ServerEvent {
    ClientLine { id: u32, line: String },
    ClientClosed { id: u32, error: Option<std::io::Error> },
    ClientWriteFailed { id: u32, error: std::io::Error },
    CoreLine { id: u32, line: String },
    CoreExited { id: u32, status: Option<ExitStatus> },
    CoreWriteFailed { id: u32, error: std::io::Error },
}

pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) sessions: HashMap<u32, Session>,
    pub(crate) cores: HashMap<u32, CoreInstance>,
    pub(crate) authorities: HashMap<&'static str, Box<dyn Authority>>,
    /// Sessions marked for removal; destroyed only between events, never in
    /// the middle of handling one.
    clients_to_remove: HashSet<u32>,
    session_id_counter: u32,
    core_id_counter: u32,
    pub(crate) lines_from_clients: u64,
    events_tx: UnboundedSender<ServerEvent>,
    events_rx: Option<UnboundedReceiver<ServerEvent>>,
    tcp_listener: Option<TcpListener>,
    http_listener: Option<TcpListener>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let auth = PasswordAuth::open(&config.htpasswd_file, &config.group_file)?;
        let mut authorities: HashMap<&'static str, Box<dyn Authority>> = HashMap::new();
        authorities.insert("password", Box::new(auth));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            sessions: HashMap::new(),
            cores: HashMap::new(),
            authorities,
            clients_to_remove: HashSet::new(),
            session_id_counter: 0,
            core_id_counter: 0,
            lines_from_clients: 0,
            events_tx,
            events_rx: Some(events_rx),
            tcp_listener: None,
            http_listener: None,
        })
    }

    /// Open the configured listen sockets. Separate from `run` so callers
    /// can learn the bound addresses first.
    pub fn bind(&mut self) -> Result<()> {
        if self.config.tcp_port_enabled() {
            self.tcp_listener = Some(
                open_listen_socket(self.config.tcp_port)
                    .with_context(|| format!("TCP listen port {}", self.config.tcp_port))?,
            );
        }
        if self.config.http_port_enabled() {
            self.http_listener = Some(
                open_listen_socket(self.config.http_port)
                    .with_context(|| format!("HTTP listen port {}", self.config.http_port))?,
            );
        }
        Ok(())
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub async fn run(mut self) -> Result<()> {
        let mut events = self.events_rx.take().context("server already running")?;
        let tcp = self.tcp_listener.take();
        let http = self.http_listener.take();
        info!(
            tcp_port = tcp.as_ref().and_then(|l| l.local_addr().ok()).map(|a| a.port()),
            http_port = http.as_ref().and_then(|l| l.local_addr().ok()).map(|a| a.port()),
            "entering main loop"
        );

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        let mut defer_accepts_until: Option<Instant> = None;

        loop {
            // Deferred removal happens between events, so an event handler
            // never sees its session vanish under it.
            self.drain_removals();

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown signal received, terminating graph instances");
                    break;
                }

                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }

                conn = accept_on(tcp.as_ref()), if accepts_allowed(defer_accepts_until) => {
                    self.handle_accept(conn, ConnectionKind::Tcp, &mut defer_accepts_until);
                }

                conn = accept_on(http.as_ref()), if accepts_allowed(defer_accepts_until) => {
                    self.handle_accept(conn, ConnectionKind::Http, &mut defer_accepts_until);
                }

                _ = housekeeping.tick() => {
                    if defer_accepts_until.is_some_and(|t| Instant::now() >= t) {
                        defer_accepts_until = None;
                    }
                    self.housekeeping();
                }
            }

            self.sweep_http_sessions();
        }

        for core in self.cores.values_mut() {
            if core.running {
                core.terminate();
            }
        }
        info!("server stopped");
        Ok(())
    }

    // ─── Connections ─────────────────────────────────────────────────────────

    fn handle_accept(
        &mut self,
        conn: std::io::Result<(TcpStream, SocketAddr)>,
        kind: ConnectionKind,
        defer_accepts_until: &mut Option<Instant>,
    ) {
        match conn {
            Ok((stream, peer)) => self.create_session(stream, peer, kind),
            Err(e) => {
                error!(error = %e, "couldn't accept connection");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    warn!(
                        "too many open files, deferring new connections for {}s",
                        ACCEPT_DEFER.as_secs()
                    );
                    *defer_accepts_until = Some(Instant::now() + ACCEPT_DEFER);
                }
            }
        }
    }

    fn create_session(&mut self, stream: TcpStream, peer: SocketAddr, kind: ConnectionKind) {
        self.session_id_counter += 1;
        let id = self.session_id_counter;
        let (read_half, write_half) = stream.into_split();

        let writer = {
            let events = self.events_tx.clone();
            Writer::spawn(write_half, move |error| {
                let _ = events.send(ServerEvent::ClientWriteFailed { id, error });
            })
        };
        spawn_client_reader(id, read_half, self.events_tx.clone());

        info!(
            client = id,
            peer = %peer,
            kind = if kind == ConnectionKind::Tcp { "TCP" } else { "HTTP" },
            active = self.sessions.len() + 1,
            "new connection"
        );
        self.sessions.insert(id, Session::new(id, kind, writer));
    }

    /// Half-close the client socket; removal follows when the peer's EOF is
    /// observed by the reader.
    pub(crate) fn shutdown_session(&mut self, sid: u32) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            info!(client = sid, "shutting down session");
            session.writer.shutdown();
            session.shutdown_sent = true;
        }
    }

    fn drain_removals(&mut self) {
        if self.clients_to_remove.is_empty() {
            return;
        }
        let ids: Vec<u32> = self.clients_to_remove.drain().collect();
        for sid in ids {
            self.remove_session(sid);
        }
    }

    fn remove_session(&mut self, sid: u32) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        info!(client = sid, active = self.sessions.len(), "removing client");

        // A half-open data set already queued at a core is force-terminated
        // with a blank line so the core is not left mid-record.
        if session.core_id != 0 {
            if let Some(core) = self.cores.get_mut(&session.core_id) {
                let name = core.name();
                if let Some(entry) = core.find_last_client_command(sid) {
                    if entry.accepts_data && !entry.data_finished {
                        warn!(core = %name, client = sid, "terminating open data set of connected core");
                        entry.force_finish_data();
                    }
                }
                core.flush_command_queue();
            }
        }
        // A pending command still accumulating never reached a core; drop it.
        session.pending_command.take();
        session.writer.shutdown();
    }

    // ─── Event handling ──────────────────────────────────────────────────────

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ClientLine { id, line } => {
                if self.clients_to_remove.contains(&id) || !self.sessions.contains_key(&id) {
                    return;
                }
                self.lines_from_clients += 1;
                let kind = {
                    let session = self.sessions.get_mut(&id).expect("checked above");
                    session.stats.lines_received += 1;
                    session.stats.bytes_received += line.len() as u64;
                    session.kind
                };
                match kind {
                    ConnectionKind::Http => self.line_from_http_client(id, line).await,
                    ConnectionKind::Tcp => self.line_from_client(id, line, false).await,
                }
            }
            ServerEvent::ClientClosed { id, error } => {
                let Some(session) = self.sessions.get(&id) else {
                    return;
                };
                match error {
                    None => info!(
                        client = id,
                        "connection closed{}",
                        if session.shutdown_sent { "" } else { " by peer" }
                    ),
                    Some(e) => warn!(
                        client = id,
                        write_buffer = session.writer.pending_bytes(),
                        error = %e,
                        "client i/o error"
                    ),
                }
                self.clients_to_remove.insert(id);
            }
            ServerEvent::ClientWriteFailed { id, error } => {
                warn!(client = id, error = %error, "write to client failed, disconnecting");
                self.clients_to_remove.insert(id);
            }
            ServerEvent::CoreLine { id, line } => self.handle_core_line(id, line).await,
            ServerEvent::CoreExited { id, status } => self.remove_core(id, status).await,
            ServerEvent::CoreWriteFailed { id, error } => {
                // Stdout will reach EOF and remove the core; nothing else to do.
                if let Some(core) = self.cores.get(&id) {
                    warn!(core = %core.name(), error = %error, "write to core failed");
                }
            }
        }
    }

    // ─── Client line serialization ───────────────────────────────────────────

    /// Handle one complete line from a client.  While a core reply is
    /// outstanding the line is parked; a command line with a trailing colon
    /// opens a pending command that swallows lines until its blank
    /// terminator; everything else becomes a command immediately.
    /// `from_queue` is set when replaying parked lines, so the first replayed
    /// line can actually run.
    async fn line_from_client(&mut self, sid: u32, mut line: String, from_queue: bool) {
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };

        if session.pending_command.is_some() {
            let accumulating = {
                let pending = session.pending_command.as_mut().expect("checked above");
                pending.accepts_data && !pending.data_finished
            };
            if accumulating {
                session.stats.data_records += 1;
                let pending = session.pending_command.as_mut().expect("checked above");
                pending.append_data(line);
                if pending.flushable() {
                    let entry = session.pending_command.take().expect("checked above");
                    self.process_command(sid, entry).await;
                }
            } else {
                // Shouldn't normally happen; keep the line for later.
                session.stats.lines_parked += 1;
                session.parked_lines.push_back(line);
            }
            return;
        }

        let parked_before = !session.parked_lines.is_empty();
        let must_park = !from_queue && (parked_before || self.is_waiting_for_core_reply(sid));
        if must_park {
            let session = self.sessions.get_mut(&sid).expect("looked up above");
            debug!(client = sid, line = %line.trim_end(), "parking line until core reply finishes");
            session.stats.lines_parked += 1;
            session.parked_lines.push_back(line);
            return;
        }

        let entry = CommandEntry::new(sid, line);
        if entry.flushable() {
            self.process_command(sid, entry).await;
        } else if let Some(session) = self.sessions.get_mut(&sid) {
            session.pending_command = Some(entry);
        }
    }

    /// Replay parked lines after the core this session was waiting on went
    /// idle (or away), stopping as soon as a replayed command starts waiting
    /// again.
    async fn drain_parked_lines(&mut self, sid: u32) {
        loop {
            if self.clients_to_remove.contains(&sid) || self.is_waiting_for_core_reply(sid) {
                return;
            }
            let Some(line) = self
                .sessions
                .get_mut(&sid)
                .and_then(|s| s.parked_lines.pop_front())
            else {
                return;
            };
            debug!(client = sid, line = %line.trim_end(), "executing parked line");
            self.line_from_client(sid, line, true).await;
        }
    }

    fn is_waiting_for_core_reply(&self, sid: u32) -> bool {
        let Some(session) = self.sessions.get(&sid) else {
            return false;
        };
        if session.core_id == 0 {
            return false;
        }
        self.cores
            .get(&session.core_id)
            .is_some_and(|core| core.last_client_id == sid && !core.is_idle())
    }

    // ─── Command routing ─────────────────────────────────────────────────────

    /// Route a fully received command: server commands run in-process, the
    /// rest goes to the bound core's queue after access control.
    pub(crate) async fn process_command(&mut self, sid: u32, entry: CommandEntry) {
        let words: Vec<String> = protocol::tokenize(&entry.command)
            .into_iter()
            .map(str::to_string)
            .collect();
        let Some(first) = words.first() else {
            return;
        };

        if let Some(spec) = commands::find_server_command(first) {
            let Some(session) = self.sessions.get_mut(&sid) else {
                return;
            };
            session.stats.server_commands += 1;
            if !entry.data.is_empty() {
                session.forward_statusline(&format!("{FAIL_STR} {first} accepts no data set.\n"));
            } else if entry.command.contains('>') || entry.command.contains('<') {
                session.forward_statusline(&format!(
                    "{FAIL_STR} input/output of server commands can't be redirected.\n"
                ));
            } else if spec.level > session.access_level {
                let have = session.access_level;
                session.forward_statusline(&format!(
                    "{} insufficient access level (command needs {}, you have {}).\n",
                    protocol::DENIED_STR,
                    spec.level,
                    have
                ));
            } else {
                commands::execute(self, sid, spec, &words, &entry).await;
            }
            return;
        }

        let (core_id, lost_core) = self
            .sessions
            .get(&sid)
            .map_or((0, false), |s| (s.core_id, s.lost_core));
        if core_id != 0 {
            self.forward_to_core(sid, entry);
        } else if lost_core {
            // The bound core went away since the last command; one
            // synthesized error, then back to normal routing.
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.lost_core = false;
                session.forward_statusline(&format!(
                    "{ERROR_STR} connected graph instance has gone away.\n"
                ));
            }
        } else if let Some(session) = self.sessions.get_mut(&sid) {
            session.command_not_found(&format!("no such server command '{first}'."));
        }
    }

    /// Access-check a core command and put it on the bound core's FIFO.
    pub(crate) fn forward_to_core(&mut self, sid: u32, entry: CommandEntry) {
        let Some(first) = protocol::command_words(&entry.command)
            .first()
            .map(|w| w.to_string())
        else {
            return;
        };
        let core_id = self.sessions.get(&sid).map_or(0, |s| s.core_id);
        let Some(core) = self.cores.get_mut(&core_id) else {
            if let Some(session) = self.sessions.get_mut(&sid) {
                info!(client = sid, core_id, "client bound to vanished core, unbinding");
                session.forward_statusline(&format!(
                    "{ERROR_STR} graph instance with ID {core_id} has gone away.\n"
                ));
                session.core_id = 0;
            }
            return;
        };

        let Some(base_level) = commands::core_command_level(&first) else {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.command_not_found(&format!("no such core command '{first}'."));
            }
            return;
        };
        let required = commands::required_core_level(&entry.command, base_level);
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        if session.access_level >= required {
            session.stats.core_commands += 1;
            core.queue_command(entry);
            core.flush_command_queue();
        } else {
            session.forward_statusline(&format!(
                "{} insufficient access level (command needs {}, you have {}).\n",
                protocol::DENIED_STR,
                required,
                session.access_level
            ));
        }
    }

    // ─── Core replies ────────────────────────────────────────────────────────

    /// Advance the reply state machine for one line of core stdout and
    /// forward it to the session recorded at dispatch time.
    async fn handle_core_line(&mut self, cid: u32, line: String) {
        let Some(core) = self.cores.get_mut(&cid) else {
            return;
        };
        let last_sid = core.last_client_id;
        let client_was_waiting = !core.is_idle() && self.sessions.contains_key(&last_sid);

        if core.expecting_reply {
            core.expecting_reply = false;
            if protocol::line_indicates_dataset(&line) {
                core.expecting_dataset = true;
            }
            match self.sessions.get_mut(&last_sid) {
                Some(session) => session.forward_statusline(&line),
                None => debug!(core = cid, client = last_sid, "discarding status line for removed client"),
            }
        } else if core.expecting_dataset {
            if protocol::is_blank(&line) {
                core.expecting_dataset = false;
            }
            if let Some(session) = self.sessions.get_mut(&last_sid) {
                session.forward_dataset(&line);
            }
        } else {
            warn!(core = %core.name(), line = %line.trim_end(), "unexpected line from idle core, discarding");
            return;
        }

        let core = self.cores.get_mut(&cid).expect("still present");
        if core.is_idle() {
            core.flush_command_queue();
            // The waiting client's parked lines can run now.
            if client_was_waiting {
                self.drain_parked_lines(last_sid).await;
            }
        }
    }

    /// Destroy an exited core: unbind its sessions (they get one synthesized
    /// error on their next core-bound command) and let their parked lines
    /// run against the new state.
    async fn remove_core(&mut self, cid: u32, status: Option<ExitStatus>) {
        let Some(core) = self.cores.remove(&cid) else {
            return;
        };
        info!(
            core = %core.name(),
            id = cid,
            pid = core.pid(),
            exit_code = status.and_then(|s| s.code()),
            stdin_buffered = core.stdin_pending_bytes(),
            "core has exited"
        );

        let bound: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| s.core_id == cid)
            .map(|s| s.id)
            .collect();
        for sid in bound {
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.core_id = 0;
                session.lost_core = true;
            }
            self.drain_parked_lines(sid).await;
        }
    }

    // ─── HTTP ────────────────────────────────────────────────────────────────

    /// Accumulate header lines; the blank line ends the request and runs its
    /// one command.
    async fn line_from_http_client(&mut self, sid: u32, line: String) {
        let request_line = {
            let Some(session) = self.sessions.get_mut(&sid) else {
                return;
            };
            let end_of_request = line == "\n";
            session.http.request_lines.push(line);
            if !end_of_request {
                return;
            }
            let first = session.http.request_lines.first().cloned().unwrap_or_default();
            // The rest of the header is not used.
            session.http.request_lines.clear();
            session.http.request_line = first.clone();
            first
        };

        let uri = match http::parse_request_line(&request_line) {
            Ok((_method, uri)) => uri,
            Err(RequestError::BadRequestLine) => {
                error!(client = sid, line = %request_line.trim_end(), "bad HTTP request string");
                return self.fail_session(sid, "bad HTTP request string.");
            }
            Err(RequestError::UnknownVersion) => {
                error!(client = sid, "unknown HTTP version");
                return self.fail_session(sid, "unknown HTTP version.");
            }
        };

        let decoded = match http::percent_decode(&uri) {
            Ok(d) => d,
            Err(_) => {
                error!(client = sid, uri = %uri, "bad hex in request URI");
                return self.fail_session(sid, "bad hex in request URI.");
            }
        };

        match http::split_uri(&decoded) {
            UriTarget::CoreCommand { core, command } => {
                if protocol::line_indicates_dataset(&command) {
                    return self.fail_session(sid, "data sets not allowed in HTTP GET requests.");
                }
                let Some(core_id) = self.find_named_core(&core).map(|c| c.id()) else {
                    return self.fail_session(sid, "no such graph instance.");
                };
                // Bind to the named core, then run the command as if the
                // client had typed it.
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.core_id = core_id;
                    session.lost_core = false;
                }
                self.line_from_client(sid, command, false).await;
            }
            UriTarget::ServerCommand(command) => {
                if protocol::line_indicates_dataset(&command) {
                    return self.fail_session(sid, "data sets not allowed in HTTP GET requests.");
                }
                self.line_from_client(sid, command, false).await;
            }
            UriTarget::Empty => {
                let running = self.running_core_count();
                let active = self.sessions.len();
                let port = self.config.http_port;
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.forward_statusline(&format!(
                        "{SUCCESS_STR} this is the graphserv HTTP module listening on port {port}. \
                         protocol-version is {PROTOCOL_VERSION}. {running} graph instance(s) running, \
                         {active} client connection(s) active including yours.\n"
                    ));
                }
            }
        }
    }

    /// Finished HTTP conversations are half-closed once nothing more is
    /// buffered or owed by a core; destruction follows on the peer's EOF.
    fn sweep_http_sessions(&mut self) {
        let cores = &self.cores;
        for session in self.sessions.values_mut() {
            if !session.is_http() || session.shutdown_sent || !session.http.conversation_finished {
                continue;
            }
            let core_busy = session.core_id != 0
                && cores
                    .get(&session.core_id)
                    .is_some_and(|c| c.has_data_for_client(session.id));
            if !core_busy {
                debug!(client = session.id, "HTTP conversation finished, closing");
                session.writer.shutdown();
                session.shutdown_sent = true;
            }
        }
    }

    fn fail_session(&mut self, sid: u32, text: &str) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            session.forward_statusline(&format!("{FAIL_STR} {text}\n"));
        }
    }

    // ─── Housekeeping and lookups ────────────────────────────────────────────

    fn housekeeping(&mut self) {
        let now = Instant::now();
        for session in self.sessions.values_mut() {
            session.roll_stats_window(now);
        }
        // Catch any queue made flushable outside the usual wakeup points.
        for core in self.cores.values_mut() {
            core.flush_command_queue();
        }
    }

    pub(crate) fn next_core_id(&mut self) -> u32 {
        self.core_id_counter += 1;
        self.core_id_counter
    }

    pub(crate) fn find_named_core(&self, name: &str) -> Option<&CoreInstance> {
        self.cores
            .values()
            .find(|c| c.running && c.name() == name)
    }

    pub(crate) fn running_core_count(&self) -> usize {
        self.cores.values().filter(|c| c.running).count()
    }

    pub(crate) fn events_sender(&self) -> UnboundedSender<ServerEvent> {
        self.events_tx.clone()
    }

    pub(crate) fn forward_statusline_to(&mut self, sid: u32, line: &str) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            session.forward_statusline(line);
        }
    }

    pub(crate) fn forward_dataset_to(&mut self, sid: u32, line: &str) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            session.forward_dataset(line);
        }
    }
}

fn open_listen_socket(port: u16) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

async fn accept_on(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

fn accepts_allowed(defer_until: Option<Instant>) -> bool {
    defer_until.map_or(true, |t| Instant::now() >= t)
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Plumbing: read client bytes, emit complete lines as events.
fn spawn_client_reader(id: u32, mut read_half: OwnedReadHalf, events: UnboundedSender<ServerEvent>) {
    tokio::spawn(async move {
        let mut linebuf = LineBuffer::new();
        let mut buf = [0u8; 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = events.send(ServerEvent::ClientClosed { id, error: None });
                    return;
                }
                Ok(n) => {
                    for line in linebuf.feed(&buf[..n]) {
                        if events.send(ServerEvent::ClientLine { id, line }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(ServerEvent::ClientClosed { id, error: Some(e) });
                    return;
                }
            }
        }
    });
}
