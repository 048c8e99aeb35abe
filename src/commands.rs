// SPDX-License-Identifier: MIT
//! Built-in server commands and the core-command access table.
//!
//! Server commands are handled in-process and never touch a core (with the
//! two deliberate exceptions of `shutdown` and `help`, which forward a line
//! to the bound core).  Anything else on a bound session is looked up in the
//! core-command table for access control and queued on the core.

use tracing::{info, warn};

use crate::core::{CommandEntry, CoreInstance};
use crate::protocol::{
    is_valid_graph_name, AccessLevel, FAIL_STR, PROTOCOL_VERSION, SUCCESS_STR,
};
use crate::server::Server;

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct ServerCommandSpec {
    pub name: &'static str,
    pub synopsis: &'static str,
    pub help: &'static str,
    pub level: AccessLevel,
}

pub const SERVER_COMMANDS: &[ServerCommandSpec] = &[
    ServerCommandSpec {
        name: "create-graph",
        synopsis: "create-graph GRAPHNAME",
        help: "create and start a named graph instance.",
        level: AccessLevel::Admin,
    },
    ServerCommandSpec {
        name: "use-graph",
        synopsis: "use-graph GRAPHNAME",
        help: "connect this session to a running graph instance.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "drop-graph",
        synopsis: "drop-graph GRAPHNAME",
        help: "terminate a running graph instance.",
        level: AccessLevel::Admin,
    },
    ServerCommandSpec {
        name: "list-graphs",
        synopsis: "list-graphs",
        help: "list the names of all running graph instances.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "session-info",
        synopsis: "session-info",
        help: "show the connected graph and access level of this session.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "server-stats",
        synopsis: "server-stats",
        help: "show running instance count and lines received.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "authorize",
        synopsis: "authorize AUTHORITY CREDENTIALS",
        help: "raise this session's access level through the named authority.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "protocol-version",
        synopsis: "protocol-version",
        help: "print the protocol version of this server.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "help",
        synopsis: "help [COMMAND]",
        help: "list server commands, or show help for one command.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "quit",
        synopsis: "quit",
        help: "close this connection.",
        level: AccessLevel::Read,
    },
    ServerCommandSpec {
        name: "shutdown",
        synopsis: "shutdown",
        help: "ask the connected graph instance to exit cleanly.",
        level: AccessLevel::Admin,
    },
];

pub fn find_server_command(name: &str) -> Option<&'static ServerCommandSpec> {
    SERVER_COMMANDS.iter().find(|c| c.name == name)
}

/// Commands understood by the graph engine, with the minimum access level
/// needed to run them. This table is the single place to extend when the
/// engine grows commands.
const CORE_COMMANDS: &[(&str, AccessLevel)] = &[
    ("help", AccessLevel::Read),
    ("stats", AccessLevel::Read),
    ("list-roots", AccessLevel::Read),
    ("list-leaves", AccessLevel::Read),
    ("list-successors", AccessLevel::Read),
    ("list-predecessors", AccessLevel::Read),
    ("list-neighbors", AccessLevel::Read),
    ("count-successors", AccessLevel::Read),
    ("count-predecessors", AccessLevel::Read),
    ("traverse-successors", AccessLevel::Read),
    ("traverse-predecessors", AccessLevel::Read),
    ("traverse-neighbors", AccessLevel::Read),
    ("find-path", AccessLevel::Read),
    ("find-root", AccessLevel::Read),
    ("get-meta", AccessLevel::Read),
    ("list-meta", AccessLevel::Read),
    ("dump-graph", AccessLevel::Read),
    ("add-arcs", AccessLevel::Write),
    ("remove-arcs", AccessLevel::Write),
    ("replace-successors", AccessLevel::Write),
    ("replace-predecessors", AccessLevel::Write),
    ("set-meta", AccessLevel::Write),
    ("remove-meta", AccessLevel::Write),
    ("clear", AccessLevel::Admin),
];

pub fn core_command_level(name: &str) -> Option<AccessLevel> {
    CORE_COMMANDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, level)| *level)
}

/// The level a core command line actually needs: i/o redirection anywhere in
/// the line raises the requirement to admin.
pub fn required_core_level(command_line: &str, base: AccessLevel) -> AccessLevel {
    if command_line.contains('>') || command_line.contains('<') {
        AccessLevel::Admin
    } else {
        base
    }
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Run one server command. Arity errors answer with the command's synopsis;
/// everything else replies through the session's forward hooks so TCP and
/// HTTP clients see the same conversation.
pub async fn execute(
    server: &mut Server,
    sid: u32,
    spec: &'static ServerCommandSpec,
    words: &[String],
    entry: &CommandEntry,
) {
    match spec.name {
        "create-graph" => create_graph(server, sid, words).await,
        "use-graph" => use_graph(server, sid, words),
        "drop-graph" => drop_graph(server, sid, words),
        "list-graphs" => list_graphs(server, sid),
        "session-info" => session_info(server, sid),
        "server-stats" => server_stats(server, sid),
        "authorize" => authorize(server, sid, words),
        "protocol-version" => {
            server.forward_statusline_to(sid, &format!("{SUCCESS_STR} {PROTOCOL_VERSION}\n"));
        }
        "help" => help(server, sid, words, entry),
        "quit" => {
            server.forward_statusline_to(sid, &format!("{SUCCESS_STR} goodbye.\n"));
            server.shutdown_session(sid);
        }
        "shutdown" => shutdown_core(server, sid),
        other => {
            // The registry and this dispatcher must stay in sync.
            warn!(command = other, "server command registered but not dispatched");
        }
    }
}

fn syntax_error(server: &mut Server, sid: u32, spec: &ServerCommandSpec) {
    server.forward_statusline_to(sid, &format!("{FAIL_STR} syntax: {}\n", spec.synopsis));
}

fn fail(server: &mut Server, sid: u32, text: &str) {
    server.forward_statusline_to(sid, &format!("{FAIL_STR} {text}\n"));
}

fn success(server: &mut Server, sid: u32, text: &str) {
    server.forward_statusline_to(sid, &format!("{SUCCESS_STR} {text}\n"));
}

async fn create_graph(server: &mut Server, sid: u32, words: &[String]) {
    let [_, name] = words else {
        return syntax_error(server, sid, find_server_command("create-graph").unwrap());
    };
    if !is_valid_graph_name(name) {
        return fail(server, sid, &format!("invalid graph name '{name}'."));
    }
    if server.find_named_core(name).is_some() {
        return fail(
            server,
            sid,
            &format!("a graph instance named '{name}' is already running."),
        );
    }
    let id = server.next_core_id();
    match CoreInstance::start(id, name.clone(), &server.config.core_path, server.events_sender())
        .await
    {
        Ok(core) => {
            let pid = core.pid();
            info!(core = %name, id, pid, "graph instance started");
            server.cores.insert(id, core);
            success(server, sid, &format!("spawned pid {pid}."));
        }
        Err(e) => {
            warn!(core = %name, error = %e, "couldn't start graph instance");
            fail(server, sid, &format!("couldn't start graph instance: {e}"));
        }
    }
}

fn use_graph(server: &mut Server, sid: u32, words: &[String]) {
    let [_, name] = words else {
        return syntax_error(server, sid, find_server_command("use-graph").unwrap());
    };
    let Some(core) = server.find_named_core(name) else {
        return fail(server, sid, &format!("no such graph instance '{name}'."));
    };
    let (core_id, pid) = (core.id(), core.pid());

    // Rebinding while the old core still has output queued for this client is
    // allowed but can confuse client code; call it out in the log.
    let old_core_id = server.sessions.get(&sid).map_or(0, |s| s.core_id);
    if old_core_id != 0 && old_core_id != core_id {
        if let Some(old) = server.cores.get(&old_core_id) {
            if old.has_data_for_client(sid) {
                warn!(
                    client = sid,
                    old_core = %old.name(),
                    "old graph instance still has data for this client; \
                     clients should wait for replies before switching instances"
                );
            }
        }
    }

    if let Some(session) = server.sessions.get_mut(&sid) {
        session.core_id = core_id;
        session.lost_core = false;
    }
    success(server, sid, &format!("connected to pid {pid}."));
}

fn drop_graph(server: &mut Server, sid: u32, words: &[String]) {
    let [_, name] = words else {
        return syntax_error(server, sid, find_server_command("drop-graph").unwrap());
    };
    let Some(core_id) = server.find_named_core(name).map(|c| c.id()) else {
        return fail(server, sid, &format!("no such graph instance '{name}'."));
    };
    let core = server.cores.get_mut(&core_id).expect("core id just looked up");
    let pid = core.pid();
    core.terminate();
    info!(core = %name, pid, "graph instance terminated");
    success(server, sid, &format!("terminating pid {pid}."));
}

fn list_graphs(server: &mut Server, sid: u32) {
    let names: Vec<String> = server
        .cores
        .values()
        .filter(|c| c.running)
        .map(|c| c.name())
        .collect();
    server.forward_statusline_to(sid, &format!("{SUCCESS_STR} running graph instances:\n"));
    for name in names {
        server.forward_dataset_to(sid, &format!("{name}\n"));
    }
    server.forward_dataset_to(sid, "\n");
}

fn session_info(server: &mut Server, sid: u32) {
    let Some(session) = server.sessions.get(&sid) else {
        return;
    };
    let graph = server
        .cores
        .get(&session.core_id)
        .map_or_else(|| "None".to_string(), |c| c.name());
    let level = session.access_level;
    server.forward_statusline_to(sid, &format!("{SUCCESS_STR} session info:\n"));
    server.forward_dataset_to(sid, &format!("ConnectedGraph,{graph}\n"));
    server.forward_dataset_to(sid, &format!("AccessLevel,{level}\n"));
    server.forward_dataset_to(sid, "\n");
}

fn server_stats(server: &mut Server, sid: u32) {
    let running = server.running_core_count();
    let lines = server.lines_from_clients;
    server.forward_statusline_to(sid, &format!("{SUCCESS_STR} server statistics:\n"));
    server.forward_dataset_to(sid, &format!("RunningCores,{running}\n"));
    server.forward_dataset_to(sid, &format!("LinesReceived,{lines}\n"));
    server.forward_dataset_to(sid, "\n");
}

fn authorize(server: &mut Server, sid: u32, words: &[String]) {
    let [_, authority, credentials] = words else {
        return syntax_error(server, sid, find_server_command("authorize").unwrap());
    };
    let Some(auth) = server.authorities.get_mut(authority.as_str()) else {
        return fail(server, sid, &format!("no such authority '{authority}'."));
    };
    match auth.authorize(credentials) {
        Ok(level) => {
            if let Some(session) = server.sessions.get_mut(&sid) {
                session.access_level = level;
            }
            success(server, sid, &format!("access level: {level}"));
        }
        // Deliberately uniform: clients learn nothing about which part of the
        // credentials was wrong.
        Err(_) => fail(server, sid, "authorization failure."),
    }
}

fn help(server: &mut Server, sid: u32, words: &[String], entry: &CommandEntry) {
    match words {
        [_] => {
            server.forward_statusline_to(sid, &format!("{SUCCESS_STR} server commands:\n"));
            for spec in SERVER_COMMANDS {
                server.forward_dataset_to(
                    sid,
                    &format!("{} ({}): {}\n", spec.synopsis, spec.level, spec.help),
                );
            }
            server.forward_dataset_to(sid, "\n");
            // A bound session also gets the engine's own help, as a second
            // data set, so clients see the full command surface.
            if server.sessions.get(&sid).map_or(0, |s| s.core_id) != 0 {
                let forwarded = CommandEntry::new(sid, entry.command.clone());
                server.forward_to_core(sid, forwarded);
            }
        }
        [_, topic] => {
            if let Some(spec) = find_server_command(topic) {
                server.forward_statusline_to(sid, &format!("{SUCCESS_STR} help for '{topic}':\n"));
                server.forward_dataset_to(sid, &format!("{}\n", spec.synopsis));
                server.forward_dataset_to(sid, &format!("{}\n", spec.help));
                server.forward_dataset_to(sid, "\n");
            } else if server.sessions.get(&sid).map_or(0, |s| s.core_id) != 0 {
                let forwarded = CommandEntry::new(sid, entry.command.clone());
                server.forward_to_core(sid, forwarded);
            } else if let Some(session) = server.sessions.get_mut(&sid) {
                session.command_not_found(&format!("no such server command '{topic}'."));
            }
        }
        _ => syntax_error(server, sid, find_server_command("help").unwrap()),
    }
}

/// Forward a literal `shutdown` to the bound core and stop treating the core
/// as running. The core's reply still arrives and is forwarded; the child is
/// reaped once its stdout closes.
fn shutdown_core(server: &mut Server, sid: u32) {
    let core_id = server.sessions.get(&sid).map_or(0, |s| s.core_id);
    let Some(core) = server.cores.get_mut(&core_id) else {
        return fail(server, sid, "not connected to a graph instance.");
    };
    info!(core = %core.name(), "shutdown requested");
    core.queue_command(CommandEntry::new(sid, "shutdown\n".to_string()));
    core.running = false;
    core.flush_command_queue();
}
