//! End-to-end tests over real sockets.
//!
//! Each test spins up a server on free ports with generated credential files
//! and a scripted shell mock standing in for the graph engine.  Clients
//! drive the wire protocol over plain `TcpStream`s.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use graphserv::{Server, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const MOCK_CORE: &str = r#"#!/bin/sh
while IFS= read -r line; do
  set -- $line
  case "$1" in
    protocol-version)
      echo "OK 1.0" ;;
    add-arcs:)
      n=0
      while IFS= read -r rec; do
        [ -z "$rec" ] && break
        n=$((n+1))
      done
      echo "OK added $n arcs." ;;
    list-roots)
      printf 'OK roots:\n4\n11\n\n' ;;
    stats)
      echo "VALUE 7" ;;
    help)
      printf 'OK core commands:\nadd-arcs\nlist-roots\n\n' ;;
    shutdown)
      echo "OK shutting down."
      exit 0 ;;
    *)
      echo "FAILURE unknown command." ;;
  esac
done
"#;

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    _dir: TempDir,
    tcp: SocketAddr,
    http: SocketAddr,
}

/// Write credentials (admin:secret, writer:w0rd) and the mock core, then
/// start the server on free ports.
async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();

    let admin_hash = pwhash::unix_crypt::hash_with("ab", "secret").unwrap();
    let writer_hash = pwhash::unix_crypt::hash_with("cd", "w0rd").unwrap();
    std::fs::write(
        dir.path().join("gspasswd.conf"),
        format!("admin:{admin_hash}\nwriter:{writer_hash}\n"),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("gsgroups.conf"),
        "write:::writer,admin\nadmin:::admin\n",
    )
    .unwrap();

    let core_path = dir.path().join("mockcore");
    std::fs::write(&core_path, MOCK_CORE).unwrap();
    std::fs::set_permissions(&core_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let tcp_port = find_free_port();
    let http_port = find_free_port();
    let mut server = Server::new(ServerConfig {
        tcp_port,
        http_port,
        htpasswd_file: dir.path().join("gspasswd.conf"),
        group_file: dir.path().join("gsgroups.conf"),
        core_path,
    })
    .unwrap();
    server.bind().unwrap();
    let tcp = server.tcp_addr().unwrap();
    let http = server.http_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer { _dir: dir, tcp, http }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
    }

    /// Read one reply line; empty string on EOF.
    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        line
    }

    /// Read data-set lines up to and including the blank terminator.
    async fn read_dataset(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line == "\n" || line.is_empty();
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Authorize and bind a fresh admin session to a new graph.
    async fn admin_with_graph(addr: SocketAddr, graph: &str) -> Self {
        let mut c = Client::connect(addr).await;
        c.send("authorize password admin:secret\n").await;
        assert_eq!(c.read_line().await, "OK access level: admin\n");
        c.send(&format!("create-graph {graph}\n")).await;
        assert!(c.read_line().await.starts_with("OK spawned pid "));
        c.send(&format!("use-graph {graph}\n")).await;
        assert!(c.read_line().await.starts_with("OK connected to pid "));
        c
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.0\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("timed out waiting for HTTP response")
        .unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn authorize_create_and_use_graph() {
    let srv = start_server().await;
    let mut c = Client::connect(srv.tcp).await;

    c.send("authorize password admin:secret\n").await;
    assert_eq!(c.read_line().await, "OK access level: admin\n");

    c.send("create-graph g1\n").await;
    assert!(c.read_line().await.starts_with("OK spawned pid "));

    c.send("use-graph g1\n").await;
    assert!(c.read_line().await.starts_with("OK connected to pid "));

    c.send("list-roots\n").await;
    assert_eq!(c.read_line().await, "OK roots:\n");
    assert_eq!(c.read_dataset().await, vec!["4\n", "11\n", "\n"]);
}

#[tokio::test]
async fn bad_credentials_are_rejected_uniformly() {
    let srv = start_server().await;
    let mut c = Client::connect(srv.tcp).await;

    c.send("authorize password admin:wrong\n").await;
    assert_eq!(c.read_line().await, "FAILURE authorization failure.\n");
    c.send("authorize password nobody:secret\n").await;
    assert_eq!(c.read_line().await, "FAILURE authorization failure.\n");

    // The session stays at read level.
    c.send("session-info\n").await;
    assert_eq!(c.read_line().await, "OK session info:\n");
    let info = c.read_dataset().await;
    assert!(info.contains(&"AccessLevel,read\n".to_string()));
}

#[tokio::test]
async fn write_command_denied_at_read_level() {
    let srv = start_server().await;
    let _admin = Client::admin_with_graph(srv.tcp, "g1").await;

    let mut c = Client::connect(srv.tcp).await;
    c.send("use-graph g1\n").await;
    assert!(c.read_line().await.starts_with("OK connected to pid "));

    c.send("add-arcs:\n1,2\n\n").await;
    let reply = c.read_line().await;
    assert!(reply.starts_with("DENIED "), "got: {reply}");

    // Exactly one DENIED line: the next reply belongs to the next command.
    c.send("session-info\n").await;
    assert_eq!(c.read_line().await, "OK session info:\n");
}

#[tokio::test]
async fn server_commands_are_access_checked() {
    let srv = start_server().await;
    let mut c = Client::connect(srv.tcp).await;
    c.send("create-graph g1\n").await;
    let reply = c.read_line().await;
    assert!(reply.starts_with("DENIED "), "got: {reply}");
}

#[tokio::test]
async fn data_set_round_trip() {
    let srv = start_server().await;
    let mut c = Client::connect(srv.tcp).await;

    c.send("authorize password writer:w0rd\n").await;
    assert_eq!(c.read_line().await, "OK access level: write\n");

    // Write access is not enough to create graphs.
    c.send("create-graph g1\n").await;
    assert!(c.read_line().await.starts_with("DENIED "));

    let _admin = Client::admin_with_graph(srv.tcp, "g2").await;
    c.send("use-graph g2\n").await;
    assert!(c.read_line().await.starts_with("OK connected to pid "));

    c.send("add-arcs:\n1,2\n2,3\n3,4\n\n").await;
    assert_eq!(c.read_line().await, "OK added 3 arcs.\n");
}

#[tokio::test]
async fn back_to_back_commands_are_serialized() {
    let srv = start_server().await;
    let mut c = Client::admin_with_graph(srv.tcp, "g1").await;

    // Both commands land before the first reply; the second is parked and
    // replayed, so two complete data sets come back in order.
    c.send("list-roots\nlist-roots\n").await;
    for _ in 0..2 {
        assert_eq!(c.read_line().await, "OK roots:\n");
        assert_eq!(c.read_dataset().await, vec!["4\n", "11\n", "\n"]);
    }
}

#[tokio::test]
async fn unknown_core_command_is_rejected_before_the_core() {
    let srv = start_server().await;
    let mut c = Client::admin_with_graph(srv.tcp, "g1").await;

    c.send("frobnicate\n").await;
    assert_eq!(c.read_line().await, "FAILURE no such core command 'frobnicate'.\n");
}

#[tokio::test]
async fn quit_closes_the_connection() {
    let srv = start_server().await;
    let mut c = Client::connect(srv.tcp).await;
    c.send("quit\n").await;
    assert_eq!(c.read_line().await, "OK goodbye.\n");
    assert_eq!(c.read_line().await, "", "expected EOF after quit");
}

#[tokio::test]
async fn server_stats_and_protocol_version() {
    let srv = start_server().await;
    let mut c = Client::connect(srv.tcp).await;

    c.send("protocol-version\n").await;
    assert_eq!(c.read_line().await, "OK 1.0\n");

    c.send("server-stats\n").await;
    assert_eq!(c.read_line().await, "OK server statistics:\n");
    let stats = c.read_dataset().await;
    assert!(stats.iter().any(|l| l.starts_with("RunningCores,")));
    assert!(stats.iter().any(|l| l.starts_with("LinesReceived,")));
}

#[tokio::test]
async fn core_shutdown_reply_is_forwarded() {
    let srv = start_server().await;
    let mut c = Client::admin_with_graph(srv.tcp, "g1").await;

    c.send("shutdown\n").await;
    assert_eq!(c.read_line().await, "OK shutting down.\n");

    // Once the exit is reaped, list-graphs no longer shows g1.
    tokio::time::sleep(Duration::from_millis(300)).await;
    c.send("list-graphs\n").await;
    assert_eq!(c.read_line().await, "OK running graph instances:\n");
    assert_eq!(c.read_dataset().await, vec!["\n"]);
}

#[tokio::test]
async fn crashed_core_yields_one_synthesized_error() {
    let srv = start_server().await;
    let mut admin = Client::admin_with_graph(srv.tcp, "g1").await;

    admin.send("drop-graph g1\n").await;
    assert!(admin.read_line().await.starts_with("OK terminating pid "));
    tokio::time::sleep(Duration::from_millis(300)).await;

    admin.send("stats\n").await;
    assert_eq!(
        admin.read_line().await,
        "ERROR connected graph instance has gone away.\n"
    );
    // The marker is one-shot: afterwards the session routes normally again.
    admin.send("stats\n").await;
    assert_eq!(
        admin.read_line().await,
        "FAILURE no such server command 'stats'.\n"
    );
}

#[tokio::test]
async fn http_core_command_maps_status_and_streams_dataset() {
    let srv = start_server().await;
    let _admin = Client::admin_with_graph(srv.tcp, "g1").await;

    let response = http_get(srv.http, "/g1/list-roots").await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "got: {response}");
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.contains("X-GraphProcessor: OK roots:\r\n"));
    assert!(response.ends_with("OK roots:\n4\n11\n\n"));
}

#[tokio::test]
async fn http_value_status_maps_to_222() {
    let srv = start_server().await;
    let _admin = Client::admin_with_graph(srv.tcp, "g1").await;

    let response = http_get(srv.http, "/g1/stats").await;
    assert!(response.starts_with("HTTP/1.0 222 Value Follows\r\n"), "got: {response}");
    assert!(response.contains("X-GraphProcessor: VALUE 7\r\n"));
}

#[tokio::test]
async fn http_unknown_command_is_501() {
    let srv = start_server().await;
    let _admin = Client::admin_with_graph(srv.tcp, "g1").await;

    let response = http_get(srv.http, "/g1/frobnicate").await;
    assert!(response.starts_with("HTTP/1.0 501 Not Implemented\r\n"), "got: {response}");
}

#[tokio::test]
async fn http_unknown_graph_is_400() {
    let srv = start_server().await;
    let response = http_get(srv.http, "/nope/list-roots").await;
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "got: {response}");
    assert!(response.contains("FAILURE no such graph instance.\n"));
}

#[tokio::test]
async fn http_bare_server_command() {
    let srv = start_server().await;
    let response = http_get(srv.http, "/protocol-version").await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "got: {response}");
    assert!(response.ends_with("OK 1.0\n"));
}

#[tokio::test]
async fn http_percent_decoding_applies_to_the_command() {
    let srv = start_server().await;
    let _admin = Client::admin_with_graph(srv.tcp, "g1").await;

    // "list+roots" decodes to "list roots", which is not a core command;
    // "list-roots" percent-encoded works.
    let response = http_get(srv.http, "/g1/list%2Droots").await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "got: {response}");
}

#[tokio::test]
async fn help_on_bound_session_adds_the_cores_help() {
    let srv = start_server().await;
    let mut c = Client::admin_with_graph(srv.tcp, "g1").await;

    c.send("help\n").await;
    assert_eq!(c.read_line().await, "OK server commands:\n");
    let server_help = c.read_dataset().await;
    assert!(server_help.iter().any(|l| l.contains("create-graph GRAPHNAME")));

    // Bound sessions get the engine's help as a second data set.
    assert_eq!(c.read_line().await, "OK core commands:\n");
    assert_eq!(c.read_dataset().await, vec!["add-arcs\n", "list-roots\n", "\n"]);
}

#[tokio::test]
async fn session_info_reports_the_bound_graph() {
    let srv = start_server().await;
    let mut c = Client::admin_with_graph(srv.tcp, "g1").await;

    c.send("session-info\n").await;
    assert_eq!(c.read_line().await, "OK session info:\n");
    let info = c.read_dataset().await;
    assert!(info.contains(&"ConnectedGraph,g1\n".to_string()));
    assert!(info.contains(&"AccessLevel,admin\n".to_string()));
}

#[tokio::test]
async fn http_empty_request_gets_banner() {
    let srv = start_server().await;
    let response = http_get(srv.http, "/").await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "got: {response}");
    assert!(response.contains("this is the graphserv HTTP module"));
}
