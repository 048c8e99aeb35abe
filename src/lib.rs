pub mod auth;
pub mod commands;
pub mod config;
pub mod core;
pub mod http;
pub mod linebuf;
pub mod protocol;
pub mod server;
pub mod session;
pub mod writer;

pub use config::ServerConfig;
pub use server::Server;

/// Map the `-l` log-flag characters onto a tracing filter directive.
///
/// `q` silences everything but errors, `e` enables warnings, `i` enables
/// informational logging (including core stderr), `a` additionally turns on
/// authorization tracing.
pub fn log_filter_from_flags(flags: &str) -> String {
    let base = if flags.contains('q') {
        "error"
    } else if flags.contains('i') {
        "info"
    } else if flags.contains('e') {
        "warn"
    } else {
        "error"
    };
    let mut filter = base.to_string();
    if flags.contains('a') && !flags.contains('q') {
        filter.push_str(",graphserv::auth=debug");
    }
    filter
}
