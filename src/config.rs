use std::path::PathBuf;

/// Runtime configuration, filled in from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen port; 0 disables the line-protocol listener.
    pub tcp_port: u16,
    /// HTTP listen port; 0 disables the HTTP listener.
    pub http_port: u16,
    pub htpasswd_file: PathBuf,
    pub group_file: PathBuf,
    /// Path to the graph-engine binary spawned for each `create-graph`.
    pub core_path: PathBuf,
}

impl ServerConfig {
    pub fn tcp_port_enabled(&self) -> bool {
        self.tcp_port != 0
    }

    pub fn http_port_enabled(&self) -> bool {
        self.http_port != 0
    }
}
