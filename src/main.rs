use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use graphserv::{log_filter_from_flags, Server, ServerConfig};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "graphserv",
    about = "Multiplexing front-end for line-oriented graph-processing cores",
    version
)]
struct Args {
    /// TCP listen port (0 disables)
    #[arg(short = 't', long = "tcp-port", default_value_t = 6666)]
    tcp_port: u16,

    /// HTTP listen port (0 disables)
    #[arg(short = 'H', long = "http-port", default_value_t = 8090)]
    http_port: u16,

    /// htpasswd file (user:hash, crypt(3) DES hashes)
    #[arg(short = 'p', long = "htpasswd", default_value = "gspasswd.conf")]
    htpasswd: PathBuf,

    /// group file (level:::user1,user2,...)
    #[arg(short = 'g', long = "groups", default_value = "gsgroups.conf")]
    groups: PathBuf,

    /// graph-engine binary spawned per create-graph
    #[arg(short = 'c', long = "core-binary", default_value = "./graphcore/graphcore")]
    core_binary: PathBuf,

    /// log flags: any of e (warnings), i (info), a (auth), q (quiet)
    #[arg(short = 'l', long = "log", default_value = "ei", env = "GRAPHSERV_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter_from_flags(&args.log))
        .compact()
        .init();

    if args.tcp_port == 0 && args.http_port == 0 {
        bail!("at least one of the TCP and HTTP ports must be enabled");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tcp_port = args.tcp_port,
        http_port = args.http_port,
        core_binary = %args.core_binary.display(),
        "graphserv starting"
    );

    let mut server = Server::new(ServerConfig {
        tcp_port: args.tcp_port,
        http_port: args.http_port,
        htpasswd_file: args.htpasswd,
        group_file: args.groups,
        core_path: args.core_binary,
    })?;
    server.bind()?;
    server.run().await
}
