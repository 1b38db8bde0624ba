//! `ssh` mode: bring up the tunnel pool, program the packet-filter fan-out
//! for the service endpoint, and supervise until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use egress::pool::{DEFAULT_BASE_PORT, ServiceEndpoint, SshPool, SshPoolConfig};
use tracing::info;

use crate::error::{ProxyError, ProxyResult};
use crate::{ServeOptions, deps, spawn_signal_handler};

const START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Args)]
pub struct SshArgs {
    /// SSH hosts (user@host) to round-robin through
    #[arg(required = true)]
    ssh_hosts: Vec<String>,
    /// SSH identity file to use when connecting
    #[arg(short, long)]
    key: Option<PathBuf>,
    /// Passphrase for the identity file
    #[arg(long, env = "SPRAY_KEY_PASSPHRASE", hide = true)]
    key_passphrase: Option<String>,
    /// First local port for the tunnels' SOCKS endpoints
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,
    /// Include the host's own address in the rotation
    #[arg(long)]
    current_ip: bool,
}

pub async fn run_ssh(options: ServeOptions, args: SshArgs) -> ProxyResult<()> {
    deps::check_dependencies(&["ssh", "ss", "iptables", "sudo"])?;

    let mut pool = SshPool::new(SshPoolConfig {
        hosts: args.ssh_hosts,
        key: args.key,
        passphrase: args.key_passphrase,
        base_port: args.base_port,
        include_direct: args.current_ip,
        service: Some(ServiceEndpoint {
            addr: options.listen_address,
            port: options.port,
        }),
    });

    if let Err(e) = pool.start(START_TIMEOUT).await {
        pool.stop().await;
        return Err(e.into());
    }
    info!(
        "Listening on socks5://{}:{}",
        options.listen_address, options.port
    );

    let shutdown = spawn_signal_handler();
    pool.supervise(shutdown).await;
    pool.stop().await;
    Err(ProxyError::Interrupted)
}
