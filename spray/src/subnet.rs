//! `subnet` mode: claim a subnet, then serve SOCKS5 with sprayed source
//! addresses until interrupted.

use std::collections::HashSet;
use std::sync::Arc;

use clap::Args;
use egress::cyclic::AddressPool;
use egress::subnet::SubnetEgress;
use tracing::info;

use crate::error::{ProxyError, ProxyResult};
use crate::server::SocksServer;
use crate::{ServeOptions, deps, spawn_signal_handler};

#[derive(Args)]
pub struct SubnetArgs {
    /// Subnet to send packets from (CIDR)
    #[arg(short, long)]
    subnet: String,
    /// Interface to send packets on (default: auto-detected)
    #[arg(short, long)]
    interface: Option<String>,
}

pub async fn run_subnet(options: ServeOptions, args: SubnetArgs) -> ProxyResult<()> {
    deps::check_dependencies(&["ip", "sudo"])?;

    let pool = AddressPool::parse(&args.subnet).map_err(|e| ProxyError::Config(e.to_string()))?;
    let interface = match args.interface {
        Some(interface) => interface,
        None => {
            let detected = egress::subnet::detect_interface().await?;
            info!(interface = %detected, "auto-detected egress interface");
            detected
        }
    };

    let egress = Arc::new(SubnetEgress::new(pool, interface, HashSet::new()));
    egress.start().await?;

    let result = serve(&options, Arc::clone(&egress)).await;
    egress.stop().await?;
    result
}

async fn serve(options: &ServeOptions, egress: Arc<SubnetEgress>) -> ProxyResult<()> {
    let server = SocksServer::bind(options.listen_addr(), egress, options.credentials.clone()).await?;
    info!("Listening on socks5://{}", server.local_addr()?);

    let shutdown = spawn_signal_handler();
    server.serve(shutdown).await;
    Err(ProxyError::Interrupted)
}
