//! Claims a subnet on the local host and hands out pseudo-random source
//! addresses from it.
//!
//! A `local` route makes the kernel accept any address inside the subnet as
//! a bind source on this machine; for IPv6 the outbound socket additionally
//! needs `IP_TRANSPARENT`.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpSocket;
use tracing::{info, warn};

use crate::command::{self, CommandError, Privilege};
use crate::cyclic::{AddressPool, IpGenerator};
use crate::{EgressError, Result};

/// Subnet-backed egress: installs the local route and supplies one source
/// address per outbound connection.
pub struct SubnetEgress {
    pool: AddressPool,
    iface: String,
    blacklist: HashSet<IpAddr>,
    ipgen: Mutex<IpGenerator>,
    route_installed: AtomicBool,
}

impl SubnetEgress {
    pub fn new(pool: AddressPool, iface: impl Into<String>, blacklist: HashSet<IpAddr>) -> Self {
        let ipgen = Mutex::new(IpGenerator::new(&pool, blacklist.clone()));
        Self {
            pool,
            iface: iface.into(),
            blacklist,
            ipgen,
            route_installed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn interface(&self) -> &str {
        &self.iface
    }

    /// Install the `local` route claiming the subnet. The server must not
    /// accept connections until this has succeeded.
    pub async fn start(&self) -> Result<()> {
        let subnet = self.pool.to_string();
        info!(subnet = %subnet, interface = %self.iface, "claiming subnet route");
        command::exec(
            "ip",
            &["route", "add", "local", &subnet, "dev", &self.iface],
            Privilege::Elevated,
        )
        .await
        .map_err(route_error)?;
        self.route_installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Remove the route. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.route_installed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let subnet = self.pool.to_string();
        info!(subnet = %subnet, "removing subnet route");
        command::exec(
            "ip",
            &["route", "del", "local", &subnet, "dev", &self.iface],
            Privilege::Elevated,
        )
        .await
        .map_err(route_error)?;
        Ok(())
    }

    /// Next source address from the current scan; exhausted scans are
    /// replaced with a fresh one (and a fresh ordering).
    pub fn next_source(&self) -> Result<IpAddr> {
        let mut ipgen = self.ipgen.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(addr) = ipgen.next() {
            return Ok(addr);
        }
        *ipgen = IpGenerator::new(&self.pool, self.blacklist.clone());
        ipgen.next().ok_or_else(|| {
            EgressError::Config(format!("address pool {} has no usable addresses", self.pool))
        })
    }
}

impl Drop for SubnetEgress {
    fn drop(&mut self) {
        if self.route_installed.swap(false, Ordering::SeqCst) {
            warn!(subnet = %self.pool, "subnet route still installed, removing");
            let subnet = self.pool.to_string();
            command::exec_blocking_ignore_errors(
                "ip",
                &["route", "del", "local", &subnet, "dev", &self.iface],
                Privilege::Elevated,
            );
        }
    }
}

fn route_error(e: CommandError) -> EgressError {
    if e.is_permission_denied() {
        EgressError::Privilege(e.to_string())
    } else {
        EgressError::Routing(e.to_string())
    }
}

/// Bind an outbound socket to `(source, 0)`. IPv6 sources first get
/// `IP_TRANSPARENT` so the kernel permits binding to a non-local address
/// covered by the subnet route.
pub fn bind_source(socket: &TcpSocket, source: IpAddr) -> Result<()> {
    if source.is_ipv6() {
        nix::sys::socket::setsockopt(socket, nix::sys::socket::sockopt::IpTransparent, &true)
            .map_err(|e| EgressError::Privilege(format!("set IP_TRANSPARENT: {e}")))?;
    }
    socket.bind(SocketAddr::new(source, 0))?;
    Ok(())
}

/// Pick the egress interface from the default route.
pub async fn detect_interface() -> Result<String> {
    let output = command::exec("ip", &["-json", "route", "get", "8.8.8.8"], Privilege::User)
        .await
        .map_err(EgressError::from)?;
    parse_route_device(&output)
        .ok_or_else(|| EgressError::Config("failed to detect egress interface".to_string()))
}

fn parse_route_device(json: &str) -> Option<String> {
    let routes: serde_json::Value = serde_json::from_str(json).ok()?;
    routes.get(0)?.get("dev")?.as_str().map(String::from)
}
