//! Kernel-level fan-out of the public SOCKS endpoint across the tunnel pool.
//!
//! `k` DNAT rules are appended to the NAT OUTPUT chain; rules `0..k-2` carry
//! an `nth`-mode statistic match (`--every k-i --packet 0`) and the last rule
//! is unconditional, which splits new flows exactly 1/k per tunnel without
//! connection tracking.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::command::{self, Privilege};
use crate::{EgressError, Result};

/// One recorded rule: the argv following `iptables -A` / `iptables -D`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    args: Vec<String>,
}

impl NatRule {
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

fn build_rules(service_addr: IpAddr, service_port: u16, tunnel_ports: &[u16]) -> Vec<NatRule> {
    let count = tunnel_ports.len();
    tunnel_ports
        .iter()
        .enumerate()
        .map(|(index, port)| {
            let mut args = vec![
                "OUTPUT".to_string(),
                "-t".to_string(),
                "nat".to_string(),
                "-d".to_string(),
                service_addr.to_string(),
                "-o".to_string(),
                "lo".to_string(),
                "-p".to_string(),
                "tcp".to_string(),
                "--dport".to_string(),
                service_port.to_string(),
                "-j".to_string(),
                "DNAT".to_string(),
                "--to-destination".to_string(),
                format!("127.0.0.1:{port}"),
            ];
            // All but the last rule take a statistical 1-of-(k-i) share of
            // the remaining flows; the last one takes everything left.
            if index + 1 != count {
                args.extend([
                    "-m".to_string(),
                    "statistic".to_string(),
                    "--mode".to_string(),
                    "nth".to_string(),
                    "--every".to_string(),
                    (count - index).to_string(),
                    "--packet".to_string(),
                    "0".to_string(),
                ]);
            }
            NatRule { args }
        })
        .collect()
}

/// Installs and tears down the DNAT rule block for a tunnel pool.
pub struct NatDispatcher {
    service_addr: IpAddr,
    service_port: u16,
    tunnel_ports: Vec<u16>,
    installed: Vec<NatRule>,
}

impl NatDispatcher {
    pub fn new(service_addr: IpAddr, service_port: u16, tunnel_ports: Vec<u16>) -> Self {
        Self {
            service_addr,
            service_port,
            tunnel_ports,
            installed: Vec::new(),
        }
    }

    /// Rules currently recorded as installed, in insertion order.
    pub fn installed(&self) -> &[NatRule] {
        &self.installed
    }

    /// Append the rule block. A failure part-way leaves the already
    /// installed prefix recorded so `remove` can undo it.
    pub async fn install(&mut self) -> Result<()> {
        debug!(
            rules = self.tunnel_ports.len(),
            service = %self.service_addr,
            port = self.service_port,
            "installing packet filter rules"
        );
        for rule in build_rules(self.service_addr, self.service_port, &self.tunnel_ports) {
            let mut argv: Vec<&str> = vec!["-A"];
            argv.extend(rule.args.iter().map(String::as_str));
            if let Err(e) = command::exec("iptables", &argv, Privilege::Elevated).await {
                return Err(if e.is_permission_denied() {
                    EgressError::Privilege(e.to_string())
                } else {
                    EgressError::PacketFilter(e.to_string())
                });
            }
            self.installed.push(rule);
        }
        Ok(())
    }

    /// Delete recorded rules in reverse insertion order. Errors are ignored
    /// (a rule may already be gone). Idempotent.
    pub async fn remove(&mut self) {
        if self.installed.is_empty() {
            return;
        }
        debug!(rules = self.installed.len(), "removing packet filter rules");
        for rule in self.installed.drain(..).rev() {
            let mut argv: Vec<&str> = vec!["-D"];
            argv.extend(rule.args.iter().map(String::as_str));
            command::exec_ignore_errors("iptables", &argv, Privilege::Elevated).await;
        }
    }
}

impl Drop for NatDispatcher {
    fn drop(&mut self) {
        if self.installed.is_empty() {
            return;
        }
        warn!(
            rules = self.installed.len(),
            "packet filter rules still installed, removing"
        );
        for rule in self.installed.drain(..).rev() {
            let mut argv: Vec<&str> = vec!["-D"];
            argv.extend(rule.args.iter().map(String::as_str));
            command::exec_blocking_ignore_errors("iptables", &argv, Privilege::Elevated);
        }
    }
}
