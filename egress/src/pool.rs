//! Supervisor for a pool of SSH tunnels with round-robin selection.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::nat::NatDispatcher;
use crate::tunnel::{SshTunnel, TunnelConfig};
use crate::{EgressError, Result};

pub const DEFAULT_BASE_PORT: u16 = 32482;

const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);
const REBUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// One round-robin selection: a tunnel's local SOCKS port, or the host's
/// own address (no source manipulation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Egress {
    Tunnel(u16),
    Direct,
}

/// The public SOCKS endpoint whose flows fan out across the tunnels.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub addr: IpAddr,
    pub port: u16,
}

pub struct SshPoolConfig {
    /// Remote endpoints, `user@host`, one tunnel each.
    pub hosts: Vec<String>,
    pub key: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Tunnel `i` listens on `base_port + i`.
    pub base_port: u16,
    /// Add a trailing direct slot to the rotation.
    pub include_direct: bool,
    /// When set, DNAT rules for this endpoint are programmed on start.
    pub service: Option<ServiceEndpoint>,
}

pub struct SshPool {
    tunnels: Vec<SshTunnel>,
    include_direct: bool,
    counter: AtomicUsize,
    nat: Option<NatDispatcher>,
}

impl SshPool {
    pub fn new(config: SshPoolConfig) -> Self {
        let tunnels: Vec<SshTunnel> = config
            .hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                SshTunnel::new(TunnelConfig {
                    host: host.clone(),
                    local_port: config.base_port + index as u16,
                    key: config.key.clone(),
                    passphrase: config.passphrase.clone(),
                })
            })
            .collect();
        let ports: Vec<u16> = tunnels.iter().map(SshTunnel::local_port).collect();
        let nat = config
            .service
            .map(|service| NatDispatcher::new(service.addr, service.port, ports));
        Self {
            tunnels,
            include_direct: config.include_direct,
            counter: AtomicUsize::new(0),
            nat,
        }
    }

    /// Number of rotation slots (tunnels plus the direct slot, if any).
    pub fn slots(&self) -> usize {
        self.tunnels.len() + usize::from(self.include_direct)
    }

    pub fn tunnel_ports(&self) -> Vec<u16> {
        self.tunnels.iter().map(SshTunnel::local_port).collect()
    }

    /// Launch every tunnel, then wait until all forward ports are
    /// listening. Fails as soon as any child exits early or the deadline
    /// passes. On success the packet-filter rules are installed.
    pub async fn start(&mut self, timeout: Duration) -> Result<()> {
        info!(tunnels = self.tunnels.len(), "starting ssh pool");
        for tunnel in &mut self.tunnels {
            tunnel.start(false, timeout).await?;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut all_up = true;
            for tunnel in &mut self.tunnels {
                if tunnel.is_up().await {
                    continue;
                }
                all_up = false;
                if tunnel.has_exited() {
                    return Err(EgressError::SshProxy(format!(
                        "failed to start ssh proxy {}: {}",
                        tunnel.endpoint(),
                        tunnel.command()
                    )));
                }
            }
            if all_up {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EgressError::SshProxy(format!(
                    "ssh pool did not come up within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        info!("all tunnels up");

        if let Some(nat) = &mut self.nat {
            nat.install().await?;
        }
        Ok(())
    }

    /// Stop every tunnel and remove the packet-filter rules. Idempotent.
    pub async fn stop(&mut self) {
        for tunnel in &mut self.tunnels {
            tunnel.stop().await;
        }
        if let Some(nat) = &mut self.nat {
            nat.remove().await;
        }
    }

    /// Poll tunnel liveness at 1 Hz and rebuild tunnels that went down, in
    /// place on their original port, until the shutdown channel fires.
    /// Rebuild failures are logged and retried on a later tick.
    pub async fn supervise(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for tunnel in &mut self.tunnels {
                        if tunnel.is_up().await {
                            continue;
                        }
                        warn!(endpoint = %tunnel.endpoint(), "tunnel went down, rebuilding");
                        if let Err(e) = tunnel.start(true, REBUILD_TIMEOUT).await {
                            error!(
                                endpoint = %tunnel.endpoint(),
                                error = %e,
                                "failed to rebuild tunnel"
                            );
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Round-robin selection over the rotation, in insertion order.
    pub fn next(&self) -> Egress {
        let slots = self.slots();
        if slots == 0 {
            return Egress::Direct;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % slots;
        match self.tunnels.get(index) {
            Some(tunnel) => Egress::Tunnel(tunnel.local_port()),
            None => Egress::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(hosts: &[&str], base_port: u16, include_direct: bool) -> SshPool {
        SshPool::new(SshPoolConfig {
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            key: None,
            passphrase: None,
            base_port,
            include_direct,
            service: None,
        })
    }

    #[test]
    fn ports_are_sequential_from_base() {
        let pool = pool(&["a@x", "b@y", "c@z"], DEFAULT_BASE_PORT, false);
        assert_eq!(pool.tunnel_ports(), vec![32482, 32483, 32484]);
    }

    #[test]
    fn round_robin_visits_in_insertion_order() {
        let pool = pool(&["a@x", "b@y", "c@z"], 40000, false);
        let picks: Vec<Egress> = (0..6).map(|_| pool.next()).collect();
        assert_eq!(
            picks,
            vec![
                Egress::Tunnel(40000),
                Egress::Tunnel(40001),
                Egress::Tunnel(40002),
                Egress::Tunnel(40000),
                Egress::Tunnel(40001),
                Egress::Tunnel(40002),
            ]
        );
    }

    #[test]
    fn round_robin_is_fair() {
        let pool = pool(&["a@x", "b@y", "c@z"], 40000, false);
        let rounds = 50;
        let mut counts: HashMap<Egress, usize> = HashMap::new();
        for _ in 0..rounds * pool.slots() {
            *counts.entry(pool.next()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, rounds);
        }
    }

    #[test]
    fn direct_slot_participates_as_sentinel() {
        let pool = pool(&["a@x", "b@y"], 40000, true);
        assert_eq!(pool.slots(), 3);
        let picks: Vec<Egress> = (0..6).map(|_| pool.next()).collect();
        assert_eq!(
            picks,
            vec![
                Egress::Tunnel(40000),
                Egress::Tunnel(40001),
                Egress::Direct,
                Egress::Tunnel(40000),
                Egress::Tunnel(40001),
                Egress::Direct,
            ]
        );
    }

    #[test]
    fn direct_only_pool_always_selects_direct() {
        let pool = pool(&[], 40000, true);
        assert_eq!(pool.next(), Egress::Direct);
        assert_eq!(pool.next(), Egress::Direct);
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let mut pool = pool(&["a@x", "b@y"], 40000, false);
        pool.stop().await;
        pool.stop().await;
    }
}
