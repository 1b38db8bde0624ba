use std::net::IpAddr;

use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::socks::TargetAddr;

/// Resolve a request target to a single address. Hostname lookups prefer
/// the egress subnet's family and fall back to the other one.
pub async fn resolve_target(target: &TargetAddr, prefer_ipv6: bool) -> ProxyResult<IpAddr> {
    match target {
        TargetAddr::Ip(ip) => Ok(*ip),
        TargetAddr::Domain(name) => {
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((name.as_str(), 0u16))
                .await
                .map_err(|e| ProxyError::Resolution(format!("lookup {name} failed: {e}")))?
                .map(|sa| sa.ip())
                .collect();
            let resolved = pick_address(&addrs, prefer_ipv6)
                .ok_or_else(|| ProxyError::Resolution(format!("no addresses for {name}")))?;
            debug!(host = %name, address = %resolved, "resolved target");
            Ok(resolved)
        }
    }
}

fn pick_address(addrs: &[IpAddr], prefer_ipv6: bool) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == prefer_ipv6)
        .or_else(|| addrs.first())
        .copied()
}
