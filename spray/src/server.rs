//! SOCKS5 listener: accept loop, outbound dial with source spraying, and
//! the per-session relay pump.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use egress::subnet::{self, SubnetEgress};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::resolve;
use crate::socks::{self, Credentials, Request};

const RELAY_BUF: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SocksServer {
    listener: TcpListener,
    egress: Arc<SubnetEgress>,
    credentials: Option<Credentials>,
}

impl SocksServer {
    pub async fn bind(
        addr: SocketAddr,
        egress: Arc<SubnetEgress>,
        credentials: Option<Credentials>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            egress,
            credentials,
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until the shutdown channel fires, one task per connection.
    /// In-flight sessions are left to finish on their own.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepting connection");
                        let egress = Arc::clone(&self.egress);
                        let credentials = self.credentials.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_session(stream, egress, credentials).await {
                                error!(peer = %peer, error = %e, "session failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("stopped accepting connections");
    }
}

async fn handle_session(
    mut stream: TcpStream,
    egress: Arc<SubnetEgress>,
    credentials: Option<Credentials>,
) -> ProxyResult<()> {
    let request = socks::handshake(&mut stream, credentials.as_ref()).await?;
    match connect_upstream(&request, &egress).await {
        Ok(mut upstream) => {
            let bound_port = upstream.local_addr().map(|a| a.port()).unwrap_or(0);
            stream
                .write_all(&socks::success_reply(request.atyp, bound_port))
                .await?;
            relay(&mut stream, &mut upstream).await
        }
        Err(e) => {
            let _ = stream
                .write_all(&socks::failure_reply(
                    request.atyp,
                    socks::v5::REP_CONN_REFUSED,
                ))
                .await;
            Err(e)
        }
    }
}

/// Dial the requested target, binding the outbound socket to the next
/// sprayed source when the address families line up.
async fn connect_upstream(request: &Request, egress: &SubnetEgress) -> ProxyResult<TcpStream> {
    let target = resolve::resolve_target(&request.target, egress.pool().is_ipv6()).await?;
    let dest = SocketAddr::new(target, request.port);
    let families_match = target.is_ipv6() == egress.pool().is_ipv6();

    let connect = async {
        if families_match {
            let socket = if target.is_ipv6() {
                TcpSocket::new_v6()
            } else {
                TcpSocket::new_v4()
            }?;
            let source = egress
                .next_source()
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            debug!(source = %source, dest = %dest, "using random source address");
            subnet::bind_source(&socket, source)?;
            socket.connect(dest).await.map_err(ProxyError::from)
        } else {
            warn!(
                dest = %dest,
                subnet = %egress.pool(),
                "target family differs from egress subnet, connecting without source bind"
            );
            TcpStream::connect(dest).await.map_err(ProxyError::from)
        }
    };

    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(upstream)) => {
            debug!(dest = %dest, "connected");
            Ok(upstream)
        }
        Ok(Err(ProxyError::Io(e))) => {
            Err(ProxyError::Upstream(format!("connect to {dest} failed: {e}")))
        }
        Ok(Err(other)) => Err(other),
        Err(_) => Err(ProxyError::Upstream(format!("connect to {dest} timed out"))),
    }
}

/// Full-duplex byte pump; ends when either side reads EOF or an I/O error
/// occurs.
async fn relay(client: &mut TcpStream, upstream: &mut TcpStream) -> ProxyResult<()> {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();
    let mut outbound = [0u8; RELAY_BUF];
    let mut inbound = [0u8; RELAY_BUF];
    loop {
        tokio::select! {
            read = client_rd.read(&mut outbound) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                upstream_wr.write_all(outbound.get(..n).unwrap_or_default()).await?;
            }
            read = upstream_rd.read(&mut inbound) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                client_wr.write_all(inbound.get(..n).unwrap_or_default()).await?;
            }
        }
    }
    Ok(())
}
