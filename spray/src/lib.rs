//! SOCKS5 proxy library — exposes modules for the binary and integration
//! tests.

pub mod deps;
pub mod error;
pub mod resolve;
pub mod server;
pub mod socks;
pub mod ssh;
pub mod subnet;

use std::net::{IpAddr, SocketAddr};

use tokio::sync::watch;
use tracing::info;

use crate::socks::Credentials;

/// Listener options shared by both proxy modes.
#[derive(Clone)]
pub struct ServeOptions {
    pub listen_address: IpAddr,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ServeOptions {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }
}

/// Trip the returned channel on SIGINT.
pub fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}
