//! SOCKS5 wire protocol (RFC 1928 with RFC 1929 username/password).
//!
//! Only CONNECT is supported. The success reply keeps the reference wire
//! format: ATYP is always 0x01 and the 4-byte address field carries the
//! client's address-type code big-endian, followed by the bound source port.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ProxyResult};

pub const SOCKS_VERSION: u8 = 0x05;

pub mod v5 {
    pub const METHOD_NO_AUTH: u8 = 0x00;
    pub const METHOD_USER_PASS: u8 = 0x02;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_CONN_REFUSED: u8 = 0x05;
    pub const AUTH_VERSION: u8 = 0x01;
    pub const AUTH_SUCCESS: u8 = 0x00;
    pub const AUTH_FAILURE: u8 = 0xFF;
}

/// The single username/password pair accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(IpAddr),
    Domain(String),
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: TargetAddr,
    pub port: u16,
    /// Address-type code as sent by the client; echoed in replies.
    pub atyp: u8,
}

/// Run the greeting, optional sub-negotiation and request phases. Any
/// protocol violation or short read errors out; the caller closes the
/// connection.
pub async fn handshake<S>(stream: &mut S, credentials: Option<&Credentials>) -> ProxyResult<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, credentials).await?;
    read_request(stream).await
}

async fn negotiate_method<S>(stream: &mut S, credentials: Option<&Credentials>) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [version, nmethods] = header;
    if version != SOCKS_VERSION {
        return Err(ProxyError::SocksProtocol(format!(
            "unsupported version {version:#04x}"
        )));
    }
    if nmethods == 0 {
        return Err(ProxyError::SocksProtocol(
            "no auth methods offered".to_string(),
        ));
    }
    let mut methods = vec![0u8; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;

    if let Some(credentials) = credentials
        && methods.contains(&v5::METHOD_USER_PASS)
    {
        stream
            .write_all(&[SOCKS_VERSION, v5::METHOD_USER_PASS])
            .await?;
        return verify_credentials(stream, credentials).await;
    }
    stream.write_all(&[SOCKS_VERSION, v5::METHOD_NO_AUTH]).await?;
    Ok(())
}

/// RFC 1929 sub-negotiation.
async fn verify_credentials<S>(stream: &mut S, credentials: &Credentials) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [version, username_len] = header;
    if version != v5::AUTH_VERSION {
        return Err(ProxyError::SocksProtocol(format!(
            "unsupported auth version {version:#04x}"
        )));
    }
    let username = read_string(stream, usize::from(username_len)).await?;
    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;
    let password = read_string(stream, usize::from(password_len[0])).await?;

    if username == credentials.username && password == credentials.password {
        stream
            .write_all(&[v5::AUTH_VERSION, v5::AUTH_SUCCESS])
            .await?;
        Ok(())
    } else {
        stream
            .write_all(&[v5::AUTH_VERSION, v5::AUTH_FAILURE])
            .await?;
        Err(ProxyError::SocksProtocol(
            "credential verification failed".to_string(),
        ))
    }
}

async fn read_request<S>(stream: &mut S) -> ProxyResult<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _rsv, atyp] = header;
    if version != SOCKS_VERSION {
        return Err(ProxyError::SocksProtocol(format!(
            "unsupported version {version:#04x} in request"
        )));
    }
    if cmd != v5::CMD_CONNECT {
        return Err(ProxyError::SocksProtocol(format!(
            "unsupported command {cmd:#04x}"
        )));
    }

    let target = match atyp {
        v5::ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetAddr::Ip(IpAddr::from(addr))
        }
        v5::ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetAddr::Ip(IpAddr::from(addr))
        }
        v5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            TargetAddr::Domain(read_string(stream, usize::from(len[0])).await?)
        }
        other => {
            return Err(ProxyError::SocksProtocol(format!(
                "unsupported address type {other:#04x}"
            )));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Request {
        target,
        port: u16::from_be_bytes(port),
        atyp,
    })
}

async fn read_string<S>(stream: &mut S, len: usize) -> ProxyResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| ProxyError::SocksProtocol("non-utf8 field in handshake".to_string()))
}

/// Success reply: `05 00 00 01` + 4-byte field carrying the client's ATYP
/// code + the locally bound source port.
pub fn success_reply(client_atyp: u8, bound_port: u16) -> [u8; 10] {
    let port = bound_port.to_be_bytes();
    [
        SOCKS_VERSION,
        0x00,
        0x00,
        v5::ATYP_IPV4,
        0,
        0,
        0,
        client_atyp,
        port[0],
        port[1],
    ]
}

/// Failure reply: `05 <code> 00 <atyp>` + zeroed address and port.
pub fn failure_reply(client_atyp: u8, code: u8) -> [u8; 10] {
    [
        SOCKS_VERSION,
        code,
        0x00,
        client_atyp,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}
