use egress::EgressError;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("socks protocol error: {0}")]
    SocksProtocol(String),

    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Egress(#[from] EgressError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
