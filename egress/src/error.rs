use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, EgressError>;

#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("config error: {0}")]
    Config(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("ssh proxy error: {0}")]
    SshProxy(String),

    #[error("packet filter error: {0}")]
    PacketFilter(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
