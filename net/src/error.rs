use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot parse subnet cidr: {0}")]
    InvalidCidr(String),

    #[error("invalid mac address: {0}")]
    InvalidMac(String),

    #[error("mtu is out of range")]
    MtuOutOfRange,

    #[error("cannot find available IP")]
    PoolExhausted,

    #[error("proxy already running")]
    ProxyAlreadyRunning,

    #[error("proxy not found")]
    ProxyNotFound,

    #[error("invalid remote addr: {0}")]
    InvalidRemote(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("network stack error: {0}")]
    Stack(String),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl From<smoltcp::wire::Error> for NetError {
    fn from(e: smoltcp::wire::Error) -> Self {
        NetError::Stack(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
