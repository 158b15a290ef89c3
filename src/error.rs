use std::fmt;

/// Error taxonomy for the proxy data plane and cluster-membership subsystem.
#[derive(Debug)]
pub enum BackplaneError {
    NoHealthyBackendAvailable,
    RateLimited,
    NoPrivateKey,
    NoPublicCert,
    BufferOverflow,
    Stopped,
    PacketTooBig,
    BadIp(String),
    NoSuchContext,
    Config(String),
    Internal(String),
}

impl fmt::Display for BackplaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackplaneError::NoHealthyBackendAvailable => write!(f, "no healthy backend available"),
            BackplaneError::RateLimited => write!(f, "rate limited"),
            BackplaneError::NoPrivateKey => write!(f, "no private key found in certificate file"),
            BackplaneError::NoPublicCert => write!(f, "no public certificate found in certificate file"),
            BackplaneError::BufferOverflow => write!(f, "log shipper queue full"),
            BackplaneError::Stopped => write!(f, "listener stopped"),
            BackplaneError::PacketTooBig => write!(f, "packet exceeds maximum datagram size"),
            BackplaneError::BadIp(addr) => write!(f, "bad address: {}", addr),
            BackplaneError::NoSuchContext => write!(f, "no such request context"),
            BackplaneError::Config(msg) => write!(f, "config error: {}", msg),
            BackplaneError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BackplaneError {}

impl BackplaneError {
    /// HTTP status the proxy layer responds with for this error.
    /// Auth failures (401) and unknown-host (403) are produced directly by
    /// the auth wrapper and host-switch, not routed through this mapping.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            BackplaneError::NoHealthyBackendAvailable => http::StatusCode::SERVICE_UNAVAILABLE,
            BackplaneError::RateLimited => http::StatusCode::SERVICE_UNAVAILABLE,
            BackplaneError::Stopped => http::StatusCode::SERVICE_UNAVAILABLE,
            _ => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
