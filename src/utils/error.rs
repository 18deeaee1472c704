use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxySshError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedProxyScheme(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("Proxy rejected tunnel: {0}")]
    TunnelRejected(String),

    #[error("Proxy protocol error: {0}")]
    ProtocolError(String),

    #[error("SSH transport error: {0}")]
    TransportError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Private key file not found: {0}")]
    KeyFileNotFound(String),

    #[error("Failed to load private key: {0}")]
    KeyLoadFailed(String),

    #[error("Pseudo-terminal allocation failed: {0}")]
    PtyAllocationFailed(String),

    #[error("Failed to start shell: {0}")]
    ShellStartFailed(String),

    #[error("Relay I/O error on {stream}: {reason}")]
    RelayIo { stream: &'static str, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProxySshError>;

impl ProxySshError {
    /// Returns a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::ConfigError(reason) => format!("Invalid arguments: {}", reason),
            Self::UnsupportedProxyScheme(scheme) => format!(
                "Unsupported proxy scheme '{}' (expected direct, http, socks4, socks4a, socks5 or socks5h)",
                scheme
            ),
            Self::ProxyUnreachable(reason) => format!("Cannot reach proxy: {}", reason),
            Self::TunnelRejected(reason) => format!("Proxy refused the tunnel: {}", reason),
            Self::HostKeyRejected(reason) => format!("Server host key not accepted: {}", reason),
            Self::KeyFileNotFound(path) => format!("Private key file not found: {}", path),
            _ => self.to_string(),
        }
    }

    /// Process exit status for a fatal error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) | Self::UnsupportedProxyScheme(_) | Self::InvalidDestination(_) => 2,
            _ => 1,
        }
    }

    /// True for errors raised while negotiating the proxy tunnel
    pub fn is_proxy_error(&self) -> bool {
        matches!(
            self,
            Self::ProxyUnreachable(_) | Self::TunnelRejected(_) | Self::ProtocolError(_)
        )
    }
}
