use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Unauthorized.")]
    AuthMissing,

    #[error("Unsupported authorization method: {scheme}")]
    AuthUnsupportedScheme { scheme: String },

    #[error("Incorrect username or password")]
    AuthInvalidCredentials { credentials: String },

    #[error("Method not allowed: {method}")]
    MethodNotAllowed { method: String },

    #[error("Request target must not start with a slash: {target}")]
    LeadingSlashRejected { target: String },

    #[error("Invalid authority: {0}")]
    InvalidAuthority(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Failed to connect to upstream {host}:{port}: {source}")]
    UpstreamConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer closed the tunnel")]
    PeerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl TunnelError {
    /// Status the client sees when the request is rejected before the tunnel opens.
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::AuthMissing
            | TunnelError::AuthUnsupportedScheme { .. }
            | TunnelError::AuthInvalidCredentials { .. } => StatusCode::FORBIDDEN,
            TunnelError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            TunnelError::LeadingSlashRejected { .. } => StatusCode::NOT_ACCEPTABLE,
            TunnelError::InvalidAuthority(_) | TunnelError::MalformedRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            TunnelError::HeaderTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            TunnelError::UpstreamConnect { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::AuthMissing
                | TunnelError::AuthUnsupportedScheme { .. }
                | TunnelError::AuthInvalidCredentials { .. }
        )
    }
}
