use thiserror::Error;

/// the crate-wide error taxonomy.
///
/// fatal variants (`ConfigInvalid`, `BindFailed`) abort startup; the
/// rest are scoped to a single connection and are always turned into
/// a client response plus a log entry by the server, never a crash.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("failed to parse request: {0}")]
    ParseError(String),

    #[error("proxy authentication failed")]
    AuthFailed,

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("connect tunneling disabled")]
    ConnectDisabled,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(#[source] std::io::Error),

    #[error("upstream io error: {0}")]
    UpstreamIo(#[source] std::io::Error),
}

impl ProxyError {
    /// the status line and body text a client sees for this error, per
    /// the response table.
    pub fn response(&self) -> (u16, &'static str) {
        match self {
            ProxyError::ParseError(_) => (400, "Bad Request"),
            ProxyError::AuthFailed => (407, "Proxy Authentication Required"),
            ProxyError::Blocked(_) => (403, "Forbidden"),
            ProxyError::ConnectDisabled => (501, "Not Implemented"),
            ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamIo(_) => {
                (502, "Bad Gateway")
            }
            ProxyError::ConfigInvalid(_) | ProxyError::BindFailed(_) => {
                (500, "Internal Server Error")
            }
        }
    }

    /// the action tag this error maps to in the access log, for
    /// variants that are ever logged by the server (config/bind
    /// errors never reach the logger since they're fatal at startup).
    pub fn log_action(&self) -> &'static str {
        match self {
            ProxyError::ParseError(_) => "ERROR",
            ProxyError::AuthFailed => "AUTH_FAILED",
            ProxyError::Blocked(_) | ProxyError::ConnectDisabled => "BLOCKED",
            ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamIo(_) => "ERROR",
            ProxyError::ConfigInvalid(_) | ProxyError::BindFailed(_) => "ERROR",
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
