use http::StatusCode;
use thiserror::Error;

/// errors surfaced by a codec dispatch or encode operation
///
/// protocol errors carry the detail string that ends up in the local reply
/// and the response code the server side answers with.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protocol error: {details}")]
    Protocol {
        details: &'static str,
        code: StatusCode,
    },
    // the application drove the codec into a disallowed operation,
    // fatal to the current connection
    #[error("codec client error: {0}")]
    Client(&'static str),
    // response headers arrived without a pending request
    #[error("premature response")]
    PrematureResponse,
}

impl CodecError {
    pub fn protocol(details: &'static str) -> Self {
        CodecError::Protocol {
            details,
            code: StatusCode::BAD_REQUEST,
        }
    }

    pub fn protocol_with_code(details: &'static str, code: StatusCode) -> Self {
        CodecError::Protocol { details, code }
    }

    /// the detail string attached to the error, used for local replies
    pub fn details(&self) -> &'static str {
        match self {
            CodecError::Protocol { details, .. } => details,
            CodecError::Client(details) => details,
            CodecError::PrematureResponse => "premature_response",
        }
    }

    /// the response code a server connection answers with
    pub fn response_code(&self) -> StatusCode {
        match self {
            CodecError::Protocol { code, .. } => *code,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// why a stream was torn down before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    LocalReset,
    RemoteReset,
    LocalRefusedStreamReset,
    RemoteRefusedStreamReset,
    LocalConnectionFailure,
    RemoteConnectionFailure,
    ConnectionTimeout,
    ConnectionTermination,
    ProtocolError,
    ConnectError,
    Overflow,
    Http1PrematureUpstreamHalfClose,
    OverloadManager,
}

impl StreamResetReason {
    /// true for resets raised while establishing the upstream connection
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            StreamResetReason::LocalConnectionFailure
                | StreamResetReason::RemoteConnectionFailure
                | StreamResetReason::ConnectionTimeout
                | StreamResetReason::ConnectError
        )
    }

    /// response code the router answers with when an upstream resets
    pub fn upstream_status(&self) -> StatusCode {
        match self {
            StreamResetReason::ProtocolError => StatusCode::BAD_GATEWAY,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// response flag charged on stream info for this reset
    pub fn response_flag(&self) -> ResponseFlag {
        match self {
            StreamResetReason::LocalConnectionFailure
            | StreamResetReason::RemoteConnectionFailure
            | StreamResetReason::ConnectionTimeout
            | StreamResetReason::ConnectError => ResponseFlag::UpstreamConnectionFailure,
            StreamResetReason::ConnectionTermination => {
                ResponseFlag::UpstreamConnectionTermination
            }
            StreamResetReason::RemoteReset | StreamResetReason::RemoteRefusedStreamReset => {
                ResponseFlag::UpstreamRemoteReset
            }
            StreamResetReason::Overflow => ResponseFlag::UpstreamOverflow,
            StreamResetReason::ProtocolError => ResponseFlag::UpstreamProtocolError,
            StreamResetReason::OverloadManager => ResponseFlag::OverloadManager,
            _ => ResponseFlag::LocalReset,
        }
    }
}

/// per-stream outcome flags recorded on stream info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    NoRouteFound,
    NoClusterFound,
    UpstreamConnectionFailure,
    UpstreamConnectionTermination,
    UpstreamRemoteReset,
    UpstreamOverflow,
    UpstreamProtocolError,
    LocalReset,
    OverloadManager,
}

/// why the pool failed to produce a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    Overflow,
    LocalConnectionFailure,
    RemoteConnectionFailure,
    ConnectionTimeout,
}

impl PoolFailureReason {
    pub fn reset_reason(&self) -> StreamResetReason {
        match self {
            PoolFailureReason::Overflow => StreamResetReason::Overflow,
            PoolFailureReason::LocalConnectionFailure => {
                StreamResetReason::LocalConnectionFailure
            }
            PoolFailureReason::RemoteConnectionFailure => {
                StreamResetReason::RemoteConnectionFailure
            }
            PoolFailureReason::ConnectionTimeout => StreamResetReason::ConnectionTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_status_mapping() {
        assert_eq!(
            StreamResetReason::ProtocolError.upstream_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            StreamResetReason::ConnectionTimeout.upstream_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            StreamResetReason::Overflow.upstream_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn connect_failure_classification() {
        assert!(StreamResetReason::ConnectionTimeout.is_connect_failure());
        assert!(StreamResetReason::LocalConnectionFailure.is_connect_failure());
        assert!(!StreamResetReason::RemoteReset.is_connect_failure());
    }
}
