//! Error taxonomy of the authenticated client

use transport::TransportError;

/// Why a session can no longer be used; the user has to log in again.
///
/// The stored credentials have been cleared for every variant except
/// `SessionEnded`, where a logout or another login already replaced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("account inactive: {0}")]
    AccountInactive(String),

    #[error("session ended while refreshing")]
    SessionEnded,
}

/// Errors from client operations.
///
/// `Clone` so a single refresh failure can be delivered to every request
/// queued behind it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("network error: {0}")]
    Transport(#[from] TransportError),

    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(AuthFailure),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("invalid body: {0}")]
    Decode(String),

    #[error("timed out waiting for token refresh")]
    RefreshWaitTimeout,

    #[error("token refresh abandoned before completing")]
    RefreshAbandoned,
}

impl Error {
    /// Whether the session is gone and the user must log in again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::AuthenticationFailed(_))
    }

    /// Whether trying the same call later may succeed without a new login.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_)
            | Error::RefreshFailed(_)
            | Error::RefreshWaitTimeout
            | Error::RefreshAbandoned => true,
            Error::Status { status, .. } => *status >= 500,
            Error::AuthenticationFailed(_) | Error::Credential(_) | Error::Decode(_) => false,
        }
    }

    /// HTTP status behind this error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<store_auth::Error> for Error {
    fn from(e: store_auth::Error) -> Self {
        match e {
            store_auth::Error::SessionChanged(_) => {
                Error::AuthenticationFailed(AuthFailure::SessionEnded)
            }
            e => Error::Credential(e.to_string()),
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_failures_are_terminal() {
        assert!(Error::AuthenticationFailed(AuthFailure::NoRefreshToken).is_terminal());
        assert!(!Error::RefreshFailed("502".into()).is_terminal());
        assert!(!Error::Transport(TransportError::Timeout("10s".into())).is_terminal());
        assert!(
            !Error::Status {
                status: 401,
                message: "Unauthorized".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::RefreshFailed("503".into()).is_retryable());
        assert!(Error::RefreshWaitTimeout.is_retryable());
        assert!(
            Error::Status {
                status: 503,
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(
            !Error::Status {
                status: 404,
                message: "not found".into()
            }
            .is_retryable()
        );
        let expired = Error::AuthenticationFailed(AuthFailure::SessionExpired("401".into()));
        assert!(!expired.is_retryable());
    }

    #[test]
    fn display_distinguishes_terminal_failure() {
        let err = Error::AuthenticationFailed(AuthFailure::NoRefreshToken);
        assert_eq!(err.to_string(), "authentication failed: no refresh token available");

        let net = Error::from(TransportError::Connect("refused".into()));
        assert_eq!(net.to_string(), "network error: connection failed: refused");
    }

    #[test]
    fn store_errors_convert() {
        let err: Error = store_auth::Error::Io("disk full".into()).into();
        assert!(matches!(err, Error::Credential(msg) if msg.contains("disk full")));

        let err: Error = store_auth::Error::SessionChanged("stale".into()).into();
        assert!(matches!(err, Error::AuthenticationFailed(AuthFailure::SessionEnded)));
        assert!(err.is_terminal());
    }
}
