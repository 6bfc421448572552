//! Typed error surface for device transport operations.
//!
//! Every failure crossing the public API carries an [`ErrorKind`] from a
//! closed set that is stable over the wire, a human-readable message, an
//! optional service tracking id, and an optional source cause. Transience is
//! derived from the kind so upper-layer retry policies can decide without
//! string matching.

use thiserror::Error;

/// Closed set of error kinds recognized by the service and this client.
///
/// The numeric codes for `Timeout`, `Throttled`, and `ArgumentInvalid` are
/// fixed by the wire protocol; the six-digit codes for the remaining service
/// kinds match the error bodies the service returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown,
    QuotaExceeded,
    DeviceMessageLockLost,
    DeviceNotFound,
    NetworkErrors,
    Suspended,
    PreconditionFailed,
    MessageTooLarge,
    ServerBusy,
    ServerError,
    Unauthorized,
    TlsAuthenticationError,
    /// HTTP status 408.
    Timeout,
    /// HTTP status 429.
    Throttled,
    /// Service error code 400004.
    ArgumentInvalid,
    /// Caller cancellation. Local-only: never produced from wire codes, and
    /// always wins over `Timeout` when both fire concurrently.
    OperationCancelled,
}

impl ErrorKind {
    /// Whether an upper-layer retry policy may retry this kind.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkErrors
                | ErrorKind::ServerBusy
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::Throttled
        )
    }

    /// Map a service error code (or bare HTTP status) to a known kind.
    ///
    /// Twin error bodies carry six-digit codes; twin response topics carry
    /// the HTTP status alone. Both spellings resolve to the same kind.
    pub fn from_error_code(code: i64) -> Option<ErrorKind> {
        match code {
            400004 => Some(ErrorKind::ArgumentInvalid),
            401 | 401002 => Some(ErrorKind::Unauthorized),
            403 | 403002 => Some(ErrorKind::QuotaExceeded),
            404 | 404001 => Some(ErrorKind::DeviceNotFound),
            405 | 405001 => Some(ErrorKind::Suspended),
            408 | 408001 => Some(ErrorKind::Timeout),
            412001 => Some(ErrorKind::PreconditionFailed),
            412 | 412002 => Some(ErrorKind::DeviceMessageLockLost),
            413 | 413001 => Some(ErrorKind::MessageTooLarge),
            429 | 429001 | 429002 => Some(ErrorKind::Throttled),
            500 | 500001 => Some(ErrorKind::ServerError),
            503 | 503001 => Some(ErrorKind::ServerBusy),
            _ => None,
        }
    }
}

/// Error type for all device transport operations.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct IotHubError {
    kind: ErrorKind,
    message: String,
    tracking_id: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl IotHubError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            tracking_id: None,
            source: None,
        }
    }

    pub fn with_source<S, E>(kind: ErrorKind, message: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            message: message.into(),
            tracking_id: None,
            source: Some(source.into()),
        }
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        let id = tracking_id.into();
        if !id.is_empty() {
            self.tracking_id = Some(id);
        }
        self
    }

    /// Shorthand for the transport-level network failure kind.
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::NetworkErrors, message)
    }

    /// Shorthand for caller cancellation.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::OperationCancelled, "The operation was canceled.")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn tracking_id(&self) -> Option<&str> {
        self.tracking_id.as_deref()
    }
}

/// Result type for device transport operations.
pub type IotHubResult<T> = Result<T, IotHubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_is_exactly_the_five_retryable_kinds() {
        let transient = [
            ErrorKind::NetworkErrors,
            ErrorKind::ServerBusy,
            ErrorKind::ServerError,
            ErrorKind::Timeout,
            ErrorKind::Throttled,
        ];
        for kind in transient {
            assert!(kind.is_transient(), "{kind:?} should be transient");
        }

        let terminal = [
            ErrorKind::Unknown,
            ErrorKind::QuotaExceeded,
            ErrorKind::DeviceMessageLockLost,
            ErrorKind::DeviceNotFound,
            ErrorKind::Suspended,
            ErrorKind::PreconditionFailed,
            ErrorKind::MessageTooLarge,
            ErrorKind::Unauthorized,
            ErrorKind::TlsAuthenticationError,
            ErrorKind::ArgumentInvalid,
            ErrorKind::OperationCancelled,
        ];
        for kind in terminal {
            assert!(!kind.is_transient(), "{kind:?} should not be transient");
        }
    }

    #[test]
    fn wire_codes_resolve_to_kinds() {
        assert_eq!(ErrorKind::from_error_code(408), Some(ErrorKind::Timeout));
        assert_eq!(ErrorKind::from_error_code(429), Some(ErrorKind::Throttled));
        assert_eq!(
            ErrorKind::from_error_code(400004),
            Some(ErrorKind::ArgumentInvalid)
        );
        // Both the bare status and the six-digit service code resolve.
        assert_eq!(
            ErrorKind::from_error_code(401),
            Some(ErrorKind::Unauthorized)
        );
        assert_eq!(
            ErrorKind::from_error_code(401002),
            Some(ErrorKind::Unauthorized)
        );
        assert_eq!(
            ErrorKind::from_error_code(404001),
            Some(ErrorKind::DeviceNotFound)
        );
        assert_eq!(ErrorKind::from_error_code(0), None);
        assert_eq!(ErrorKind::from_error_code(200), None);
    }

    #[test]
    fn error_carries_tracking_id_and_source() {
        let decode_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = IotHubError::with_source(ErrorKind::Unknown, "Failed to parse twin", decode_err)
            .with_tracking_id("trace-42");

        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.tracking_id(), Some("trace-42"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("Failed to parse twin"));
    }

    #[test]
    fn empty_tracking_id_is_dropped() {
        let err = IotHubError::new(ErrorKind::ServerBusy, "busy").with_tracking_id("");
        assert_eq!(err.tracking_id(), None);
    }

    #[test]
    fn cancellation_is_not_a_timeout() {
        let err = IotHubError::cancelled();
        assert_eq!(err.kind(), ErrorKind::OperationCancelled);
        assert_ne!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_transient());
    }
}
