//! Connection status transitions surfaced to the device-client layer.

use parking_lot::{Mutex, RwLock};

/// Externally visible connection state of a transport handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The transport is open and operational.
    Connected,
    /// The transport lost its connection; an upper-layer retry policy
    /// decides whether and when to reopen.
    DisconnectedRetrying,
    /// The caller closed the transport.
    Closed,
    /// The service disabled this device identity.
    Disabled,
}

/// Why the status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusChangeReason {
    ClientOpen,
    ClientClose,
    CommunicationError,
    BadCredential,
    DeviceDisabled,
    QuotaExceeded,
    RetryExpired,
}

/// What the caller should do about the new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    PerformNormally,
    WaitForRetry,
    OpenConnection,
    Quit,
}

impl ConnectionStatus {
    pub fn recommended_action(self) -> RecommendedAction {
        match self {
            ConnectionStatus::Connected => RecommendedAction::PerformNormally,
            ConnectionStatus::DisconnectedRetrying => RecommendedAction::WaitForRetry,
            ConnectionStatus::Closed => RecommendedAction::OpenConnection,
            ConnectionStatus::Disabled => RecommendedAction::Quit,
        }
    }
}

/// One emitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusChange {
    pub status: ConnectionStatus,
    pub reason: ConnectionStatusChangeReason,
    pub recommended_action: RecommendedAction,
}

type StatusCallback = Box<dyn Fn(ConnectionStatusChange) + Send + Sync>;

/// Delivers connection-state transitions to the registered callback.
///
/// The bus itself does not dedupe: the handler only calls [`notify`] on
/// actual transitions, so a clean open+close pair produces exactly two
/// emissions.
///
/// [`notify`]: ConnectionStatusBus::notify
#[derive(Default)]
pub struct ConnectionStatusBus {
    callback: RwLock<Option<StatusCallback>>,
    current: Mutex<Option<ConnectionStatusChange>>,
}

impl ConnectionStatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionStatusChange) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Box::new(callback));
    }

    /// Record and emit a transition.
    pub fn notify(&self, status: ConnectionStatus, reason: ConnectionStatusChangeReason) {
        let change = ConnectionStatusChange {
            status,
            reason,
            recommended_action: status.recommended_action(),
        };
        *self.current.lock() = Some(change);
        if let Some(callback) = self.callback.read().as_ref() {
            callback(change);
        }
    }

    /// Last emitted status, if any transition has happened yet.
    pub fn current(&self) -> Option<ConnectionStatusChange> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recommended_action_follows_status() {
        assert_eq!(
            ConnectionStatus::Connected.recommended_action(),
            RecommendedAction::PerformNormally
        );
        assert_eq!(
            ConnectionStatus::DisconnectedRetrying.recommended_action(),
            RecommendedAction::WaitForRetry
        );
        assert_eq!(
            ConnectionStatus::Closed.recommended_action(),
            RecommendedAction::OpenConnection
        );
        assert_eq!(
            ConnectionStatus::Disabled.recommended_action(),
            RecommendedAction::Quit
        );
    }

    #[test]
    fn callback_sees_every_notification() {
        let bus = ConnectionStatusBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.set_callback(move |change| sink.lock().push(change));

        bus.notify(
            ConnectionStatus::Connected,
            ConnectionStatusChangeReason::ClientOpen,
        );
        bus.notify(
            ConnectionStatus::Closed,
            ConnectionStatusChangeReason::ClientClose,
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].status, ConnectionStatus::Connected);
        assert_eq!(seen[0].reason, ConnectionStatusChangeReason::ClientOpen);
        assert_eq!(seen[1].status, ConnectionStatus::Closed);
        assert_eq!(
            seen[1].recommended_action,
            RecommendedAction::OpenConnection
        );
    }

    #[test]
    fn current_tracks_last_notification() {
        let bus = ConnectionStatusBus::new();
        assert!(bus.current().is_none());

        bus.notify(
            ConnectionStatus::DisconnectedRetrying,
            ConnectionStatusChangeReason::CommunicationError,
        );
        let change = bus.current().unwrap();
        assert_eq!(change.status, ConnectionStatus::DisconnectedRetrying);
        assert_eq!(change.recommended_action, RecommendedAction::WaitForRetry);
    }

    #[test]
    fn notify_without_callback_is_silent() {
        let bus = ConnectionStatusBus::new();
        bus.notify(
            ConnectionStatus::Connected,
            ConnectionStatusChangeReason::ClientOpen,
        );
        assert!(bus.current().is_some());
    }
}
