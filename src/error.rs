use crate::protocol::UserId;
use crate::session::SessionState;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRtc(Arc<webrtc::Error>),
    #[error("access to local media has been denied: {0}")]
    MediaAccessDenied(Arc<str>),
    #[error("screen capture has been cancelled by user")]
    UserCancelled,
    #[error("cannot apply signal to a session in {0} state")]
    InvalidSignal(SessionState),
    #[error("relay disconnected: {0}")]
    RelayDisconnected(Arc<str>),
    #[error(transparent)]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),
    #[error("malformed signaling message: {0}")]
    Codec(Arc<serde_json::Error>),
    #[error("invalid configuration: {0}")]
    Config(Arc<str>),
    #[error("room has already been closed")]
    RoomClosed,
}

impl Error {
    pub fn relay_disconnected<S: Into<Arc<str>>>(reason: S) -> Self {
        Error::RelayDisconnected(reason.into())
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::WebRtc(Arc::new(value))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Codec(Arc::new(value))
    }
}

/// Category of a failure reported to the user facing side of the room.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Camera or microphone could not be acquired. Sessions keep working receive-only.
    MediaAccessDenied,
    /// User dismissed the screen capture picker.
    UserCancelled,
    /// Negotiation with a single peer failed. Recovery is scheduled.
    NegotiationFailure,
    /// Relay connection dropped. Reconnection is in progress, peer sessions are preserved.
    RelayDisconnected,
    /// Signal arrived for a session which was already closed. It has been replaced.
    StaleSessionSignal,
    /// Peer failed too many times in a row. No more automatic recovery until force-reconnect.
    RetryBudgetExhausted,
    /// Relay could not be reached within reconnection budget. Room is closed.
    RelayReconnectExhausted,
}

#[derive(Debug, Clone)]
pub struct FailureReport {
    pub user_id: Option<UserId>,
    pub kind: FailureKind,
    pub error: Option<Error>,
}

impl FailureReport {
    pub fn new(kind: FailureKind) -> Self {
        FailureReport {
            user_id: None,
            kind,
            error: None,
        }
    }

    pub fn peer(user_id: UserId, kind: FailureKind) -> Self {
        FailureReport {
            user_id: Some(user_id),
            kind,
            error: None,
        }
    }

    pub fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(user_id) = &self.user_id {
            write!(f, " (peer {})", user_id)?;
        }
        if let Some(e) = &self.error {
            write!(f, ": {}", e)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::error::{Error, FailureKind, FailureReport};
    use crate::protocol::UserId;

    #[test]
    fn failure_report_display() {
        let report = FailureReport::peer(UserId::from("u1"), FailureKind::RetryBudgetExhausted)
            .with_error(Error::UserCancelled);
        assert_eq!(
            report.to_string(),
            "RetryBudgetExhausted (peer u1): screen capture has been cancelled by user"
        );
        assert!(matches!(report.error, Some(Error::UserCancelled)));

        let report = FailureReport::new(FailureKind::RelayDisconnected);
        assert_eq!(report.user_id, None);
        assert_eq!(report.to_string(), "RelayDisconnected");
    }
}
