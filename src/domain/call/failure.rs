//! Why a call attempt ended without being bridged, and what the caller hears

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// Request URI carried no usable user part
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// No live registration for the callee
    #[error("destination {0} is not registered")]
    DestinationUnreachable(String),

    /// Relay or local endpoint could not be set up
    #[error("media anchor unavailable: {0}")]
    AnchorUnavailable(String),

    /// Callee answered the INVITE with a final error status
    #[error("callee rejected the call: {status} {reason}")]
    RemoteRejected { status: u16, reason: String },

    /// Callee did not answer in time
    #[error("callee did not answer within {0:?}")]
    RemoteTimeout(Duration),

    /// Caller sent CANCEL before the call was answered
    #[error("cancelled by caller")]
    Cancelled,

    /// Signaling could not be sent or the leg vanished
    #[error("signaling failure: {0}")]
    Transport(String),
}

impl CallFailure {
    /// Final response status and reason phrase for the inbound leg
    pub fn response(&self) -> (u16, String) {
        match self {
            CallFailure::InvalidDestination(_) => (404, "Not Found".to_string()),
            CallFailure::DestinationUnreachable(_) => (486, "Busy Here".to_string()),
            CallFailure::AnchorUnavailable(_) => (500, "Server Internal Error".to_string()),
            CallFailure::RemoteRejected { status, reason } => (*status, reason.clone()),
            CallFailure::RemoteTimeout(_) => (408, "Request Timeout".to_string()),
            CallFailure::Cancelled => (487, "Request Terminated".to_string()),
            CallFailure::Transport(_) => (500, "Server Internal Error".to_string()),
        }
    }

    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            CallFailure::InvalidDestination(_) => "invalid_destination",
            CallFailure::DestinationUnreachable(_) => "unreachable",
            CallFailure::AnchorUnavailable(_) => "anchor",
            CallFailure::RemoteRejected { .. } => "rejected",
            CallFailure::RemoteTimeout(_) => "timeout",
            CallFailure::Cancelled => "cancelled",
            CallFailure::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_rejection_is_forwarded_verbatim() {
        let failure = CallFailure::RemoteRejected {
            status: 486,
            reason: "So sorry, busy right now".to_string(),
        };
        assert_eq!(failure.response(), (486, "So sorry, busy right now".to_string()));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(CallFailure::DestinationUnreachable("bob".into()).response().0, 486);
        assert_eq!(CallFailure::AnchorUnavailable("down".into()).response().0, 500);
        assert_eq!(CallFailure::RemoteTimeout(Duration::from_secs(30)).response().0, 408);
        assert_eq!(CallFailure::Cancelled.response().0, 487);
    }
}
