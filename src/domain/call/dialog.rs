//! Signaling ports consumed by the call bridge
//!
//! The transport adapter owns the wire: parsing, retransmission, ACKs. The
//! bridge only sees the operations below and decides when legs live or die.

use crate::domain::shared::{CallId, Tag};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid target {0}")]
    InvalidTarget(String),

    /// A final response was already sent for this transaction
    #[error("transaction already completed")]
    Completed,

    #[error("dialog terminated")]
    Terminated,
}

/// An established signaling dialog (one leg of a bridged call)
#[async_trait]
pub trait Dialog: Send + Sync {
    /// Stable identifier used in logs
    fn id(&self) -> String;

    /// Hang the dialog up (BYE). Calling it on an ended dialog is a no-op.
    async fn destroy(&self) -> Result<(), DialogError>;

    /// Resolves once the dialog has ended, by either side
    async fn destroyed(&self);

    fn is_destroyed(&self) -> bool;
}

/// The caller's INVITE as seen by the bridge
#[derive(Debug, Clone)]
pub struct InboundInvite {
    pub call_id: CallId,
    pub from_tag: Tag,
    pub from_uri: String,
    pub request_uri: String,
    pub offer_sdp: String,
}

/// Server side of the inbound INVITE transaction.
///
/// `answer` and `reject` consume the responder, so at most one final
/// response can ever be sent.
#[async_trait]
pub trait InboundCall: Send + Sync {
    fn invite(&self) -> &InboundInvite;

    async fn send_provisional(&self, status: u16, reason: &str) -> Result<(), DialogError>;

    /// Resolves when the caller cancels the pending INVITE
    async fn cancelled(&self);

    fn is_cancelled(&self) -> bool;

    /// 200 OK with `sdp`; yields the confirmed inbound dialog
    async fn answer(self: Box<Self>, sdp: String) -> Result<Arc<dyn Dialog>, DialogError>;

    /// Non-2xx final response
    async fn reject(self: Box<Self>, status: u16, reason: String) -> Result<(), DialogError>;
}

/// Parameters of the outbound leg
#[derive(Debug, Clone)]
pub struct OutboundInvite {
    /// Contact URI resolved from the registry
    pub target: String,
    pub from_uri: String,
    pub to_uri: String,
    pub offer_sdp: String,
}

/// What the callee did with our INVITE
pub enum OutboundEvent {
    Provisional {
        status: u16,
        reason: String,
    },
    Answered {
        dialog: Arc<dyn Dialog>,
        to_tag: Tag,
        answer_sdp: String,
    },
    Rejected {
        status: u16,
        reason: String,
    },
}

impl std::fmt::Debug for OutboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboundEvent::Provisional { status, reason } => {
                write!(f, "Provisional({} {})", status, reason)
            }
            OutboundEvent::Answered { dialog, to_tag, .. } => {
                write!(f, "Answered(dialog={}, to_tag={})", dialog.id(), to_tag)
            }
            OutboundEvent::Rejected { status, reason } => {
                write!(f, "Rejected({} {})", status, reason)
            }
        }
    }
}

/// Client side of the outbound INVITE transaction
#[async_trait]
pub trait OutboundCall: Send + Sync {
    /// Next response from the callee; `None` once the transaction is gone
    async fn next_event(&mut self) -> Option<OutboundEvent>;

    /// CANCEL the pending INVITE
    async fn cancel(&mut self) -> Result<(), DialogError>;
}

/// Creates outbound legs
#[async_trait]
pub trait DialogFactory: Send + Sync {
    async fn invite(&self, request: OutboundInvite) -> Result<Box<dyn OutboundCall>, DialogError>;
}
