//! Media anchoring port
//!
//! A call's media is anchored either by an external relay (the relay rewrites
//! both SDP bodies and switches RTP itself) or by a pair of local media
//! endpoints that we create and bridge. Both variants sit behind
//! [`MediaAnchor`] so the call bridge drives a single state machine.

use crate::domain::shared::{CallId, Tag};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
    /// Relay unreachable, timed out, or refused the session
    #[error("media relay error: {0}")]
    Relay(String),

    /// Local endpoint could not be created or configured
    #[error("media endpoint error: {0}")]
    Endpoint(String),

    #[error("malformed SDP: {0}")]
    InvalidSdp(String),

    #[error("unknown or released anchor handle {0}")]
    UnknownHandle(HandleId),
}

/// Which variant created a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorKind {
    RelayPassthrough,
    LocalEndpointBridge,
}

impl AnchorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorKind::RelayPassthrough => "relay",
            AnchorKind::LocalEndpointBridge => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to the media resources of one call.
///
/// The strategy that issued the handle keeps the actual resources keyed by
/// `id`; the handle itself carries no resources and may be cloned freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnchorHandle {
    pub id: HandleId,
    pub kind: AnchorKind,
}

impl AnchorHandle {
    pub fn new(kind: AnchorKind) -> Self {
        Self {
            id: HandleId::new(),
            kind,
        }
    }
}

/// Media anchoring strategy
#[async_trait]
pub trait MediaAnchor: Send + Sync {
    fn kind(&self) -> AnchorKind;

    /// Turn the caller's SDP offer into the offer sent to the callee
    async fn prepare_offer(
        &self,
        call_id: &CallId,
        from_tag: &Tag,
        remote_offer: &str,
    ) -> Result<(String, AnchorHandle), AnchorError>;

    /// Turn the callee's SDP answer into the answer sent back to the caller
    async fn prepare_answer(
        &self,
        handle: &AnchorHandle,
        to_tag: &Tag,
        remote_answer: &str,
    ) -> Result<String, AnchorError>;

    /// Connect the two legs' media. No-op for relays that switch on their own.
    async fn bridge(&self, handle: &AnchorHandle) -> Result<(), AnchorError>;

    /// Free everything behind `handle`. Idempotent, and safe on a handle
    /// whose answer was never prepared.
    async fn release(&self, handle: &AnchorHandle);
}
