//! Local endpoint bridge anchor
//!
//! Media is terminated on two endpoints we own. The callee's endpoint is
//! created first and its SDP becomes the outbound offer; once the callee
//! answers, that endpoint learns the callee's address, a second endpoint is
//! created for the caller from the caller's original offer, and the two are
//! bridged.

use super::server::MediaServer;
use crate::domain::media::{AnchorError, AnchorHandle, AnchorKind, HandleId, MediaAnchor};
use crate::domain::shared::{CallId, EndpointId, Tag};
use crate::infrastructure::protocols::sip::SdpSession;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct LocalSession {
    call_id: String,
    caller_offer: String,
    callee: EndpointId,
    caller: Option<EndpointId>,
}

pub struct LocalEndpointBridge {
    media: Arc<dyn MediaServer>,
    sessions: DashMap<HandleId, LocalSession>,
}

impl LocalEndpointBridge {
    pub fn new(media: Arc<dyn MediaServer>) -> Self {
        Self {
            media,
            sessions: DashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl MediaAnchor for LocalEndpointBridge {
    fn kind(&self) -> AnchorKind {
        AnchorKind::LocalEndpointBridge
    }

    async fn prepare_offer(
        &self,
        call_id: &CallId,
        _from_tag: &Tag,
        remote_offer: &str,
    ) -> Result<(String, AnchorHandle), AnchorError> {
        // Reject a useless offer before anything is allocated
        if SdpSession::parse(remote_offer).and_then(|sdp| sdp.audio_endpoint()).is_none() {
            return Err(AnchorError::InvalidSdp(format!("caller offer of call {}", call_id)));
        }

        let callee = self.media.create_endpoint(None).await?;
        let handle = AnchorHandle::new(self.kind());
        self.sessions.insert(
            handle.id,
            LocalSession {
                call_id: call_id.to_string(),
                caller_offer: remote_offer.to_string(),
                callee: callee.id,
                caller: None,
            },
        );

        debug!("Call {}: callee endpoint {} created", call_id, callee.id);
        Ok((callee.local_sdp, handle))
    }

    async fn prepare_answer(
        &self,
        handle: &AnchorHandle,
        _to_tag: &Tag,
        remote_answer: &str,
    ) -> Result<String, AnchorError> {
        let session = self
            .sessions
            .get(&handle.id)
            .map(|s| s.clone())
            .ok_or(AnchorError::UnknownHandle(handle.id))?;

        self.media.modify_endpoint(session.callee, remote_answer).await?;
        let caller = self.media.create_endpoint(Some(&session.caller_offer)).await?;

        // The handle may have been released while the endpoint was created
        let still_live = match self.sessions.get_mut(&handle.id) {
            Some(mut live) => {
                live.caller = Some(caller.id);
                true
            }
            None => false,
        };
        if !still_live {
            self.media.destroy_endpoint(caller.id).await;
            return Err(AnchorError::UnknownHandle(handle.id));
        }

        debug!("Call {}: caller endpoint {} created", session.call_id, caller.id);
        Ok(caller.local_sdp)
    }

    async fn bridge(&self, handle: &AnchorHandle) -> Result<(), AnchorError> {
        let (caller, callee) = {
            let session = self
                .sessions
                .get(&handle.id)
                .ok_or(AnchorError::UnknownHandle(handle.id))?;
            let caller = session
                .caller
                .ok_or_else(|| AnchorError::Endpoint("answer not prepared".to_string()))?;
            (caller, session.callee)
        };

        self.media.bridge(caller, callee).await
    }

    async fn release(&self, handle: &AnchorHandle) {
        let Some((_, session)) = self.sessions.remove(&handle.id) else {
            return;
        };

        if let Some(caller) = session.caller {
            self.media.destroy_endpoint(caller).await;
        }
        self.media.destroy_endpoint(session.callee).await;
        info!("Call {}: local media released", session.call_id);
    }
}
