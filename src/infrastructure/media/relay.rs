//! Relay passthrough anchor
//!
//! The external relay rewrites both SDP bodies and forwards RTP itself, so
//! `bridge` has nothing to do. A relay session is keyed by Call-ID and
//! From-tag; the To-tag joins once the callee answers.

use crate::domain::media::{AnchorError, AnchorHandle, AnchorKind, HandleId, MediaAnchor};
use crate::domain::shared::{CallId, Tag};
use crate::infrastructure::protocols::ng::RelayControl;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct RelaySession {
    call_id: String,
    from_tag: String,
    to_tag: Option<String>,
}

pub struct RelayPassthrough {
    relay: Arc<dyn RelayControl>,
    strip_ice: bool,
    sessions: DashMap<HandleId, RelaySession>,
}

impl RelayPassthrough {
    pub fn new(relay: Arc<dyn RelayControl>, strip_ice: bool) -> Self {
        Self {
            relay,
            strip_ice,
            sessions: DashMap::new(),
        }
    }

    /// Relay sessions currently held
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl MediaAnchor for RelayPassthrough {
    fn kind(&self) -> AnchorKind {
        AnchorKind::RelayPassthrough
    }

    async fn prepare_offer(
        &self,
        call_id: &CallId,
        from_tag: &Tag,
        remote_offer: &str,
    ) -> Result<(String, AnchorHandle), AnchorError> {
        let sdp = self
            .relay
            .offer(call_id.as_str(), from_tag.as_str(), remote_offer)
            .await
            .map_err(|e| AnchorError::Relay(e.to_string()))?;

        let handle = AnchorHandle::new(self.kind());
        self.sessions.insert(
            handle.id,
            RelaySession {
                call_id: call_id.to_string(),
                from_tag: from_tag.to_string(),
                to_tag: None,
            },
        );
        debug!("Relay session {} opened for call {}", handle.id, call_id);
        Ok((sdp, handle))
    }

    async fn prepare_answer(
        &self,
        handle: &AnchorHandle,
        to_tag: &Tag,
        remote_answer: &str,
    ) -> Result<String, AnchorError> {
        let session = {
            let mut session = self
                .sessions
                .get_mut(&handle.id)
                .ok_or(AnchorError::UnknownHandle(handle.id))?;
            session.to_tag = Some(to_tag.to_string());
            session.clone()
        };

        self.relay
            .answer(
                &session.call_id,
                &session.from_tag,
                to_tag.as_str(),
                remote_answer,
                self.strip_ice,
            )
            .await
            .map_err(|e| AnchorError::Relay(e.to_string()))
    }

    async fn bridge(&self, handle: &AnchorHandle) -> Result<(), AnchorError> {
        if self.sessions.contains_key(&handle.id) {
            Ok(())
        } else {
            Err(AnchorError::UnknownHandle(handle.id))
        }
    }

    async fn release(&self, handle: &AnchorHandle) {
        let Some((_, session)) = self.sessions.remove(&handle.id) else {
            return;
        };

        match self
            .relay
            .delete(&session.call_id, &session.from_tag, session.to_tag.clone())
            .await
        {
            Ok(()) => info!("Relay session for call {} deleted", session.call_id),
            Err(e) => warn!("Relay delete for call {} failed: {}", session.call_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::ng::{MockRelayControl, RelayError};

    fn ids() -> (CallId, Tag) {
        (CallId::new("call-1"), Tag::new("from-1"))
    }

    #[tokio::test]
    async fn test_offer_answer_release() {
        let mut relay = MockRelayControl::new();
        relay
            .expect_offer()
            .times(1)
            .returning(|call_id, from_tag, sdp| {
                assert_eq!((call_id, from_tag, sdp), ("call-1", "from-1", "v=0 caller"));
                Ok("v=0 relayed offer".to_string())
            });
        relay
            .expect_answer()
            .times(1)
            .returning(|call_id, from_tag, to_tag, sdp, strip_ice| {
                assert_eq!(
                    (call_id, from_tag, to_tag, sdp, strip_ice),
                    ("call-1", "from-1", "to-1", "v=0 callee", true)
                );
                Ok("v=0 relayed answer".to_string())
            });
        relay
            .expect_delete()
            .times(1)
            .returning(|call_id, from_tag, to_tag| {
                assert_eq!((call_id, from_tag), ("call-1", "from-1"));
                assert_eq!(to_tag, Some("to-1".to_string()));
                Ok(())
            });

        let anchor = RelayPassthrough::new(Arc::new(relay), true);
        let (call_id, from_tag) = ids();

        let (offer, handle) = anchor.prepare_offer(&call_id, &from_tag, "v=0 caller").await.unwrap();
        assert_eq!(offer, "v=0 relayed offer");
        assert_eq!(handle.kind, AnchorKind::RelayPassthrough);

        let answer = anchor
            .prepare_answer(&handle, &Tag::new("to-1"), "v=0 callee")
            .await
            .unwrap();
        assert_eq!(answer, "v=0 relayed answer");
        anchor.bridge(&handle).await.unwrap();

        anchor.release(&handle).await;
        // Second release must not reach the relay again
        anchor.release(&handle).await;
        assert_eq!(anchor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_release_before_answer_deletes_without_to_tag() {
        let mut relay = MockRelayControl::new();
        relay
            .expect_offer()
            .returning(|_, _, _| Ok("v=0".to_string()));
        relay
            .expect_delete()
            .times(1)
            .returning(|_, _, to_tag| {
                assert_eq!(to_tag, None);
                Ok(())
            });

        let anchor = RelayPassthrough::new(Arc::new(relay), false);
        let (call_id, from_tag) = ids();
        let (_, handle) = anchor.prepare_offer(&call_id, &from_tag, "v=0").await.unwrap();

        anchor.release(&handle).await;
    }

    #[tokio::test]
    async fn test_offer_failure_leaves_nothing_behind() {
        let mut relay = MockRelayControl::new();
        relay
            .expect_offer()
            .returning(|_, _, _| Err(RelayError::Timeout(std::time::Duration::from_secs(1))));
        relay.expect_delete().times(0);

        let anchor = RelayPassthrough::new(Arc::new(relay), true);
        let (call_id, from_tag) = ids();

        let result = anchor.prepare_offer(&call_id, &from_tag, "v=0").await;
        assert!(matches!(result, Err(AnchorError::Relay(_))));
        assert_eq!(anchor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let anchor = RelayPassthrough::new(Arc::new(MockRelayControl::new()), true);
        let handle = AnchorHandle::new(AnchorKind::RelayPassthrough);

        let result = anchor.prepare_answer(&handle, &Tag::new("t"), "v=0").await;
        assert_eq!(result, Err(AnchorError::UnknownHandle(handle.id)));
        anchor.release(&handle).await;
    }
}
