//! Call context - everything one bridged call attempt owns

use super::dialog::Dialog;
use super::state::{CallEvent, CallState, CallStateMachine, CallStats};
use crate::domain::media::{AnchorHandle, MediaAnchor};
use crate::domain::shared::{CallId, Result, Tag};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Which side of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Caller side (we are UAS)
    Inbound,
    /// Callee side (we are UAC)
    Outbound,
}

/// One inbound call attempt.
///
/// Owned by the call bridge. Dialogs are shared with the transport, which
/// owns their wire state; the context decides when they are destroyed.
pub struct CallContext {
    pub call_id: CallId,
    pub from_tag: Tag,
    to_tag: RwLock<Option<Tag>>,
    /// Contact resolved at `Resolving`; later registration changes do not apply
    contact: RwLock<Option<String>>,
    inbound_dialog: RwLock<Option<Arc<dyn Dialog>>>,
    outbound_dialog: RwLock<Option<Arc<dyn Dialog>>>,
    anchor: Arc<dyn MediaAnchor>,
    anchor_handle: Mutex<Option<AnchorHandle>>,
    state: RwLock<CallStateMachine>,
    destroyed: AtomicBool,
}

impl CallContext {
    pub fn new(call_id: CallId, from_tag: Tag, anchor: Arc<dyn MediaAnchor>) -> Self {
        Self {
            call_id,
            from_tag,
            to_tag: RwLock::new(None),
            contact: RwLock::new(None),
            inbound_dialog: RwLock::new(None),
            outbound_dialog: RwLock::new(None),
            anchor,
            anchor_handle: Mutex::new(None),
            state: RwLock::new(CallStateMachine::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn anchor(&self) -> &Arc<dyn MediaAnchor> {
        &self.anchor
    }

    pub async fn state(&self) -> CallState {
        self.state.read().await.state()
    }

    pub async fn stats(&self) -> CallStats {
        self.state.read().await.stats().clone()
    }

    /// Apply `event` to the state machine
    pub async fn transition(&self, event: CallEvent) -> Result<CallState> {
        let mut sm = self.state.write().await;
        let from = sm.state();
        let to = sm.process_event(event)?;
        if from != to {
            debug!("Call {}: {} -> {}", self.call_id, from.name(), to.name());
        }
        Ok(to)
    }

    pub async fn set_contact(&self, contact: String) {
        *self.contact.write().await = Some(contact);
    }

    pub async fn contact(&self) -> Option<String> {
        self.contact.read().await.clone()
    }

    pub async fn set_to_tag(&self, tag: Tag) {
        *self.to_tag.write().await = Some(tag);
    }

    pub async fn to_tag(&self) -> Option<Tag> {
        self.to_tag.read().await.clone()
    }

    pub async fn set_anchor_handle(&self, handle: AnchorHandle) {
        *self.anchor_handle.lock().await = Some(handle);
    }

    pub async fn anchor_handle(&self) -> Option<AnchorHandle> {
        self.anchor_handle.lock().await.clone()
    }

    pub async fn set_dialog(&self, leg: Leg, dialog: Arc<dyn Dialog>) {
        match leg {
            Leg::Inbound => *self.inbound_dialog.write().await = Some(dialog),
            Leg::Outbound => *self.outbound_dialog.write().await = Some(dialog),
        }
    }

    pub async fn dialog(&self, leg: Leg) -> Option<Arc<dyn Dialog>> {
        match leg {
            Leg::Inbound => self.inbound_dialog.read().await.clone(),
            Leg::Outbound => self.outbound_dialog.read().await.clone(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Release the media anchor if this context still holds it
    pub async fn release_anchor(&self) -> bool {
        let handle = self.anchor_handle.lock().await.take();
        match handle {
            Some(handle) => {
                debug!("Call {}: releasing {} anchor {}", self.call_id, handle.kind.as_str(), handle.id);
                self.anchor.release(&handle).await;
                true
            }
            None => false,
        }
    }

    /// Tear the call down once.
    ///
    /// Destroys every leg except `origin` (the one that already ended) and
    /// releases the anchor. Only the first caller does any work; later or
    /// concurrent callers get `false`.
    pub async fn teardown(&self, origin: Option<Leg>) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            debug!("Call {}: teardown already done ({:?})", self.call_id, origin);
            return false;
        }

        info!("Call {}: tearing down (origin: {:?})", self.call_id, origin);

        for leg in [Leg::Inbound, Leg::Outbound] {
            if Some(leg) == origin {
                continue;
            }
            if let Some(dialog) = self.dialog(leg).await {
                if !dialog.is_destroyed() {
                    if let Err(e) = dialog.destroy().await {
                        warn!("Call {}: failed to destroy {:?} leg {}: {}", self.call_id, leg, dialog.id(), e);
                    }
                }
            }
        }

        self.release_anchor().await;
        true
    }
}
