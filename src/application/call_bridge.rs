//! Call Bridge
//!
//! Back-to-back user agent core. For every inbound INVITE it resolves the
//! callee, anchors media, places the outbound leg, answers the caller once
//! the callee has answered, and ties the two legs' lifetimes together.
//!
//! ```text
//! Idle -> Resolving -> Anchoring -> Offering -> Ringing -> Answering -> Bridged -> Destroyed
//!            \            \            \           \           \
//!             +------------+------------+-----------+-----------+--> Failed -> Destroyed
//! ```
//!
//! Every exit path goes through [`CallContext::teardown`], which destroys the
//! remaining legs and releases the anchor exactly once.

use crate::domain::call::{
    CallContext, CallEvent, CallFailure, CallState, Dialog, DialogFactory, InboundCall, Leg,
    OutboundCall, OutboundEvent, OutboundInvite,
};
use crate::domain::media::MediaAnchor;
use crate::domain::registration::LocationRegistry;
use crate::domain::shared::{Aor, CallId};
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Timing policy of the bridge
#[derive(Debug, Clone)]
pub struct CallBridgeConfig {
    /// How long the callee may ring before the outbound leg is cancelled
    pub ring_timeout: Duration,
    /// How long a cancelled outbound leg is watched for a late 2xx
    pub late_answer_grace: Duration,
}

impl Default for CallBridgeConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            late_answer_grace: Duration::from_secs(32),
        }
    }
}

/// A setup step failed. `responder` is still present when no final
/// response has been sent to the caller yet.
struct SetupError {
    failure: CallFailure,
    responder: Option<Box<dyn InboundCall>>,
}

impl SetupError {
    fn new(failure: CallFailure, responder: Option<Box<dyn InboundCall>>) -> Self {
        Self { failure, responder }
    }
}

/// Call Bridge
pub struct CallBridge {
    registry: LocationRegistry,
    anchor: Arc<dyn MediaAnchor>,
    dialogs: Arc<dyn DialogFactory>,
    config: CallBridgeConfig,
    active_calls: Arc<RwLock<HashMap<CallId, Arc<CallContext>>>>,
}

impl CallBridge {
    pub fn new(
        registry: LocationRegistry,
        anchor: Arc<dyn MediaAnchor>,
        dialogs: Arc<dyn DialogFactory>,
        config: CallBridgeConfig,
    ) -> Self {
        Self {
            registry,
            anchor,
            dialogs,
            config,
            active_calls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drive one inbound INVITE until it is bridged or has failed.
    ///
    /// Exactly one final response reaches the caller on every path. Returns
    /// the failure when the call was not bridged.
    pub async fn handle_invite(self: &Arc<Self>, call: Box<dyn InboundCall>) -> Result<(), CallFailure> {
        let invite = call.invite().clone();
        counter!("sipbridge_calls_total").increment(1);
        info!(
            "Call {}: INVITE {} from {}",
            invite.call_id, invite.request_uri, invite.from_uri
        );

        // The anchor variant is fixed for the lifetime of the context
        let ctx = Arc::new(CallContext::new(
            invite.call_id.clone(),
            invite.from_tag.clone(),
            self.anchor.clone(),
        ));
        self.track(&ctx).await;

        match self.setup(&ctx, call).await {
            Ok(()) => {
                info!("Call {}: bridged via {} anchor", ctx.call_id, ctx.anchor().kind().as_str());
                Ok(())
            }
            Err(err) => {
                let failure = err.failure.clone();
                self.fail(&ctx, err).await;
                Err(failure)
            }
        }
    }

    async fn setup(self: &Arc<Self>, ctx: &Arc<CallContext>, call: Box<dyn InboundCall>) -> Result<(), SetupError> {
        let invite = call.invite().clone();
        self.advance(ctx, CallEvent::Invite).await;

        // Resolving
        let aor = match Aor::from_uri(&invite.request_uri) {
            Ok(aor) => aor,
            Err(e) => {
                return Err(SetupError::new(CallFailure::InvalidDestination(e.to_string()), Some(call)));
            }
        };
        let registration = match self.registry.lookup(&aor).await {
            Ok(registration) => registration,
            Err(_) => {
                return Err(SetupError::new(
                    CallFailure::DestinationUnreachable(aor.to_string()),
                    Some(call),
                ));
            }
        };
        debug!("Call {}: {} resolved to {}", ctx.call_id, aor, registration.contact);
        ctx.set_contact(registration.contact.clone()).await;
        self.advance(ctx, CallEvent::Resolved).await;

        // Anchoring
        let (offer_sdp, handle) = match ctx
            .anchor()
            .prepare_offer(&ctx.call_id, &ctx.from_tag, &invite.offer_sdp)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                return Err(SetupError::new(CallFailure::AnchorUnavailable(e.to_string()), Some(call)));
            }
        };
        ctx.set_anchor_handle(handle.clone()).await;

        // The offer runs to completion so a session the anchor opened is
        // tracked for release; the callee must not ring for a cancelled call
        if call.is_cancelled() {
            info!("Call {}: caller cancelled while anchoring", ctx.call_id);
            return Err(SetupError::new(CallFailure::Cancelled, Some(call)));
        }
        self.advance(ctx, CallEvent::Anchored).await;

        // Offering
        let request = OutboundInvite {
            target: registration.contact,
            from_uri: invite.from_uri.clone(),
            to_uri: invite.request_uri.clone(),
            offer_sdp,
        };
        let mut outbound = match self.dialogs.invite(request).await {
            Ok(outbound) => outbound,
            Err(e) => {
                return Err(SetupError::new(CallFailure::Transport(e.to_string()), Some(call)));
            }
        };
        self.advance(ctx, CallEvent::OutboundCreated).await;

        // A CANCEL during the INVITE send is picked up by the ringing loop
        if !call.is_cancelled() {
            if let Err(e) = call.send_provisional(180, "Ringing").await {
                warn!("Call {}: failed to send 180: {}", ctx.call_id, e);
            }
        }

        // Ringing
        let ring_timeout = self.config.ring_timeout;
        let deadline = tokio::time::sleep(ring_timeout);
        tokio::pin!(deadline);

        let (outbound_dialog, to_tag, remote_answer) = loop {
            tokio::select! {
                event = outbound.next_event() => match event {
                    Some(OutboundEvent::Provisional { status, reason }) => {
                        debug!("Call {}: callee sent {} {}", ctx.call_id, status, reason);
                        if status > 100 {
                            self.advance(ctx, CallEvent::Provisional).await;
                        }
                    }
                    Some(OutboundEvent::Answered { dialog, to_tag, answer_sdp }) => {
                        break (dialog, to_tag, answer_sdp);
                    }
                    Some(OutboundEvent::Rejected { status, reason }) => {
                        return Err(SetupError::new(
                            CallFailure::RemoteRejected { status, reason },
                            Some(call),
                        ));
                    }
                    None => {
                        return Err(SetupError::new(
                            CallFailure::Transport("outbound leg ended without a final response".to_string()),
                            Some(call),
                        ));
                    }
                },
                _ = call.cancelled() => {
                    info!("Call {}: caller cancelled while ringing", ctx.call_id);
                    self.abandon_outbound(ctx, outbound).await;
                    return Err(SetupError::new(CallFailure::Cancelled, Some(call)));
                }
                _ = &mut deadline => {
                    info!("Call {}: no answer within {:?}", ctx.call_id, ring_timeout);
                    self.abandon_outbound(ctx, outbound).await;
                    return Err(SetupError::new(CallFailure::RemoteTimeout(ring_timeout), Some(call)));
                }
            }
        };

        // Answering
        ctx.set_dialog(Leg::Outbound, outbound_dialog.clone()).await;
        ctx.set_to_tag(to_tag.clone()).await;
        self.advance(ctx, CallEvent::Answered).await;

        let prepared = tokio::select! {
            prepared = ctx.anchor().prepare_answer(&handle, &to_tag, &remote_answer) => prepared,
            _ = call.cancelled() => {
                info!("Call {}: caller cancelled while answering", ctx.call_id);
                return Err(SetupError::new(CallFailure::Cancelled, Some(call)));
            }
        };
        let local_answer = match prepared {
            Ok(sdp) => sdp,
            Err(e) => {
                return Err(SetupError::new(CallFailure::AnchorUnavailable(e.to_string()), Some(call)));
            }
        };

        let inbound_dialog = match call.answer(local_answer).await {
            Ok(dialog) => dialog,
            Err(e) => return Err(SetupError::new(CallFailure::Transport(e.to_string()), None)),
        };
        ctx.set_dialog(Leg::Inbound, inbound_dialog.clone()).await;

        if let Err(e) = ctx.anchor().bridge(&handle).await {
            return Err(SetupError::new(CallFailure::AnchorUnavailable(e.to_string()), None));
        }

        // Bridged
        self.advance(ctx, CallEvent::Bridged).await;
        self.link_legs(ctx, inbound_dialog, outbound_dialog);
        Ok(())
    }

    /// Cancel an unanswered outbound leg and keep watching it for a 2xx that
    /// crossed our CANCEL on the wire; such a leg is hung up at once.
    async fn abandon_outbound(&self, ctx: &CallContext, mut outbound: Box<dyn OutboundCall>) {
        if let Err(e) = outbound.cancel().await {
            warn!("Call {}: failed to cancel outbound leg: {}", ctx.call_id, e);
        }

        let call_id = ctx.call_id.clone();
        let grace = self.config.late_answer_grace;
        tokio::spawn(async move {
            let drained = tokio::time::timeout(grace, async {
                while let Some(event) = outbound.next_event().await {
                    match event {
                        OutboundEvent::Answered { dialog, .. } => {
                            warn!("Call {}: callee answered after cancel, hanging up {}", call_id, dialog.id());
                            if let Err(e) = dialog.destroy().await {
                                warn!("Call {}: failed to hang up late answer: {}", call_id, e);
                            }
                            return;
                        }
                        OutboundEvent::Rejected { status, .. } => {
                            debug!("Call {}: cancelled leg closed with {}", call_id, status);
                            return;
                        }
                        OutboundEvent::Provisional { .. } => {}
                    }
                }
            })
            .await;

            if drained.is_err() {
                debug!("Call {}: cancelled leg never completed", call_id);
            }
        });
    }

    /// Watch both legs; the first to end tears the call down
    fn link_legs(self: &Arc<Self>, ctx: &Arc<CallContext>, inbound: Arc<dyn Dialog>, outbound: Arc<dyn Dialog>) {
        for (leg, dialog) in [(Leg::Inbound, inbound), (Leg::Outbound, outbound)] {
            let bridge = Arc::clone(self);
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                dialog.destroyed().await;
                bridge.on_leg_destroyed(&ctx, leg).await;
            });
        }
    }

    /// A leg of a bridged call ended. Safe to call any number of times, from
    /// either leg, concurrently.
    pub async fn on_leg_destroyed(&self, ctx: &CallContext, leg: Leg) {
        if !ctx.teardown(Some(leg)).await {
            return;
        }

        self.advance(ctx, CallEvent::Hangup).await;
        self.untrack(&ctx.call_id).await;

        let duration = ctx.stats().await.call_duration().unwrap_or_default();
        counter!("sipbridge_calls_completed_total").increment(1);
        histogram!("sipbridge_call_duration_seconds").record(duration.as_secs_f64());
        info!("Call {}: ended by {:?} leg after {:?}", ctx.call_id, leg, duration);
    }

    async fn fail(&self, ctx: &CallContext, err: SetupError) {
        let (status, reason) = err.failure.response();
        warn!("Call {}: failed: {}", ctx.call_id, err.failure);
        counter!("sipbridge_calls_failed_total", "reason" => err.failure.label()).increment(1);

        self.advance(ctx, CallEvent::Fail).await;

        if let Some(responder) = err.responder {
            if let Err(e) = responder.reject(status, reason).await {
                warn!("Call {}: failed to send {}: {}", ctx.call_id, status, e);
            }
        }

        ctx.teardown(None).await;
        self.advance(ctx, CallEvent::Cleanup).await;
        self.untrack(&ctx.call_id).await;
    }

    /// Hang up an active call from our side
    pub async fn hangup(&self, call_id: &CallId) -> bool {
        let ctx = match self.active_calls.read().await.get(call_id).cloned() {
            Some(ctx) => ctx,
            None => return false,
        };

        // Calls still being set up are finished by their own task
        if !ctx.state().await.is_bridged() || !ctx.teardown(None).await {
            return false;
        }

        self.advance(&ctx, CallEvent::Hangup).await;
        self.untrack(call_id).await;
        info!("Call {}: hung up locally", call_id);
        true
    }

    /// Hang up every bridged call
    pub async fn shutdown(&self) {
        let call_ids: Vec<CallId> = self.active_calls.read().await.keys().cloned().collect();
        for call_id in call_ids {
            self.hangup(&call_id).await;
        }
    }

    pub async fn active_call_count(&self) -> usize {
        self.active_calls.read().await.len()
    }

    pub async fn call_state(&self, call_id: &CallId) -> Option<CallState> {
        let ctx = self.active_calls.read().await.get(call_id).cloned()?;
        Some(ctx.state().await)
    }

    async fn advance(&self, ctx: &CallContext, event: CallEvent) {
        if let Err(e) = ctx.transition(event).await {
            error!("Call {}: {}", ctx.call_id, e);
        }
    }

    async fn track(&self, ctx: &Arc<CallContext>) {
        let mut calls = self.active_calls.write().await;
        if calls.insert(ctx.call_id.clone(), ctx.clone()).is_some() {
            warn!("Call {}: replaced a context with the same Call-ID", ctx.call_id);
        }
        gauge!("sipbridge_active_calls").set(calls.len() as f64);
    }

    async fn untrack(&self, call_id: &CallId) {
        let mut calls = self.active_calls.write().await;
        calls.remove(call_id);
        gauge!("sipbridge_active_calls").set(calls.len() as f64);
    }
}
