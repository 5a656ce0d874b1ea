//! SIP dialogs and INVITE transactions over UDP
//!
//! Implements the signaling ports the call bridge drives: the server side of
//! the caller's INVITE, the client side of the INVITE we send to the callee,
//! and the confirmed dialogs that result.

use super::builder::{allow_header, RequestBuilder, ResponseBuilder};
use super::message::{header_uri, SipMethod, SipRequest, SipResponse};
use super::user_agent::SipUserAgent;
use crate::domain::call::{Dialog, DialogError, InboundCall, InboundInvite, OutboundCall, OutboundEvent};
use crate::domain::shared::Tag;
use async_trait::async_trait;
use bytes::Bytes;
use rsip::Header;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

fn transport_error(e: impl std::fmt::Display) -> DialogError {
    DialogError::Transport(e.to_string())
}

/// Addressing of a confirmed dialog, from our side
#[derive(Debug, Clone)]
pub struct DialogParams {
    pub call_id: String,
    pub local_uri: String,
    pub local_tag: String,
    pub remote_uri: String,
    pub remote_tag: String,
    /// Request-URI for in-dialog requests
    pub remote_target: String,
    /// Where in-dialog requests are sent
    pub destination: SocketAddr,
    /// Last CSeq we used in this dialog
    pub local_cseq: u32,
}

/// A confirmed dialog.
///
/// Terminates at most once, either by our BYE or by the peer's.
pub struct UdpDialog {
    params: DialogParams,
    cseq: AtomicU32,
    /// ACK for the 2xx that confirmed a dialog we initiated
    ack: Option<Bytes>,
    terminated: watch::Sender<bool>,
    ua: Weak<SipUserAgent>,
}

impl UdpDialog {
    pub fn new(params: DialogParams, ack: Option<Bytes>, ua: Weak<SipUserAgent>) -> Arc<Self> {
        let (terminated, _) = watch::channel(false);
        Arc::new(Self {
            cseq: AtomicU32::new(params.local_cseq),
            params,
            ack,
            terminated,
            ua,
        })
    }

    pub fn params(&self) -> &DialogParams {
        &self.params
    }

    /// Flip to terminated; true only for the caller that did it
    fn mark_terminated(&self) -> bool {
        self.terminated.send_if_modified(|terminated| {
            if *terminated {
                false
            } else {
                *terminated = true;
                true
            }
        })
    }

    /// Peer sent BYE
    pub(crate) fn on_remote_bye(&self) {
        if self.mark_terminated() {
            info!("Dialog {} ended by remote BYE", self.params.call_id);
        }
    }

    /// The callee retransmitted its 2xx, so our ACK was lost
    pub(crate) async fn retransmit_ack(&self) {
        let (Some(ack), Some(ua)) = (&self.ack, self.ua.upgrade()) else {
            return;
        };
        debug!("Retransmitting ACK for dialog {}", self.params.call_id);
        if let Err(e) = ua.transport().send(ack, self.params.destination).await {
            warn!("ACK retransmission for {} failed: {}", self.params.call_id, e);
        }
    }
}

#[async_trait]
impl Dialog for UdpDialog {
    fn id(&self) -> String {
        self.params.call_id.clone()
    }

    async fn destroy(&self) -> Result<(), DialogError> {
        if !self.mark_terminated() {
            return Ok(());
        }

        let ua = self.ua.upgrade().ok_or(DialogError::Terminated)?;
        ua.dialogs().remove(&self.params.call_id);

        let p = &self.params;
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let bye = RequestBuilder::new(SipMethod::Bye, &p.remote_target, ua.advertised())
            .from(&p.local_uri, &p.local_tag)
            .to(&p.remote_uri, Some(&p.remote_tag))
            .call_id(&p.call_id)
            .cseq(cseq)
            .build();

        info!("Sending BYE for dialog {}", p.call_id);
        ua.transport().send(&bye, p.destination).await.map_err(transport_error)
    }

    async fn destroyed(&self) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    fn is_destroyed(&self) -> bool {
        *self.terminated.borrow()
    }
}

/// State of an INVITE we have not sent a final response to yet
pub struct PendingInvite {
    pub request: SipRequest,
    pub source: SocketAddr,
    /// Our To-tag for every response in this transaction
    pub to_tag: Tag,
    cancelled: watch::Sender<bool>,
}

impl PendingInvite {
    pub fn new(request: SipRequest, source: SocketAddr) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            request,
            source,
            to_tag: Tag::generate(),
            cancelled,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// Server side of the caller's INVITE
pub struct UdpInboundCall {
    ua: Arc<SipUserAgent>,
    invite: InboundInvite,
    pending: Arc<PendingInvite>,
}

impl UdpInboundCall {
    pub fn new(ua: Arc<SipUserAgent>, invite: InboundInvite, pending: Arc<PendingInvite>) -> Self {
        Self { ua, invite, pending }
    }

    async fn respond(&self, builder: ResponseBuilder) -> Result<(), DialogError> {
        let response = builder
            .to_tag(self.pending.to_tag.as_str())
            .build_for_request(&self.pending.request)
            .map_err(transport_error)?;
        self.ua
            .transport()
            .send(&response.to_bytes(), self.pending.source)
            .await
            .map_err(transport_error)
    }

    fn finish(&self) {
        self.ua
            .inbound()
            .remove_if(self.invite.call_id.as_str(), |_, p| Arc::ptr_eq(p, &self.pending));
    }
}

#[async_trait]
impl InboundCall for UdpInboundCall {
    fn invite(&self) -> &InboundInvite {
        &self.invite
    }

    async fn send_provisional(&self, status: u16, reason: &str) -> Result<(), DialogError> {
        self.respond(ResponseBuilder::new(status).reason(reason)).await
    }

    async fn cancelled(&self) {
        let mut rx = self.pending.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    fn is_cancelled(&self) -> bool {
        self.pending.is_cancelled()
    }

    async fn answer(self: Box<Self>, sdp: String) -> Result<Arc<dyn Dialog>, DialogError> {
        // A CANCEL that slipped in ahead of the answer still gets its 487
        if self.pending.is_cancelled() {
            self.respond(ResponseBuilder::new(487)).await?;
            self.finish();
            return Err(DialogError::Completed);
        }

        let request = &self.pending.request;
        let remote_uri = request.from_uri().unwrap_or_else(|| self.invite.from_uri.clone());
        let remote_target = request
            .header("Contact")
            .map(|c| header_uri(&c))
            .unwrap_or_else(|| remote_uri.clone());

        let dialog = UdpDialog::new(
            DialogParams {
                call_id: self.invite.call_id.to_string(),
                local_uri: request.to_uri().unwrap_or_else(|| self.invite.request_uri.clone()),
                local_tag: self.pending.to_tag.to_string(),
                remote_uri,
                remote_tag: self.invite.from_tag.to_string(),
                remote_target,
                destination: self.pending.source,
                local_cseq: 0,
            },
            None,
            Arc::downgrade(&self.ua),
        );
        // Registered before the 200 leaves so an immediate BYE finds it
        self.ua.dialogs().insert(self.invite.call_id.to_string(), dialog.clone());

        let contact = format!("<{}>", self.ua.contact_uri());
        let sent = self
            .respond(
                ResponseBuilder::ok()
                    .header(Header::Contact(contact.into()))
                    .header(allow_header())
                    .sdp(&sdp),
            )
            .await;
        self.finish();
        if let Err(e) = sent {
            self.ua
                .dialogs()
                .remove_if(self.invite.call_id.as_str(), |_, d| Arc::ptr_eq(d, &dialog));
            return Err(e);
        }

        info!("Answered inbound call {}", self.invite.call_id);
        Ok(dialog)
    }

    async fn reject(self: Box<Self>, status: u16, reason: String) -> Result<(), DialogError> {
        let result = self.respond(ResponseBuilder::new(status).reason(reason)).await;
        self.finish();
        result
    }
}

impl Drop for UdpInboundCall {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Client side of the INVITE sent to the callee
pub struct UdpOutboundCall {
    ua: Arc<SipUserAgent>,
    call_id: String,
    from_uri: String,
    from_tag: Tag,
    to_uri: String,
    request_uri: String,
    destination: SocketAddr,
    /// Branch of the INVITE, shared by its CANCEL and non-2xx ACK
    branch: String,
    responses: mpsc::UnboundedReceiver<SipResponse>,
    completed: bool,
}

impl UdpOutboundCall {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ua: Arc<SipUserAgent>,
        call_id: String,
        from_uri: String,
        from_tag: Tag,
        to_uri: String,
        request_uri: String,
        destination: SocketAddr,
        branch: String,
        responses: mpsc::UnboundedReceiver<SipResponse>,
    ) -> Self {
        Self {
            ua,
            call_id,
            from_uri,
            from_tag,
            to_uri,
            request_uri,
            destination,
            branch,
            responses,
            completed: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn send(&self, data: &[u8]) -> Result<(), DialogError> {
        self.ua
            .transport()
            .send(data, self.destination)
            .await
            .map_err(transport_error)
    }

    fn confirm(&mut self, response: &SipResponse, to_tag: &str) -> (Arc<UdpDialog>, Bytes) {
        let remote_target = response
            .header("Contact")
            .map(|c| header_uri(&c))
            .unwrap_or_else(|| self.request_uri.clone());

        // ACK for a 2xx is its own transaction
        let ack = RequestBuilder::new(SipMethod::Ack, &remote_target, self.ua.advertised())
            .from(&self.from_uri, self.from_tag.as_str())
            .to(&self.to_uri, Some(to_tag))
            .call_id(&self.call_id)
            .cseq(1)
            .build();

        let dialog = UdpDialog::new(
            DialogParams {
                call_id: self.call_id.clone(),
                local_uri: self.from_uri.clone(),
                local_tag: self.from_tag.to_string(),
                remote_uri: self.to_uri.clone(),
                remote_tag: to_tag.to_string(),
                remote_target,
                destination: self.destination,
                local_cseq: 1,
            },
            Some(ack.clone()),
            Arc::downgrade(&self.ua),
        );
        (dialog, ack)
    }

    fn complete(&mut self) {
        self.completed = true;
        self.ua.outbound().remove(&self.call_id);
    }
}

#[async_trait]
impl OutboundCall for UdpOutboundCall {
    async fn next_event(&mut self) -> Option<OutboundEvent> {
        loop {
            if self.completed {
                return None;
            }

            let response = self.responses.recv().await?;
            if response.cseq_method().as_deref() != Some(SipMethod::Invite.as_str()) {
                debug!(
                    "Outbound {}: {} to {:?}",
                    self.call_id,
                    response.status_code(),
                    response.cseq_method()
                );
                continue;
            }

            let status = response.status_code();
            match status {
                100..=199 => {
                    return Some(OutboundEvent::Provisional {
                        status,
                        reason: response.reason(),
                    });
                }
                200..=299 => {
                    let to_tag = response.to_tag().unwrap_or_default();
                    let (dialog, ack) = self.confirm(&response, &to_tag);
                    if let Err(e) = self.send(&ack).await {
                        warn!("ACK for outbound {} failed: {}", self.call_id, e);
                    }
                    self.ua.dialogs().insert(self.call_id.clone(), dialog.clone());
                    self.complete();

                    return Some(OutboundEvent::Answered {
                        dialog,
                        to_tag: Tag::new(to_tag),
                        answer_sdp: response.body_str(),
                    });
                }
                _ => {
                    // Non-2xx ACK belongs to the INVITE transaction
                    let ack = RequestBuilder::new(SipMethod::Ack, &self.request_uri, self.ua.advertised())
                        .branch(&self.branch)
                        .from(&self.from_uri, self.from_tag.as_str())
                        .to(&self.to_uri, response.to_tag().as_deref())
                        .call_id(&self.call_id)
                        .cseq(1)
                        .build();
                    if let Err(e) = self.send(&ack).await {
                        warn!("ACK for outbound {} failed: {}", self.call_id, e);
                    }
                    self.complete();

                    return Some(OutboundEvent::Rejected {
                        status,
                        reason: response.reason(),
                    });
                }
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), DialogError> {
        if self.completed {
            return Ok(());
        }

        let cancel = RequestBuilder::new(SipMethod::Cancel, &self.request_uri, self.ua.advertised())
            .branch(&self.branch)
            .from(&self.from_uri, self.from_tag.as_str())
            .to(&self.to_uri, None)
            .call_id(&self.call_id)
            .cseq(1)
            .build();

        info!("Cancelling outbound {}", self.call_id);
        self.send(&cancel).await
    }
}

impl Drop for UdpOutboundCall {
    fn drop(&mut self) {
        self.ua.outbound().remove(&self.call_id);
    }
}
