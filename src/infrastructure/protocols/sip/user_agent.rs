//! SIP user agent
//!
//! Owns the routing tables shared by the server loop and the dialogs:
//! pending inbound INVITEs, outbound INVITE transactions and confirmed
//! dialogs, all keyed by Call-ID. Originates the callee leg of a call.

use super::builder::{RequestBuilder, ResponseBuilder};
use super::dialog::{PendingInvite, UdpDialog, UdpInboundCall, UdpOutboundCall};
use super::message::{header_uri, uri_host_port, SipMethod, SipRequest, SipResponse};
use super::transport::UdpTransport;
use crate::domain::call::{DialogError, DialogFactory, InboundInvite, OutboundCall, OutboundInvite};
use crate::domain::shared::{CallId, Tag};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SipUserAgent {
    me: Weak<SipUserAgent>,
    transport: Arc<UdpTransport>,
    /// `host:port` put in Via and Contact
    advertised: String,
    inbound: DashMap<String, Arc<PendingInvite>>,
    outbound: DashMap<String, mpsc::UnboundedSender<SipResponse>>,
    dialogs: DashMap<String, Arc<UdpDialog>>,
}

impl SipUserAgent {
    pub fn new(transport: Arc<UdpTransport>, advertised: impl Into<String>) -> Arc<Self> {
        let advertised = advertised.into();
        info!("SIP user agent advertising {}", advertised);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            advertised,
            inbound: DashMap::new(),
            outbound: DashMap::new(),
            dialogs: DashMap::new(),
        })
    }

    pub fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    pub fn advertised(&self) -> &str {
        &self.advertised
    }

    pub fn contact_uri(&self) -> String {
        format!("sip:sipbridge@{}", self.advertised)
    }

    pub(crate) fn inbound(&self) -> &DashMap<String, Arc<PendingInvite>> {
        &self.inbound
    }

    pub(crate) fn outbound(&self) -> &DashMap<String, mpsc::UnboundedSender<SipResponse>> {
        &self.outbound
    }

    pub(crate) fn dialogs(&self) -> &DashMap<String, Arc<UdpDialog>> {
        &self.dialogs
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn pending_invite_count(&self) -> usize {
        self.inbound.len()
    }

    pub async fn send_response(&self, response: &SipResponse, destination: SocketAddr) {
        if let Err(e) = self.transport.send(&response.to_bytes(), destination).await {
            warn!("Failed to send {} to {}: {}", response.status_code(), destination, e);
        }
    }

    /// Open the server side of a new INVITE.
    ///
    /// Returns `None` when the Call-ID already has a pending transaction or
    /// a dialog (a retransmission).
    pub fn accept_invite(
        &self,
        request: &SipRequest,
        source: SocketAddr,
    ) -> Result<Option<UdpInboundCall>, DialogError> {
        let ua = self.me.upgrade().ok_or(DialogError::Terminated)?;

        let call_id = request
            .call_id()
            .ok_or_else(|| DialogError::InvalidTarget("INVITE without Call-ID".to_string()))?;
        let from_tag = request
            .from_tag()
            .ok_or_else(|| DialogError::InvalidTarget("INVITE without From tag".to_string()))?;
        let from_uri = request
            .from_uri()
            .ok_or_else(|| DialogError::InvalidTarget("INVITE without From".to_string()))?;

        if self.inbound.contains_key(&call_id) || self.dialogs.contains_key(&call_id) {
            return Ok(None);
        }

        let pending = Arc::new(PendingInvite::new(request.clone(), source));
        self.inbound.insert(call_id.clone(), pending.clone());

        let invite = InboundInvite {
            call_id: CallId::new(call_id),
            from_tag: Tag::new(from_tag),
            from_uri,
            request_uri: request.uri().to_string(),
            offer_sdp: request.body_str(),
        };
        Ok(Some(UdpInboundCall::new(ua, invite, pending)))
    }

    pub fn has_pending_invite(&self, call_id: &str) -> bool {
        self.inbound.contains_key(call_id)
    }

    /// Raise the cancellation signal of a pending INVITE
    pub fn cancel_inbound(&self, call_id: &str) -> bool {
        match self.inbound.get(call_id).map(|p| p.clone()) {
            Some(pending) => {
                pending.cancel();
                true
            }
            None => false,
        }
    }

    /// Peer hung up; false for an unknown dialog
    pub fn remote_bye(&self, call_id: &str) -> bool {
        match self.dialogs.remove(call_id) {
            Some((_, dialog)) => {
                dialog.on_remote_bye();
                true
            }
            None => false,
        }
    }

    /// Hand a response to the outbound transaction it belongs to
    pub async fn route_response(&self, response: SipResponse) {
        let Some(call_id) = response.call_id() else {
            debug!("Dropping response without Call-ID");
            return;
        };

        let sender = self.outbound.get(&call_id).map(|tx| tx.clone());
        if let Some(tx) = sender {
            if tx.send(response).is_err() {
                debug!("Outbound transaction {} already gone", call_id);
            }
            return;
        }

        let is_invite_2xx = (200..300).contains(&response.status_code())
            && response.cseq_method().as_deref() == Some(SipMethod::Invite.as_str());
        let dialog = self.dialogs.get(&call_id).map(|d| d.clone());
        match dialog {
            Some(dialog) if is_invite_2xx => dialog.retransmit_ack().await,
            _ => debug!(
                "Unmatched {} response for {} ({:?})",
                response.status_code(),
                call_id,
                response.cseq_method()
            ),
        }
    }

    /// 100 Trying for an INVITE
    pub async fn send_trying(&self, request: &SipRequest, source: SocketAddr) {
        match ResponseBuilder::trying().build_for_request(request) {
            Ok(response) => self.send_response(&response, source).await,
            Err(e) => warn!("Failed to build 100 Trying: {}", e),
        }
    }
}

#[async_trait]
impl DialogFactory for SipUserAgent {
    async fn invite(&self, request: OutboundInvite) -> Result<Box<dyn OutboundCall>, DialogError> {
        let ua = self.me.upgrade().ok_or(DialogError::Terminated)?;

        let invalid = || DialogError::InvalidTarget(request.target.clone());
        let (host, port) = uri_host_port(&request.target).ok_or_else(invalid)?;
        let destination = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|_| invalid())?
            .next()
            .ok_or_else(invalid)?;

        let call_id = CallId::generate().to_string();
        let from_tag = Tag::generate();
        let request_uri = header_uri(&request.target);

        let invite = RequestBuilder::new(SipMethod::Invite, &request_uri, &self.advertised)
            .from(&request.from_uri, from_tag.as_str())
            .to(&request.to_uri, None)
            .call_id(&call_id)
            .contact(&self.contact_uri())
            .sdp(request.offer_sdp.clone());
        let branch = invite.branch_id().to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.insert(call_id.clone(), tx);

        if let Err(e) = self.transport.send(&invite.build(), destination).await {
            self.outbound.remove(&call_id);
            return Err(DialogError::Transport(e.to_string()));
        }

        info!("Sent INVITE {} to {} ({})", call_id, request_uri, destination);
        Ok(Box::new(UdpOutboundCall::new(
            ua,
            call_id,
            request.from_uri,
            from_tag,
            request.to_uri,
            request_uri,
            destination,
            branch,
            rx,
        )))
    }
}
