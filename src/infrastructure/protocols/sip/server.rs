//! SIP server
//!
//! Single dispatch loop over the UDP transport. Messages are handled in
//! arrival order so a CANCEL or BYE never overtakes the request it refers
//! to; each INVITE is handed to the call bridge on its own task.

use super::builder::{allow_header, ResponseBuilder};
use super::message::{SipError, SipMessage, SipMethod, SipRequest};
use super::register::RegisterHandler;
use super::transport::{IncomingMessage, UdpTransport};
use super::user_agent::SipUserAgent;
use crate::application::{CallBridge, RegistrationService};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// SIP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipServerConfig {
    pub bind: SocketAddr,
    /// Host put in Via and Contact; derived from `bind` when unset
    pub advertised_host: Option<String>,
    pub domain: String,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5060)),
            advertised_host: None,
            domain: "localhost".to_string(),
        }
    }
}

/// SIP server
pub struct SipServer {
    ua: Arc<SipUserAgent>,
    rx: mpsc::Receiver<IncomingMessage>,
    register: RegisterHandler,
}

impl SipServer {
    /// Bind the transport. Calls are only served once [`SipServer::run`] is
    /// given a bridge, which in turn needs [`SipServer::user_agent`].
    pub async fn bind(config: &SipServerConfig, registration: RegistrationService) -> Result<Self, SipError> {
        info!("Starting SIP server for domain {}", config.domain);

        let (transport, rx) = UdpTransport::bind(config.bind).await?;
        let local = transport.local_addr();
        let host = match &config.advertised_host {
            Some(host) => host.clone(),
            None if local.ip().is_unspecified() => "127.0.0.1".to_string(),
            None => local.ip().to_string(),
        };
        let advertised = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, local.port())
        } else {
            format!("{}:{}", host, local.port())
        };

        Ok(Self {
            ua: SipUserAgent::new(Arc::new(transport), advertised),
            rx,
            register: RegisterHandler::new(registration),
        })
    }

    pub fn user_agent(&self) -> Arc<SipUserAgent> {
        self.ua.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ua.transport().local_addr()
    }

    pub fn spawn(self, bridge: Arc<CallBridge>) -> JoinHandle<()> {
        tokio::spawn(self.run(bridge))
    }

    pub async fn run(mut self, bridge: Arc<CallBridge>) {
        info!("SIP server listening on {}", self.local_addr());

        while let Some(incoming) = self.rx.recv().await {
            match incoming.message {
                SipMessage::Request(request) => {
                    self.handle_request(&bridge, request, incoming.source).await;
                }
                SipMessage::Response(response) => {
                    debug!("Received SIP response: {}", response.status_code());
                    self.ua.route_response(response).await;
                }
            }
        }

        info!("SIP server stopped");
    }

    async fn handle_request(&self, bridge: &Arc<CallBridge>, request: SipRequest, source: SocketAddr) {
        debug!("Processing {} from {}", request.method_name(), source);

        match request.method() {
            Some(SipMethod::Register) => match self.register.handle(&request).await {
                Ok(response) => self.ua.send_response(&response, source).await,
                Err(e) => warn!("REGISTER from {} failed: {}", source, e),
            },
            Some(SipMethod::Options) => {
                self.reply(&request, source, ResponseBuilder::ok().header(allow_header())).await;
            }
            Some(SipMethod::Invite) => self.handle_invite(bridge, request, source).await,
            Some(SipMethod::Cancel) => {
                let pending = request
                    .call_id()
                    .filter(|call_id| self.ua.has_pending_invite(call_id));
                match pending {
                    Some(call_id) => {
                        // 200 for the CANCEL goes out before the INVITE's 487
                        self.reply(&request, source, ResponseBuilder::ok()).await;
                        self.ua.cancel_inbound(&call_id);
                    }
                    None => {
                        self.reply(&request, source, ResponseBuilder::call_does_not_exist()).await;
                    }
                }
            }
            Some(SipMethod::Bye) => {
                let found = request
                    .call_id()
                    .map(|call_id| self.ua.remote_bye(&call_id))
                    .unwrap_or(false);
                let builder = if found {
                    ResponseBuilder::ok()
                } else {
                    ResponseBuilder::call_does_not_exist()
                };
                self.reply(&request, source, builder).await;
            }
            // ACK carries no response
            Some(SipMethod::Ack) => debug!("ACK for {:?}", request.call_id()),
            None => {
                warn!("Unsupported method {} from {}", request.method_name(), source);
                self.reply(&request, source, ResponseBuilder::not_implemented()).await;
            }
        }
    }

    async fn handle_invite(&self, bridge: &Arc<CallBridge>, request: SipRequest, source: SocketAddr) {
        if request.to_tag().is_some() {
            // Session modification is not offered
            warn!("Rejecting re-INVITE for {:?}", request.call_id());
            self.reply(&request, source, ResponseBuilder::new(488)).await;
            return;
        }

        match self.ua.accept_invite(&request, source) {
            Ok(Some(call)) => {
                self.ua.send_trying(&request, source).await;
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    // Failures are answered and logged by the bridge
                    let _ = bridge.handle_invite(Box::new(call)).await;
                });
            }
            Ok(None) => {
                debug!("INVITE retransmission for {:?}", request.call_id());
                self.ua.send_trying(&request, source).await;
            }
            Err(e) => {
                warn!("Malformed INVITE from {}: {}", source, e);
                self.reply(&request, source, ResponseBuilder::bad_request("Bad Request")).await;
            }
        }
    }

    async fn reply(&self, request: &SipRequest, source: SocketAddr, builder: ResponseBuilder) {
        match builder.build_for_request(request) {
            Ok(response) => self.ua.send_response(&response, source).await,
            Err(e) => warn!("Failed to build response: {}", e),
        }
    }
}
