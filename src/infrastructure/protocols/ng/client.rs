//! UDP client for the relay's ng control port

use super::commands::{decode_reply, encode_request, NgCommand, NgResult, RelayError, ICE_REMOVE};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Offer/answer/delete against an external media relay
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayControl: Send + Sync {
    /// Register the caller's offer; returns the SDP to send to the callee
    async fn offer(&self, call_id: &str, from_tag: &str, sdp: &str) -> Result<String, RelayError>;

    /// Register the callee's answer; returns the SDP to send to the caller.
    /// `strip_ice` drops ICE candidates from that SDP.
    async fn answer(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        sdp: &str,
        strip_ice: bool,
    ) -> Result<String, RelayError>;

    /// Drop the relay session
    async fn delete(&self, call_id: &str, from_tag: &str, to_tag: Option<String>) -> Result<(), RelayError>;
}

type Pending = Arc<DashMap<String, oneshot::Sender<NgResult>>>;

/// ng client over UDP.
///
/// Requests are matched to replies by cookie; a reply that arrives after
/// its request timed out is dropped.
pub struct NgClient {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    timeout: Duration,
    pending: Pending,
    recv_task: JoinHandle<()>,
}

impl NgClient {
    pub async fn connect(server: SocketAddr, timeout: Duration) -> Result<Self, RelayError> {
        let bind: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        info!("ng client bound to {} for relay {}", socket.local_addr()?, server);

        let pending: Pending = Arc::new(DashMap::new());
        let recv_task = tokio::spawn(Self::receive_loop(socket.clone(), server, pending.clone()));

        Ok(Self {
            socket,
            server,
            timeout,
            pending,
            recv_task,
        })
    }

    async fn receive_loop(socket: Arc<UdpSocket>, server: SocketAddr, pending: Pending) {
        let mut buf = vec![0u8; 65535];

        loop {
            let (size, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("ng client receive failed: {}", e);
                    break;
                }
            };

            if source != server {
                warn!("Ignoring ng packet from unexpected peer {}", source);
                continue;
            }

            match decode_reply(&buf[..size]) {
                Ok((cookie, result)) => match pending.remove(&cookie) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("No pending ng request for cookie {}", cookie),
                },
                Err(e) => warn!("Malformed ng reply from {}: {}", source, e),
            }
        }
    }

    /// Send one command and wait for its reply
    pub async fn request(&self, command: NgCommand) -> Result<NgResult, RelayError> {
        let cookie = uuid::Uuid::new_v4().simple().to_string();
        let packet = encode_request(&cookie, &command)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(cookie.clone(), tx);

        debug!("ng {} -> {} (cookie {})", command.name(), self.server, cookie);
        if let Err(e) = self.socket.send_to(&packet, self.server).await {
            self.pending.remove(&cookie);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.pending.remove(&cookie);
                warn!("ng {} timed out after {:?}", command.name(), self.timeout);
                Err(RelayError::Timeout(self.timeout))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), RelayError> {
        self.request(NgCommand::Ping).await?.into_success().map(|_| ())
    }
}

impl Drop for NgClient {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

fn ice_flag(strip_ice: bool) -> Option<String> {
    strip_ice.then(|| ICE_REMOVE.to_string())
}

#[async_trait]
impl RelayControl for NgClient {
    async fn offer(&self, call_id: &str, from_tag: &str, sdp: &str) -> Result<String, RelayError> {
        self.request(NgCommand::Offer {
            sdp: sdp.to_string(),
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            ice: None,
        })
        .await?
        .into_sdp()
    }

    async fn answer(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        sdp: &str,
        strip_ice: bool,
    ) -> Result<String, RelayError> {
        self.request(NgCommand::Answer {
            sdp: sdp.to_string(),
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            to_tag: to_tag.to_string(),
            ice: ice_flag(strip_ice),
        })
        .await?
        .into_sdp()
    }

    async fn delete(&self, call_id: &str, from_tag: &str, to_tag: Option<String>) -> Result<(), RelayError> {
        self.request(NgCommand::Delete {
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            to_tag,
        })
        .await?
        .into_success()
        .map(|_| ())
    }
}
