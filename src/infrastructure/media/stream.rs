//! RTP endpoint
//!
//! One local UDP socket that a single peer sends RTP to. The endpoint does
//! not look inside packets; a [`MediaBridge`](super::bridge::MediaBridge)
//! moves them to the other leg.

use crate::domain::shared::EndpointId;
use crate::infrastructure::protocols::sip::SdpSession;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct RtpEndpoint {
    id: EndpointId,
    socket: Arc<UdpSocket>,
    local_port: u16,
    advertise_ip: IpAddr,
    /// Where the peer said it receives RTP
    remote: Arc<RwLock<Option<SocketAddr>>>,
}

impl RtpEndpoint {
    /// Bind a new endpoint on `bind_ip:port`
    pub async fn bind(bind_ip: IpAddr, port: u16, advertise_ip: IpAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, port)).await?;
        let local_port = socket.local_addr()?.port();
        let id = EndpointId::new();
        info!("RTP endpoint {} bound to {}:{}", id, bind_ip, local_port);

        Ok(Self {
            id,
            socket: Arc::new(socket),
            local_port,
            advertise_ip,
            remote: Arc::new(RwLock::new(None)),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// SDP describing this endpoint, advertised to the peer
    pub fn local_sdp(&self) -> String {
        SdpSession::create_audio_session(self.advertise_ip, self.local_port).to_string()
    }

    pub async fn set_remote(&self, addr: SocketAddr) {
        *self.remote.write().await = Some(addr);
        debug!("RTP endpoint {} remote set to {}", self.id, addr);
    }

    pub async fn remote(&self) -> Option<SocketAddr> {
        *self.remote.read().await
    }

    /// Shared view of the remote address, read by forwarding tasks
    pub(crate) fn remote_handle(&self) -> Arc<RwLock<Option<SocketAddr>>> {
        self.remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_sdp_advertises_port() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let endpoint = RtpEndpoint::bind(ip, 0, "203.0.113.7".parse().unwrap()).await.unwrap();

        let sdp = SdpSession::parse(&endpoint.local_sdp()).unwrap();
        assert_eq!(
            sdp.audio_endpoint(),
            Some(SocketAddr::new("203.0.113.7".parse().unwrap(), endpoint.local_port()))
        );
    }

    #[tokio::test]
    async fn test_set_remote() {
        let endpoint = RtpEndpoint::bind("127.0.0.1".parse().unwrap(), 0, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert!(endpoint.remote().await.is_none());

        let addr: SocketAddr = "127.0.0.1:20000".parse().unwrap();
        endpoint.set_remote(addr).await;
        assert_eq!(endpoint.remote().await, Some(addr));
    }
}
