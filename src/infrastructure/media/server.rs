//! Local media server
//!
//! Creates RTP endpoints out of a configured port range, learns each
//! endpoint's peer from SDP, and bridges endpoint pairs.

use super::bridge::MediaBridge;
use super::stream::RtpEndpoint;
use crate::domain::media::AnchorError;
use crate::domain::shared::EndpointId;
use crate::infrastructure::protocols::sip::SdpSession;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A freshly created endpoint and the SDP that describes it
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub local_sdp: String,
}

/// Media endpoint provider
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Create an endpoint; `remote_sdp` is the peer's description when known
    async fn create_endpoint(&self, remote_sdp: Option<&str>) -> Result<EndpointInfo, AnchorError>;

    /// Apply the peer's description to an existing endpoint
    async fn modify_endpoint(&self, id: EndpointId, remote_sdp: &str) -> Result<(), AnchorError>;

    /// Forward media between two endpoints
    async fn bridge(&self, a: EndpointId, b: EndpointId) -> Result<(), AnchorError>;

    /// Tear an endpoint down, unbridging it first. Unknown ids are ignored.
    async fn destroy_endpoint(&self, id: EndpointId);
}

#[derive(Debug, Clone)]
pub struct RtpMediaServerConfig {
    pub bind_ip: IpAddr,
    pub advertise_ip: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
}

impl Default for RtpMediaServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            advertise_ip: IpAddr::from([127, 0, 0, 1]),
            port_min: 20000,
            port_max: 30000,
        }
    }
}

/// Endpoint provider backed by local UDP sockets
pub struct RtpMediaServer {
    config: RtpMediaServerConfig,
    ports_in_use: Mutex<HashSet<u16>>,
    endpoints: DashMap<EndpointId, Arc<RtpEndpoint>>,
    /// Bridges are indexed under both of their endpoints
    bridges: DashMap<EndpointId, Arc<MediaBridge>>,
}

impl RtpMediaServer {
    pub fn new(config: RtpMediaServerConfig) -> Self {
        info!(
            "RTP media server: ports {}-{}, advertising {}",
            config.port_min, config.port_max, config.advertise_ip
        );
        Self {
            config,
            ports_in_use: Mutex::new(HashSet::new()),
            endpoints: DashMap::new(),
            bridges: DashMap::new(),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<Arc<RtpEndpoint>> {
        self.endpoints.get(&id).map(|e| e.clone())
    }

    /// Bind the first free even port in range
    async fn allocate(&self) -> Result<RtpEndpoint, AnchorError> {
        let mut in_use = self.ports_in_use.lock().await;
        let start = self.config.port_min.saturating_add(self.config.port_min % 2);

        for port in (start..=self.config.port_max).step_by(2) {
            if in_use.contains(&port) {
                continue;
            }
            match RtpEndpoint::bind(self.config.bind_ip, port, self.config.advertise_ip).await {
                Ok(endpoint) => {
                    in_use.insert(port);
                    return Ok(endpoint);
                }
                Err(e) => debug!("RTP port {} unavailable: {}", port, e),
            }
        }

        Err(AnchorError::Endpoint(format!(
            "no free RTP port in {}-{}",
            self.config.port_min, self.config.port_max
        )))
    }

    fn remote_of(remote_sdp: &str) -> Result<SocketAddr, AnchorError> {
        SdpSession::parse(remote_sdp)
            .and_then(|sdp| sdp.audio_endpoint())
            .ok_or_else(|| AnchorError::InvalidSdp("no usable audio stream".to_string()))
    }
}

#[async_trait]
impl MediaServer for RtpMediaServer {
    async fn create_endpoint(&self, remote_sdp: Option<&str>) -> Result<EndpointInfo, AnchorError> {
        let remote = remote_sdp.map(Self::remote_of).transpose()?;

        let endpoint = self.allocate().await?;
        if let Some(remote) = remote {
            endpoint.set_remote(remote).await;
        }

        let info = EndpointInfo {
            id: endpoint.id(),
            local_sdp: endpoint.local_sdp(),
        };
        self.endpoints.insert(info.id, Arc::new(endpoint));
        Ok(info)
    }

    async fn modify_endpoint(&self, id: EndpointId, remote_sdp: &str) -> Result<(), AnchorError> {
        let remote = Self::remote_of(remote_sdp)?;
        let endpoint = self
            .endpoint(id)
            .ok_or_else(|| AnchorError::Endpoint(format!("unknown endpoint {}", id)))?;
        endpoint.set_remote(remote).await;
        Ok(())
    }

    async fn bridge(&self, a: EndpointId, b: EndpointId) -> Result<(), AnchorError> {
        let (Some(leg_a), Some(leg_b)) = (self.endpoint(a), self.endpoint(b)) else {
            return Err(AnchorError::Endpoint(format!("cannot bridge {} and {}", a, b)));
        };

        let bridge = Arc::new(MediaBridge::start(leg_a, leg_b));
        self.bridges.insert(a, bridge.clone());
        self.bridges.insert(b, bridge);
        Ok(())
    }

    async fn destroy_endpoint(&self, id: EndpointId) {
        if let Some((_, bridge)) = self.bridges.remove(&id) {
            bridge.stop();
            let (leg_a, leg_b) = bridge.legs();
            let other = if leg_a.id() == id { leg_b.id() } else { leg_a.id() };
            self.bridges.remove(&other);
        }

        match self.endpoints.remove(&id) {
            Some((_, endpoint)) => {
                self.ports_in_use.lock().await.remove(&endpoint.local_port());
                debug!("RTP endpoint {} destroyed", id);
            }
            None => warn!("Destroy of unknown RTP endpoint {}", id),
        }
    }
}
