//! Media Bridge
//!
//! Forwards RTP between two endpoints: whatever arrives on leg A is sent
//! out of leg B's socket to leg B's peer, and the other way round.

use super::stream::RtpEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct MediaBridge {
    leg_a: Arc<RtpEndpoint>,
    leg_b: Arc<RtpEndpoint>,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaBridge {
    /// Start forwarding in both directions
    pub fn start(leg_a: Arc<RtpEndpoint>, leg_b: Arc<RtpEndpoint>) -> Self {
        info!("Bridging RTP endpoints {} <-> {}", leg_a.id(), leg_b.id());

        let tasks = vec![
            tokio::spawn(Self::forward(leg_a.socket(), leg_b.socket(), leg_b.remote_handle())),
            tokio::spawn(Self::forward(leg_b.socket(), leg_a.socket(), leg_a.remote_handle())),
        ];

        Self { leg_a, leg_b, tasks }
    }

    async fn forward(from: Arc<UdpSocket>, to: Arc<UdpSocket>, to_remote: Arc<RwLock<Option<SocketAddr>>>) {
        let mut buf = vec![0u8; 2048];

        loop {
            let len = match from.recv_from(&mut buf).await {
                Ok((len, _)) => len,
                Err(e) => {
                    warn!("RTP receive failed: {}", e);
                    break;
                }
            };

            // Drop packets until the far side's address is known
            let Some(remote) = *to_remote.read().await else {
                continue;
            };

            if let Err(e) = to.send_to(&buf[..len], remote).await {
                debug!("RTP forward to {} failed: {}", remote, e);
            }
        }
    }

    pub fn legs(&self) -> (&Arc<RtpEndpoint>, &Arc<RtpEndpoint>) {
        (&self.leg_a, &self.leg_b)
    }

    /// Stop forwarding
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!("Bridge {} <-> {} stopped", self.leg_a.id(), self.leg_b.id());
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
