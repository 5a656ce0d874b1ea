//! UDP transport. One socket serves every dialog; datagrams are parsed
//! on a receive task and queued for the server loop in arrival order.

use super::message::{SipError, SipMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind and start receiving; parsed messages arrive on the returned channel
    pub async fn bind(bind_addr: SocketAddr) -> Result<(Self, mpsc::Receiver<IncomingMessage>), SipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);
        let recv_task = tokio::spawn(Self::receive_loop(socket.clone(), tx));

        Ok((
            Self {
                socket,
                local_addr,
                recv_task,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    // Keep-alives
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if tx.send(IncomingMessage { message, source }).await.is_err() {
                                info!("SIP dispatcher gone, stopping receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Dropping datagram from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("UDP receive failed: {}", e);
                }
            }
        }
    }

    pub async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
        debug!("Sending {} bytes to {} via UDP", data.len(), destination);

        self.socket.send_to(data, destination).await?;
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}
