//! Media anchoring implementations

pub mod bridge;
pub mod local;
pub mod relay;
pub mod server;
pub mod stream;

pub use bridge::MediaBridge;
pub use local::LocalEndpointBridge;
pub use relay::RelayPassthrough;
pub use server::{EndpointInfo, MediaServer, RtpMediaServer, RtpMediaServerConfig};
pub use stream::RtpEndpoint;
