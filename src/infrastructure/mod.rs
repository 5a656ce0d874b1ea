//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Media anchors (relay passthrough, local endpoint bridge)
//! - Protocol implementations (SIP, ng control)
//! - Metrics export

pub mod media;
pub mod metrics;
pub mod protocols;
