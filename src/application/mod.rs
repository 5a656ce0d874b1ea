//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases:
//! - Bridging an inbound call to a registered callee
//! - Maintaining the location registry from REGISTER requests

pub mod call_bridge;
pub mod registration;

pub use call_bridge::{CallBridge, CallBridgeConfig};
pub use registration::RegistrationService;
