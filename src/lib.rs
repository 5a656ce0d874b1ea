//! sipbridge - SIP registrar and back-to-back call bridge
//!
//! Callers register their contacts, and an INVITE to a registered address
//! is bridged to that contact with media anchored either through an
//! external relay or on local RTP endpoints.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
