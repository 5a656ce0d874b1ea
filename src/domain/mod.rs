//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Value objects shared by every context (AOR, Call-ID, tags)
//! - The location registry
//! - The call state machine and call context
//! - Ports for signaling dialogs and media anchoring

pub mod call;
pub mod media;
pub mod registration;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
