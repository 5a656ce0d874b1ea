//! ng control protocol (media relay offer/answer/delete)

pub mod client;
pub mod commands;

pub use client::{NgClient, RelayControl};
pub use commands::{NgCommand, NgResult, RelayError};

#[cfg(test)]
pub use client::MockRelayControl;
