//! Registration bounded context - where each address of record can be reached

pub mod entity;
pub mod registry;

pub use entity::Registration;
pub use registry::{LocationRegistry, UpsertOutcome};
