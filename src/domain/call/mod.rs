//! Call bounded context - state, ownership and failure taxonomy of a bridged call

pub mod context;
pub mod dialog;
pub mod failure;
pub mod state;

pub use context::{CallContext, Leg};
pub use dialog::{
    Dialog, DialogError, DialogFactory, InboundCall, InboundInvite, OutboundCall, OutboundEvent,
    OutboundInvite,
};
pub use failure::CallFailure;
pub use state::{CallEvent, CallState, CallStateMachine, CallStats};
