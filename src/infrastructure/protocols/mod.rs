//! Wire protocols: SIP signaling and the relay's ng control protocol

pub mod ng;
pub mod sip;
