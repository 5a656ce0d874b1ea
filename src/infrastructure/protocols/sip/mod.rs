//! SIP protocol adapter
//!
//! A UDP-only RFC 3261 subset sufficient for a registrar and a
//! back-to-back user agent:
//! ```text
//! ┌─────────────────────────┐
//! │  SipServer (dispatch)   │──► RegisterHandler ──► RegistrationService
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  SipUserAgent           │──► CallBridge via InboundCall / DialogFactory
//! │  (transactions, dialogs)│
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  UdpTransport           │
//! └─────────────────────────┘
//! ```

pub mod builder;
pub mod dialog;
pub mod message;
pub mod register;
pub mod sdp;
pub mod server;
pub mod transport;
pub mod user_agent;

pub use builder::{RequestBuilder, ResponseBuilder};
pub use dialog::{UdpDialog, UdpInboundCall, UdpOutboundCall};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use register::{parse_register, RegisterHandler, RegisterRequest};
pub use sdp::SdpSession;
pub use server::{SipServer, SipServerConfig};
pub use transport::{IncomingMessage, UdpTransport};
pub use user_agent::SipUserAgent;
