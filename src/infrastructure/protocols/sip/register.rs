//! REGISTER handling
//!
//! Validates a REGISTER before it touches the location registry. The expiry
//! comes from the contact's `expires` parameter, else the `Expires` header;
//! with neither present the request is refused rather than defaulted.

use super::builder::{allow_header, ResponseBuilder};
use super::message::{header_param, header_uri, SipError, SipRequest, SipResponse};
use crate::application::RegistrationService;
use crate::domain::registration::UpsertOutcome;
use crate::domain::shared::{Aor, DomainError};
use rsip::Header;
use tracing::{info, warn};

/// A REGISTER that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub aor: Aor,
    /// Contact URI, or `*` for a remove-all
    pub contact: String,
    pub expires: u32,
}

impl RegisterRequest {
    pub fn is_wildcard(&self) -> bool {
        self.contact == "*"
    }
}

fn invalid(msg: impl Into<String>) -> DomainError {
    DomainError::ValidationError(msg.into())
}

fn parse_expires(value: &str) -> Result<u32, DomainError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| invalid(format!("unparsable expiry {:?}", value)))
}

/// Extract and validate the registration carried by a REGISTER
pub fn parse_register(request: &SipRequest) -> Result<RegisterRequest, DomainError> {
    let to_uri = request.to_uri().ok_or_else(|| invalid("missing To header"))?;
    let aor = Aor::from_uri(&to_uri)?;

    let contact = request
        .header("Contact")
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| invalid("missing Contact header"))?;

    let header_expires = request.header("Expires");

    if contact.trim() == "*" {
        // RFC 3261 10.2.2: a wildcard is only valid with Expires: 0
        let expires = header_expires
            .as_deref()
            .map(parse_expires)
            .transpose()?
            .ok_or_else(|| invalid("wildcard contact without Expires"))?;
        if expires != 0 {
            return Err(invalid("wildcard contact requires Expires: 0"));
        }
        return Ok(RegisterRequest {
            aor,
            contact: "*".to_string(),
            expires: 0,
        });
    }

    let expires = match (header_param(&contact, "expires"), header_expires) {
        (Some(param), _) => parse_expires(&param)?,
        (None, Some(header)) => parse_expires(&header)?,
        (None, None) => return Err(invalid("no contact expires parameter and no Expires header")),
    };

    let contact_uri = header_uri(&contact);
    if contact_uri.is_empty() {
        return Err(invalid("empty Contact URI"));
    }

    Ok(RegisterRequest {
        aor,
        contact: contact_uri,
        expires,
    })
}

/// Turns REGISTER requests into registry updates and responses
#[derive(Clone)]
pub struct RegisterHandler {
    service: RegistrationService,
}

impl RegisterHandler {
    pub fn new(service: RegistrationService) -> Self {
        Self { service }
    }

    pub async fn handle(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let register = match parse_register(request) {
            Ok(register) => register,
            Err(e) => {
                warn!("Rejecting REGISTER: {}", e);
                return ResponseBuilder::bad_request("Bad Request").build_for_request(request);
            }
        };

        let granted = register.expires.min(self.service.max_expires());
        let outcome = self
            .service
            .on_register(register.aor.clone(), &register.contact, register.expires)
            .await;

        match outcome {
            Ok(UpsertOutcome::Registered(registration)) => ResponseBuilder::ok()
                .header(Header::Contact(
                    format!("<{}>;expires={}", registration.contact, granted).into(),
                ))
                .header(allow_header())
                .build_for_request(request),
            Ok(UpsertOutcome::Unregistered { existed }) => {
                info!("{} unregistered (binding existed: {})", register.aor, existed);
                ResponseBuilder::ok().header(allow_header()).build_for_request(request)
            }
            Err(DomainError::ValidationError(msg)) => {
                warn!("Rejecting REGISTER for {}: {}", register.aor, msg);
                ResponseBuilder::bad_request("Bad Request").build_for_request(request)
            }
            Err(e) => {
                warn!("REGISTER for {} failed: {}", register.aor, e);
                ResponseBuilder::server_internal_error().build_for_request(request)
            }
        }
    }
}
