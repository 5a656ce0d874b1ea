//! Shared value objects used across the registrar and the call bridge

use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// SIP Call-ID of one signaling leg
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh Call-ID for a leg we originate
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dialog tag (From-tag or To-tag)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(String);

impl Tag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Random 8-hex-digit tag
    pub fn generate() -> Self {
        Self(format!("{:08x}", rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of Record: the user part of a SIP URI.
///
/// `sip:alice@example.com`, `<sips:alice@10.0.0.1:5061;transport=tls>` and
/// `alice` all resolve to the AOR `alice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aor(String);

impl Aor {
    pub fn new(user: impl Into<String>) -> Result<Self, DomainError> {
        let user = user.into();
        if user.is_empty() || user.contains(['@', ':', ';', '<', '>', ' ']) {
            return Err(DomainError::ValidationError(format!(
                "invalid address of record: {:?}",
                user
            )));
        }
        Ok(Self(user))
    }

    /// Extract the AOR from a request URI or header URI
    pub fn from_uri(uri: &str) -> Result<Self, DomainError> {
        let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');
        let user = match uri.strip_prefix("sips:").or_else(|| uri.strip_prefix("sip:")) {
            // A SIP URI without `user@` names a host, not a user
            Some(rest) => match rest.split_once('@') {
                Some((user, _host)) => user,
                None => {
                    return Err(DomainError::ValidationError(format!("no user part in {:?}", uri)));
                }
            },
            None => uri.split([';', '?']).next().unwrap_or_default(),
        };

        // Drop a password component (user:password@host)
        let user = user.split(':').next().unwrap_or_default();
        Self::new(user)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Aor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local media endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aor_from_uri() {
        assert_eq!(Aor::from_uri("sip:alice@example.com").unwrap().as_str(), "alice");
        assert_eq!(
            Aor::from_uri("<sips:bob@10.0.0.1:5061;transport=tls>").unwrap().as_str(),
            "bob"
        );
        assert_eq!(Aor::from_uri("sip:carol:secret@host").unwrap().as_str(), "carol");
        assert_eq!(Aor::from_uri("dave").unwrap().as_str(), "dave");
    }

    #[test]
    fn test_aor_rejects_empty_user() {
        assert!(Aor::from_uri("sip:@example.com").is_err());
        assert!(Aor::from_uri("").is_err());
    }

    #[test]
    fn test_aor_rejects_host_only_uri() {
        let err = Aor::from_uri("sip:example.com").unwrap_err();
        assert!(matches!(err, DomainError::ValidationError(_)));
        assert!(Aor::from_uri("<sips:10.0.0.1:5061;transport=tls>").is_err());
    }

    #[test]
    fn test_generated_tags_differ() {
        let a = Tag::generate();
        let b = Tag::generate();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
    }
}
