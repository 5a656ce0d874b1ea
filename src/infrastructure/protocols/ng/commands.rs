//! ng control protocol messages
//!
//! Packets are `<cookie> <bencoded dictionary>`. Replies echo the cookie of
//! the request they answer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay I/O error: {0}")]
    Io(String),

    #[error("relay did not reply within {0:?}")]
    Timeout(std::time::Duration),

    #[error("relay refused the command: {0}")]
    Rejected(String),

    #[error("malformed relay message: {0}")]
    Codec(String),

    #[error("relay client closed")]
    Closed,
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

impl From<serde_bencode::Error> for RelayError {
    fn from(err: serde_bencode::Error) -> Self {
        RelayError::Codec(err.to_string())
    }
}

/// Value of the `ICE` flag that strips candidates from the rewritten SDP
pub const ICE_REMOVE: &str = "remove";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(tag = "command")]
pub enum NgCommand {
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "offer")]
    Offer {
        sdp: String,
        #[serde(rename = "call-id")]
        call_id: String,
        #[serde(rename = "from-tag")]
        from_tag: String,
        #[serde(rename = "ICE", default, skip_serializing_if = "Option::is_none")]
        ice: Option<String>,
    },

    #[serde(rename = "answer")]
    Answer {
        sdp: String,
        #[serde(rename = "call-id")]
        call_id: String,
        #[serde(rename = "from-tag")]
        from_tag: String,
        #[serde(rename = "to-tag")]
        to_tag: String,
        #[serde(rename = "ICE", default, skip_serializing_if = "Option::is_none")]
        ice: Option<String>,
    },

    #[serde(rename = "delete")]
    Delete {
        #[serde(rename = "call-id")]
        call_id: String,
        #[serde(rename = "from-tag")]
        from_tag: String,
        #[serde(rename = "to-tag", default, skip_serializing_if = "Option::is_none")]
        to_tag: Option<String>,
    },
}

impl NgCommand {
    pub fn name(&self) -> &'static str {
        match self {
            NgCommand::Ping => "ping",
            NgCommand::Offer { .. } => "offer",
            NgCommand::Answer { .. } => "answer",
            NgCommand::Delete { .. } => "delete",
        }
    }
}

/// Reply dictionary. `result` is `ok`, `pong`, `error` or a relay specific
/// refusal such as `load limit`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct NgResult {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(rename = "error-reason", default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl NgResult {
    pub fn ok() -> Self {
        Self { result: "ok".to_string(), ..Default::default() }
    }

    pub fn ok_with_sdp(sdp: impl Into<String>) -> Self {
        Self { result: "ok".to_string(), sdp: Some(sdp.into()), ..Default::default() }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            result: "error".to_string(),
            error_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == "ok" || self.result == "pong"
    }

    /// Turn a refusal into an error
    pub fn into_success(self) -> Result<Self, RelayError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RelayError::Rejected(
                self.error_reason.unwrap_or_else(|| self.result.clone()),
            ))
        }
    }

    /// Rewritten SDP of an offer or answer reply
    pub fn into_sdp(self) -> Result<String, RelayError> {
        self.into_success()?
            .sdp
            .ok_or_else(|| RelayError::Codec("reply carries no sdp".to_string()))
    }
}

/// Frame `command` for the wire
pub fn encode_request(cookie: &str, command: &NgCommand) -> Result<Vec<u8>, RelayError> {
    let body = serde_bencode::to_bytes(command)?;
    let mut packet = Vec::with_capacity(cookie.len() + 1 + body.len());
    packet.extend_from_slice(cookie.as_bytes());
    packet.push(b' ');
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Frame `result` as a reply
pub fn encode_reply(cookie: &str, result: &NgResult) -> Result<Vec<u8>, RelayError> {
    let body = serde_bencode::to_bytes(result)?;
    let mut packet = Vec::with_capacity(cookie.len() + 1 + body.len());
    packet.extend_from_slice(cookie.as_bytes());
    packet.push(b' ');
    packet.extend_from_slice(&body);
    Ok(packet)
}

fn split_cookie(packet: &[u8]) -> Result<(String, &[u8]), RelayError> {
    let idx = packet
        .iter()
        .position(|b| *b == b' ')
        .ok_or_else(|| RelayError::Codec("missing cookie".to_string()))?;
    let cookie = std::str::from_utf8(&packet[..idx])
        .map_err(|e| RelayError::Codec(e.to_string()))?
        .to_string();
    Ok((cookie, &packet[idx + 1..]))
}

pub fn decode_request(packet: &[u8]) -> Result<(String, NgCommand), RelayError> {
    let (cookie, body) = split_cookie(packet)?;
    Ok((cookie, serde_bencode::from_bytes(body)?))
}

pub fn decode_reply(packet: &[u8]) -> Result<(String, NgResult), RelayError> {
    let (cookie, body) = split_cookie(packet)?;
    Ok((cookie, serde_bencode::from_bytes(body)?))
}
