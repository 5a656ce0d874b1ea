//! SIP message wrappers over `rsip` plus the header helpers the dialogs
//! and the registrar share

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("malformed SIP message: {0}")]
    Parse(String),

    #[error("SIP transport: {0}")]
    Transport(#[from] std::io::Error),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::Parse(err.to_string())
    }
}

/// Methods the bridge acts on; anything else is answered 501
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }
}

impl TryFrom<&Method> for SipMethod {
    type Error = ();

    fn try_from(method: &Method) -> Result<Self, ()> {
        Ok(match method {
            Method::Register => SipMethod::Register,
            Method::Invite => SipMethod::Invite,
            Method::Ack => SipMethod::Ack,
            Method::Cancel => SipMethod::Cancel,
            Method::Bye => SipMethod::Bye,
            Method::Options => SipMethod::Options,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Methods this server understands, for `Allow`
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, OPTIONS, BYE";

/// Compact header forms (RFC 3261 section 7.3.3)
fn compact_name(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "via" => Some("v"),
        "from" => Some("f"),
        "to" => Some("t"),
        "call-id" => Some("i"),
        "contact" => Some("m"),
        "content-type" => Some("c"),
        "content-length" => Some("l"),
        _ => None,
    }
}

/// Values of every header called `name`, in message order
pub fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    let compact = compact_name(name);
    headers
        .iter()
        .filter_map(|header| {
            // rsip renders a header as "Name: value"
            let rendered = header.to_string();
            let (header_name, value) = rendered.split_once(':')?;
            let header_name = header_name.trim();
            let matches = header_name.eq_ignore_ascii_case(name)
                || compact.map(|c| header_name.eq_ignore_ascii_case(c)).unwrap_or(false);
            matches.then(|| value.trim().to_string())
        })
        .collect()
}

pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    header_values(headers, name).into_iter().next()
}

/// Header parameters follow the URI: after `>` for name-addr, after the
/// first `;` for a bare URI
fn header_params(value: &str) -> &str {
    match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value.find(';').map(|idx| &value[idx..]).unwrap_or(""),
    }
}

/// `name` parameter of a From/To/Contact style header value
pub fn header_param(value: &str, name: &str) -> Option<String> {
    header_params(value).split(';').find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_matches('"').to_string())
    })
}

/// URI part of a From/To/Contact style header value
pub fn header_uri(value: &str) -> String {
    let value = value.trim();
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// Host and port a SIP URI points at (port defaults to 5060)
pub fn uri_host_port(uri: &str) -> Option<(String, u16)> {
    let uri = header_uri(uri);
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(&uri);
    let hostport = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    let hostport = hostport.split([';', '?']).next()?;

    let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
        let (host, after) = v6.split_once(']')?;
        (host, after.strip_prefix(':'))
    } else {
        match hostport.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (hostport, None),
        }
    };

    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(port) => port.parse().ok()?,
        None => 5060,
    };
    Some((host.to_string(), port))
}

/// `CSeq` value split into number and method
pub fn parse_cseq(value: &str) -> Option<(u32, String)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = parts.next()?.to_ascii_uppercase();
    Some((seq, method))
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        Ok(Self {
            inner: Request::try_from(data)?,
        })
    }

    /// `None` for methods outside [`SipMethod`]
    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::try_from(&self.inner.method).ok()
    }

    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_value(&self.inner.headers, name)
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).into_owned()
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn from_uri(&self) -> Option<String> {
        self.header("From").map(|v| header_uri(&v))
    }

    pub fn to_uri(&self) -> Option<String> {
        self.header("To").map(|v| header_uri(&v))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| header_param(&v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| header_param(&v, "tag"))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| parse_cseq(&v)).map(|(seq, _)| seq)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
    /// Reason phrase as sent by the peer, or the one we want to send
    reason: Option<String>,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner, reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let inner = Response::try_from(data)?;

        // rsip normalises the reason phrase; keep the one on the wire
        let status_line = data.split(|b| *b == b'\n').next().unwrap_or_default();
        let reason = String::from_utf8_lossy(status_line)
            .trim_end()
            .splitn(3, ' ')
            .nth(2)
            .map(str::to_string);

        Ok(Self { inner, reason })
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    /// Reason phrase, falling back to the standard one for the status
    pub fn reason(&self) -> String {
        if let Some(reason) = &self.reason {
            return reason.clone();
        }
        let rendered = self.inner.status_code.to_string();
        match rendered.split_once(' ') {
            Some((_, reason)) => reason.to_string(),
            None => rendered,
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_value(&self.inner.headers, name)
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).into_owned()
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| header_param(&v, "tag"))
    }

    /// Method named in `CSeq`
    pub fn cseq_method(&self) -> Option<String> {
        self.header("CSeq").and_then(|v| parse_cseq(&v)).map(|(_, method)| method)
    }

    pub fn to_bytes(&self) -> Bytes {
        let rendered = self.inner.to_string();
        let Some(reason) = &self.reason else {
            return Bytes::from(rendered);
        };
        let headers = rendered.split_once("\r\n").map(|(_, rest)| rest).unwrap_or("");
        Bytes::from(format!("SIP/2.0 {} {}\r\n{}", self.status_code(), reason, headers))
    }
}

/// A datagram off the wire
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            SipResponse::parse(data).map(SipMessage::Response)
        } else {
            SipRequest::parse(data).map(SipMessage::Request)
        }
    }
}

/// `Header::Other` shorthand
pub fn other_header(name: &str, value: impl Into<String>) -> Header {
    Header::Other(name.to_string(), value.into())
}
