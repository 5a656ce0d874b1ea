//! SIP message builder utilities

use super::message::{header_param, other_header, SipError, SipMethod, SipRequest, SipResponse};
use bytes::Bytes;
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(400).reason(reason)
    }

    pub fn call_does_not_exist() -> Self {
        Self::new(481)
    }

    pub fn not_implemented() -> Self {
        Self::new(501)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    /// Send this reason phrase instead of the standard one
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Tag the `To` header unless the request already carries a to-tag
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// SDP body
    pub fn sdp(mut self, sdp: &str) -> Self {
        self.headers.push(Header::ContentType("application/sdp".into()));
        self.body = sdp.as_bytes().to_vec();
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::with_capacity(self.headers.len() + 6);

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(_) => headers.push(self.tagged_to(header)),
                _ => {}
            }
        }
        headers.extend(self.headers);

        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        let response = SipResponse::new(response);
        Ok(match self.reason {
            Some(reason) => response.with_reason(reason),
            None => response,
        })
    }

    fn tagged_to(&self, header: &Header) -> Header {
        let Some(tag) = &self.to_tag else {
            return header.clone();
        };

        let rendered = header.to_string();
        let value = rendered.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
        if header_param(value, "tag").is_some() {
            return header.clone();
        }
        Header::To(format!("{};tag={}", value, tag).into())
    }
}

/// Build an outgoing SIP request as wire text
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: SipMethod,
    request_uri: String,
    via: String,
    branch: String,
    from: String,
    to: String,
    call_id: String,
    cseq: u32,
    contact: Option<String>,
    body: Option<String>,
}

impl RequestBuilder {
    /// `via` is the sent-by `host:port`
    pub fn new(method: SipMethod, request_uri: impl Into<String>, via: impl Into<String>) -> Self {
        Self {
            method,
            request_uri: request_uri.into(),
            via: via.into(),
            branch: new_branch(),
            from: String::new(),
            to: String::new(),
            call_id: String::new(),
            cseq: 1,
            contact: None,
            body: None,
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn from(mut self, uri: &str, tag: &str) -> Self {
        self.from = format!("<{}>;tag={}", uri, tag);
        self
    }

    pub fn to(mut self, uri: &str, tag: Option<&str>) -> Self {
        self.to = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.contact = Some(format!("<{}>", uri));
        self
    }

    pub fn sdp(mut self, sdp: impl Into<String>) -> Self {
        self.body = Some(sdp.into());
        self
    }

    pub fn branch_id(&self) -> &str {
        &self.branch
    }

    pub fn build(&self) -> Bytes {
        let mut msg = format!(
            "{method} {uri} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {via};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             From: {from}\r\n\
             To: {to}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n",
            method = self.method,
            uri = self.request_uri,
            via = self.via,
            branch = self.branch,
            from = self.from,
            to = self.to,
            call_id = self.call_id,
            cseq = self.cseq,
        );

        if let Some(contact) = &self.contact {
            msg.push_str(&format!("Contact: {}\r\n", contact));
        }
        if self.method == SipMethod::Invite {
            msg.push_str(&format!("Allow: {}\r\n", super::message::ALLOWED_METHODS));
        }
        match &self.body {
            Some(body) => {
                msg.push_str("Content-Type: application/sdp\r\n");
                msg.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                msg.push_str(body);
            }
            None => msg.push_str("Content-Length: 0\r\n\r\n"),
        }

        Bytes::from(msg)
    }
}

/// RFC 3261 branch with the magic cookie
pub fn new_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

/// `Allow` header listing supported methods
pub fn allow_header() -> Header {
    other_header("Allow", super::message::ALLOWED_METHODS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        let data = b"INVITE sip:bob@example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc\r\n\
                     From: <sip:alice@example.com>;tag=from1\r\n\
                     To: <sip:bob@example.com>\r\n\
                     Call-ID: call-1@10.0.0.1\r\n\
                     CSeq: 1 INVITE\r\n\
                     Content-Length: 0\r\n\r\n";
        SipRequest::parse(data).unwrap()
    }

    #[test]
    fn test_response_copies_dialog_headers_and_tags_to() {
        let response = ResponseBuilder::new(180)
            .to_tag("local1")
            .build_for_request(&invite())
            .unwrap();

        let parsed = SipResponse::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed.status_code(), 180);
        assert_eq!(parsed.call_id(), Some("call-1@10.0.0.1".to_string()));
        assert_eq!(parsed.to_tag(), Some("local1".to_string()));
        assert_eq!(parsed.cseq_method(), Some("INVITE".to_string()));
    }

    #[test]
    fn test_response_reason_is_sent_verbatim() {
        let response = ResponseBuilder::new(486)
            .reason("Gone Fishing")
            .build_for_request(&invite())
            .unwrap();

        let bytes = response.to_bytes();
        assert!(bytes.starts_with(b"SIP/2.0 486 Gone Fishing\r\n"));
        assert_eq!(SipResponse::parse(&bytes).unwrap().reason(), "Gone Fishing");
    }

    #[test]
    fn test_response_with_sdp_body() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\n";
        let response = ResponseBuilder::ok()
            .to_tag("t")
            .sdp(sdp)
            .build_for_request(&invite())
            .unwrap();

        let parsed = SipResponse::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed.body_str(), sdp);
        assert_eq!(parsed.header("Content-Type"), Some("application/sdp".to_string()));
    }

    #[test]
    fn test_request_builder_renders_parseable_invite() {
        let bytes = RequestBuilder::new(SipMethod::Invite, "sip:bob@10.0.0.2:5070", "10.0.0.9:5060")
            .from("sip:alice@example.com", "f1")
            .to("sip:bob@example.com", None)
            .call_id("out-1")
            .contact("sip:sipbridge@10.0.0.9:5060")
            .sdp("v=0\r\n")
            .build();

        let req = SipRequest::parse(&bytes).unwrap();
        assert_eq!(req.method(), Some(SipMethod::Invite));
        assert_eq!(req.call_id(), Some("out-1".to_string()));
        assert_eq!(req.from_tag(), Some("f1".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.body_str(), "v=0\r\n");
    }

    #[test]
    fn test_branch_has_magic_cookie() {
        assert!(new_branch().starts_with("z9hG4bK"));
        assert_ne!(new_branch(), new_branch());
    }
}
