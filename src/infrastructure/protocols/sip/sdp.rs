//! SDP bodies as far as the bridge needs them
//!
//! Local endpoints describe themselves with [`SdpSession::create_audio_session`];
//! for a peer's body the interesting part is where its audio RTP should go
//! ([`SdpSession::audio_endpoint`]). Everything else is carried through
//! untouched by the relay or regenerated by the local anchor.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Payload types offered by local endpoints
const LOCAL_AUDIO_FORMATS: [(u8, &str); 3] = [
    (0, "PCMU/8000"),
    (8, "PCMA/8000"),
    (101, "telephone-event/8000"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    /// Raw `o=` value
    pub origin: String,
    pub session_name: String,
    /// Session-level `c=`; a media-level one overrides it
    pub connection: Option<IpAddr>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMedia {
    pub kind: String,
    pub port: u16,
    pub profile: String,
    pub formats: Vec<String>,
    pub rtpmap: Vec<(String, String)>,
    pub connection: Option<IpAddr>,
    /// `sendrecv`, `sendonly`, `recvonly` or `inactive` when given
    pub direction: Option<String>,
}

impl SdpMedia {
    fn from_line(value: &str) -> Option<Self> {
        let mut fields = value.split_whitespace();
        let kind = fields.next()?.to_string();
        // `port/count` form
        let port = fields.next()?.split('/').next()?.parse().ok()?;
        let profile = fields.next()?.to_string();
        let formats: Vec<String> = fields.map(str::to_string).collect();
        if formats.is_empty() {
            return None;
        }

        Some(Self {
            kind,
            port,
            profile,
            formats,
            rtpmap: Vec::new(),
            connection: None,
            direction: None,
        })
    }

    fn apply_attribute(&mut self, value: &str) {
        if let Some(map) = value.strip_prefix("rtpmap:") {
            if let Some((pt, encoding)) = map.split_once(' ') {
                self.rtpmap.push((pt.to_string(), encoding.trim().to_string()));
            }
        } else if matches!(value, "sendrecv" | "sendonly" | "recvonly" | "inactive") {
            self.direction = Some(value.to_string());
        }
    }
}

/// `IN IP4 10.0.0.1` or `IN IP6 ::1`, ignoring a multicast TTL suffix
fn parse_connection(value: &str) -> Option<IpAddr> {
    let mut fields = value.split_whitespace();
    if fields.next()? != "IN" {
        return None;
    }
    let _addr_type = fields.next()?;
    fields.next()?.split('/').next()?.parse().ok()
}

fn addr_type(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

impl SdpSession {
    /// Single audio stream on `local_ip:local_port`
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Self {
        let session_id = chrono::Utc::now().timestamp();
        Self {
            origin: format!("sipbridge {} 1 IN {} {}", session_id, addr_type(local_ip), local_ip),
            session_name: "sipbridge".to_string(),
            connection: Some(local_ip),
            media: vec![SdpMedia {
                kind: "audio".to_string(),
                port: local_port,
                profile: "RTP/AVP".to_string(),
                formats: LOCAL_AUDIO_FORMATS.iter().map(|(pt, _)| pt.to_string()).collect(),
                rtpmap: LOCAL_AUDIO_FORMATS
                    .iter()
                    .map(|(pt, encoding)| (pt.to_string(), encoding.to_string()))
                    .collect(),
                connection: None,
                direction: Some("sendrecv".to_string()),
            }],
        }
    }

    /// Lenient parse. Unknown lines are skipped; `None` unless the body
    /// starts a session with `v=` and carries an origin.
    pub fn parse(body: &str) -> Option<Self> {
        let mut seen_version = false;
        let mut origin = None;
        let mut session_name = String::new();
        let mut connection = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in body.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();

            match (key, media.last_mut()) {
                ("v", _) => seen_version = true,
                ("o", _) => origin = Some(value.to_string()),
                ("s", None) => session_name = value.to_string(),
                ("c", None) => connection = parse_connection(value),
                ("c", Some(current)) => current.connection = parse_connection(value),
                // A malformed m= still opens a section so its attributes
                // don't land on the previous stream
                ("m", _) => media.push(SdpMedia::from_line(value).unwrap_or_default()),
                ("a", Some(current)) => current.apply_attribute(value),
                _ => {}
            }
        }

        if !seen_version {
            return None;
        }
        media.retain(|m| !m.kind.is_empty());

        Some(Self {
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.kind == "audio")
    }

    /// Where the peer wants to receive audio RTP.
    ///
    /// `None` when there is no audio stream, the stream is disabled
    /// (port 0), or no connection address applies to it.
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        let audio = self.audio_media()?;
        if audio.port == 0 {
            return None;
        }
        let ip = audio.connection.or(self.connection)?;
        Some(SocketAddr::new(ip, audio.port))
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\no={}\r\ns={}\r\n", self.origin, self.session_name)?;
        if let Some(ip) = self.connection {
            write!(f, "c=IN {} {}\r\n", addr_type(ip), ip)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.kind,
                media.port,
                media.profile,
                media.formats.join(" ")
            )?;
            if let Some(ip) = media.connection {
                write!(f, "c=IN {} {}\r\n", addr_type(ip), ip)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            if let Some(direction) = &media.direction {
                write!(f, "a={}\r\n", direction)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_OFFER: &str = "v=0\r\n\
                              o=alice 2890844526 2890844526 IN IP4 192.168.1.100\r\n\
                              s=call\r\n\
                              c=IN IP4 192.168.1.100\r\n\
                              t=0 0\r\n\
                              m=audio 10000 RTP/AVP 0 8\r\n\
                              a=rtpmap:0 PCMU/8000\r\n\
                              a=rtpmap:8 PCMA/8000\r\n\
                              a=sendonly\r\n";

    #[test]
    fn test_local_audio_session() {
        let sdp = SdpSession::create_audio_session("10.1.1.1".parse().unwrap(), 30000).to_string();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 10.1.1.1\r\n"));
        assert!(sdp.contains("m=audio 30000 RTP/AVP 0 8 101\r\n"));
        assert!(sdp.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(sdp.ends_with("a=sendrecv\r\n"));
    }

    #[test]
    fn test_peer_offer() {
        let sdp = SdpSession::parse(PEER_OFFER).unwrap();

        assert_eq!(sdp.session_name, "call");
        assert!(sdp.origin.starts_with("alice "));
        let audio = sdp.audio_media().unwrap();
        assert_eq!(audio.rtpmap.len(), 2);
        assert_eq!(audio.direction.as_deref(), Some("sendonly"));
        assert_eq!(audio.formats, vec!["0", "8"]);
        assert_eq!(sdp.audio_endpoint(), Some("192.168.1.100:10000".parse().unwrap()));
    }

    #[test]
    fn test_media_level_connection_wins() {
        let body = PEER_OFFER.replace("a=sendonly\r\n", "c=IN IP4 172.16.0.9/127\r\n");
        let sdp = SdpSession::parse(&body).unwrap();
        assert_eq!(sdp.audio_endpoint(), Some("172.16.0.9:10000".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_connection() {
        let sdp = SdpSession::create_audio_session("::1".parse().unwrap(), 4000).to_string();
        assert!(sdp.contains("c=IN IP6 ::1\r\n"));
        assert_eq!(
            SdpSession::parse(&sdp).unwrap().audio_endpoint(),
            Some("[::1]:4000".parse().unwrap())
        );
    }

    #[test]
    fn test_no_usable_audio() {
        let disabled = PEER_OFFER.replace("m=audio 10000", "m=audio 0");
        assert_eq!(SdpSession::parse(&disabled).unwrap().audio_endpoint(), None);

        let video_only = PEER_OFFER.replace("m=audio 10000 RTP/AVP 0 8", "m=video 5000 RTP/AVP 96");
        assert_eq!(SdpSession::parse(&video_only).unwrap().audio_endpoint(), None);

        let no_connection = PEER_OFFER.replace("c=IN IP4 192.168.1.100\r\n", "");
        assert_eq!(SdpSession::parse(&no_connection).unwrap().audio_endpoint(), None);

        assert!(SdpSession::parse("not sdp at all").is_none());
    }
}
