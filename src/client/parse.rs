//! Parsing of RTSP response headers needed to drive a session.

use std::net::IpAddr;

use bytes::Bytes;

/// Default session timeout, per RFC 2326 section 12.37.
const DEFAULT_SESSION_TIMEOUT_SEC: u32 = 60;

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| cseq.as_str().trim().parse().ok())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

impl SessionHeader {
    /// Parses `Session: id[;timeout=N]`.
    pub(crate) fn parse(value: &str) -> Result<Self, String> {
        let mut parts = value.split(';');
        let id = parts.next().expect("split returns at least one part").trim();
        if id.is_empty() {
            return Err(format!("Empty session id in {:?}", value));
        }
        let mut timeout_sec = DEFAULT_SESSION_TIMEOUT_SEC;
        for part in parts {
            if let Some(v) = part.trim().strip_prefix("timeout=") {
                timeout_sec = v
                    .parse()
                    .map_err(|_| format!("Unparseable timeout {:?}", v))?;
            }
        }
        Ok(SessionHeader {
            id: id.into(),
            timeout_sec,
        })
    }
}

#[derive(Debug)]
pub(crate) struct SetupResponse {
    pub(crate) session: SessionHeader,
    pub(crate) ssrc: Option<u32>,
    pub(crate) channel_id: Option<u8>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) server_port: Option<(u16, u16)>,
}

fn parse_pair<T: std::str::FromStr + Copy>(v: &str, what: &str) -> Result<(T, Option<T>), String> {
    let mut it = v.splitn(2, '-');
    let first = it.next().expect("splitn returns at least one part");
    let first = first
        .parse()
        .map_err(|_| format!("bad {} {:?}", what, first))?;
    let second = it
        .next()
        .map(|s| s.parse().map_err(|_| format!("bad second {} {:?}", what, s)))
        .transpose()?;
    Ok((first, second))
}

/// Parses a successful `SETUP` response.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.37
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "Missing Session header".to_string())?;
    let session = SessionHeader::parse(session.as_str())?;

    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.39
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "Missing Transport header".to_string())?;
    let mut channel_id = None;
    let mut ssrc = None;
    let mut source = None;
    let mut server_port = None;
    for part in transport.as_str().split(';').map(str::trim) {
        if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| format!("Unparseable ssrc {}", v))?);
        } else if let Some(v) = part.strip_prefix("interleaved=") {
            let (n, m) = parse_pair::<u8>(v, "channel number")?;
            if let Some(m) = m {
                if n.checked_add(1) != Some(m) {
                    return Err(format!("Expected adjacent channels; got {}-{}", n, m));
                }
            }
            channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {:?}", s))?,
            );
        } else if let Some(v) = part.strip_prefix("server_port=") {
            // A single port is allowed by the grammar; RTCP then takes the next one.
            let (n, m) = parse_pair::<u16>(v, "server port")?;
            server_port = Some((n, m.unwrap_or_else(|| n.wrapping_add(1))));
        }
    }
    Ok(SetupResponse {
        session,
        ssrc,
        channel_id,
        source,
        server_port,
    })
}
