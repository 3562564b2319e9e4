//! Session description produced by `DESCRIBE`, built from the SDP body.

use std::collections::BTreeMap;

use bytes::Bytes;
use pretty_hex::PrettyHex;
use serde::Serialize;
use url::Url;

/// The interpreted SDP of a presentation.
#[derive(Clone, Debug, Serialize)]
pub struct SessionDescription {
    /// The `s=` line, if not the placeholder `-`.
    pub title: Option<String>,

    /// Base for relative control URLs: `Content-Base`, then
    /// `Content-Location`, then the `DESCRIBE` request URL.
    pub base_url: Url,

    /// Aggregate control URL, used for `PLAY` and `TEARDOWN`.
    pub control: Url,

    /// The session-level `a=tool` attribute.
    pub tool: Option<String>,

    pub medias: Vec<MediaDescription>,
}

/// One `m=` section.
#[derive(Clone, Debug, Serialize)]
pub struct MediaDescription {
    /// Position within [`SessionDescription::medias`].
    pub index: usize,

    #[serde(rename = "type")]
    pub media_type: String,

    pub proto: String,

    /// The media-level `a=control` joined to the base URL.
    pub control: Option<Url>,

    /// True for `a=sendonly` media, which the server expects us to send.
    pub is_back_channel: bool,

    pub formats: Vec<Format>,
}

/// An RTP payload format offered by a media section.
#[derive(Clone, Debug, Serialize)]
pub struct Format {
    pub payload_type: u8,
    pub encoding: Option<String>,
    pub clock_rate: Option<u32>,
    pub channels: Option<u16>,
    pub fmtp: BTreeMap<String, String>,
}

impl MediaDescription {
    pub fn format(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type == payload_type)
    }
}

struct StaticPayloadType {
    payload_type: u8,
    encoding: &'static str,
    clock_rate: u32,
    channels: Option<u16>,
}

/// Registered static payload types still seen in practice.
#[rustfmt::skip]
static STATIC_PAYLOAD_TYPES: &[StaticPayloadType] = &[
    StaticPayloadType { payload_type: 0, encoding: "PCMU", clock_rate: 8_000, channels: Some(1) },
    StaticPayloadType { payload_type: 3, encoding: "GSM", clock_rate: 8_000, channels: Some(1) },
    StaticPayloadType { payload_type: 4, encoding: "G723", clock_rate: 8_000, channels: Some(1) },
    StaticPayloadType { payload_type: 8, encoding: "PCMA", clock_rate: 8_000, channels: Some(1) },
    StaticPayloadType { payload_type: 9, encoding: "G722", clock_rate: 8_000, channels: Some(1) },
    StaticPayloadType { payload_type: 10, encoding: "L16", clock_rate: 44_100, channels: Some(2) },
    StaticPayloadType { payload_type: 11, encoding: "L16", clock_rate: 44_100, channels: Some(1) },
    StaticPayloadType { payload_type: 14, encoding: "MPA", clock_rate: 90_000, channels: None },
    StaticPayloadType { payload_type: 26, encoding: "JPEG", clock_rate: 90_000, channels: None },
    StaticPayloadType { payload_type: 32, encoding: "MPV", clock_rate: 90_000, channels: None },
    StaticPayloadType { payload_type: 33, encoding: "MP2T", clock_rate: 90_000, channels: None },
];

/// Joins a control URL to a base URL the way live555 and ffmpeg do, which is
/// not quite RFC 3986 resolution.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| {
        format!(
            "unable to join base url {} with control url {:?}: {}",
            base_url, control, e
        )
    })
}

/// Parses a successful `DESCRIBE` response.
/// On error, returns a string to be packed into an `RtspResponseError`.
pub(crate) fn parse_describe(
    request_url: Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<SessionDescription, String> {
    if !matches!(response.header(&rtsp_types::headers::CONTENT_TYPE),
                 Some(v) if v.as_str().starts_with("application/sdp"))
    {
        return Err(format!(
            "DESCRIBE response not of expected application/sdp content type: {:?}",
            response.header(&rtsp_types::headers::CONTENT_TYPE)
        ));
    }

    let sdp = sdp_types::Session::parse(&response.body()[..]).map_err(|e| {
        format!(
            "Unable to parse SDP: {}\n\n{:#?}",
            e,
            response.body().hex_dump()
        )
    })?;

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| (rtsp_types::headers::CONTENT_BASE, v))
        .or_else(|| {
            response
                .header(&rtsp_types::headers::CONTENT_LOCATION)
                .map(|v| (rtsp_types::headers::CONTENT_LOCATION, v))
        })
        .map(|(h, v)| Url::parse(v.as_str()).map_err(|e| format!("bad {} {:?}: {}", h, v, e)))
        .unwrap_or_else(|| Ok(request_url.clone()))?;

    let mut control = None;
    let mut tool = None;
    for a in &sdp.attributes {
        match a.attribute.as_str() {
            "control" => {
                control = a
                    .value
                    .as_deref()
                    .map(|c| join_control(&base_url, c))
                    .transpose()?;
            }
            "tool" => tool = a.value.clone(),
            _ => {}
        }
    }
    let control = control.unwrap_or_else(|| base_url.clone());

    let title = match sdp.session_name.trim() {
        "" | "-" => None,
        t => Some(t.to_owned()),
    };

    let medias = sdp
        .medias
        .iter()
        .enumerate()
        .map(|(i, m)| {
            parse_media(&base_url, i, m)
                .map_err(|e| format!("Unable to parse media {}: {}\n\n{:#?}", i, &e, &m))
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(SessionDescription {
        title,
        base_url,
        control,
        tool,
        medias,
    })
}

fn parse_media(
    base_url: &Url,
    index: usize,
    media: &sdp_types::Media,
) -> Result<MediaDescription, String> {
    let mut control = None;
    let mut is_back_channel = false;
    let mut rtpmaps = BTreeMap::new();
    let mut fmtps = BTreeMap::new();
    for a in &media.attributes {
        match a.attribute.as_str() {
            "control" => {
                control = a
                    .value
                    .as_deref()
                    .map(|c| join_control(base_url, c))
                    .transpose()?;
            }
            "sendonly" => is_back_channel = true,
            "rtpmap" | "fmtp" => {
                let v = a
                    .value
                    .as_deref()
                    .ok_or_else(|| format!("{} attribute with no value", a.attribute))?;
                let (pt, v) = v
                    .trim()
                    .split_once(' ')
                    .ok_or_else(|| format!("invalid {} attribute {:?}", a.attribute, v))?;
                let pt = pt
                    .parse::<u8>()
                    .map_err(|_| format!("invalid payload type {:?} in {}", pt, a.attribute))?;
                if a.attribute == "rtpmap" {
                    rtpmaps.insert(pt, v.trim());
                } else {
                    fmtps.insert(pt, v.trim());
                }
            }
            _ => {}
        }
    }

    // https://tools.ietf.org/html/rfc8866#section-5.14: for RTP-based
    // protos the <fmt> sub-fields are payload type numbers.
    let is_rtp = media.proto.starts_with("RTP/") || media.proto.contains("/RTP/");
    let mut formats = Vec::new();
    if is_rtp {
        for pt in media.fmt.split_ascii_whitespace() {
            let payload_type = pt
                .parse::<u8>()
                .ok()
                .filter(|pt| pt & 0x80 == 0)
                .ok_or_else(|| format!("invalid RTP payload type {:?}", pt))?;
            formats.push(parse_format(
                payload_type,
                rtpmaps.get(&payload_type).copied(),
                fmtps.get(&payload_type).copied(),
            )?);
        }
    }

    Ok(MediaDescription {
        index,
        media_type: media.media.clone(),
        proto: media.proto.clone(),
        control,
        is_back_channel,
        formats,
    })
}

fn parse_format(
    payload_type: u8,
    rtpmap: Option<&str>,
    fmtp: Option<&str>,
) -> Result<Format, String> {
    let (encoding, clock_rate, channels) = match rtpmap {
        // rtpmap-value = payload-type SP encoding-name "/" clock-rate [ "/" channels ]
        Some(rtpmap) => {
            let mut parts = rtpmap.splitn(3, '/');
            let encoding = parts.next().expect("splitn returns at least one part");
            let clock_rate = parts
                .next()
                .map(|c| c.parse::<u32>())
                .transpose()
                .map_err(|_| format!("bad clock rate in rtpmap {:?}", rtpmap))?;
            let channels = parts
                .next()
                .map(|c| c.parse::<u16>())
                .transpose()
                .map_err(|_| format!("bad channels in rtpmap {:?}", rtpmap))?;
            (Some(encoding.to_owned()), clock_rate, channels)
        }
        None => match STATIC_PAYLOAD_TYPES
            .iter()
            .find(|s| s.payload_type == payload_type)
        {
            Some(s) => (Some(s.encoding.to_owned()), Some(s.clock_rate), s.channels),
            None => (None, None, None),
        },
    };
    Ok(Format {
        payload_type,
        encoding,
        clock_rate,
        channels,
        fmtp: fmtp.map(parse_fmtp).unwrap_or_default(),
    })
}

fn parse_fmtp(fmtp: &str) -> BTreeMap<String, String> {
    fmtp.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_owned(), v.trim().to_owned()),
            None => (p.to_owned(), String::new()),
        })
        .collect()
}
