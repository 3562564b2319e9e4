//! RTP fixed-header decoding ([RFC 3550 section
//! 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1)) with
//! header extensions ([RFC 8285](https://datatracker.ietf.org/doc/html/rfc8285)).

use bytes::{Buf, Bytes};
use smallvec::SmallVec;

pub const HEADER_LENGTH: usize = 12;
pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const EXTENSION_SHIFT: u8 = 4;
pub const CC_MASK: u8 = 0xF;
pub const MARKER_SHIFT: u8 = 7;
pub const PT_MASK: u8 = 0x7F;
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;
pub const EXTENSION_PROFILE_TWO_BYTE: u16 = 0x1000;
/// The low four "appbits" of a two-byte profile are free for the application.
pub const EXTENSION_PROFILE_TWO_BYTE_MASK: u16 = 0xFFF0;
pub const EXTENSION_ID_RESERVED: u8 = 0xF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("RTP header size insufficient: {0} bytes")]
    HeaderSizeInsufficient(usize),

    #[error("RTP header size insufficient for extension")]
    HeaderSizeInsufficientForExtension,

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("RTP padding of {padding} bytes exceeds {payload}-byte payload")]
    InvalidPadding { padding: usize, payload: usize },
}

/// One header extension element. Extensions of a non-RFC 8285 profile are
/// reported as a single element with id 0 holding the whole extension body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extension {
    pub id: u8,
    pub payload: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: SmallVec<[u32; 4]>,
    pub extension_profile: u16,
    pub extensions: Vec<Extension>,
}

/// A decoded RTP packet. `payload` excludes any trailing padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn parse(mut raw: Bytes) -> Result<Self, PacketError> {
        let header = Header::parse(&mut raw)?;
        if header.padding && !raw.is_empty() {
            let padding = usize::from(raw[raw.len() - 1]);
            if padding == 0 || padding > raw.len() {
                return Err(PacketError::InvalidPadding {
                    padding,
                    payload: raw.len(),
                });
            }
            raw.truncate(raw.len() - padding);
        }
        Ok(Packet {
            header,
            payload: raw,
        })
    }
}

impl Header {
    /// Parses the header at the front of `raw`, leaving `raw` at the payload.
    pub fn parse(raw: &mut Bytes) -> Result<Self, PacketError> {
        let raw_len = raw.remaining();
        if raw_len < HEADER_LENGTH {
            return Err(PacketError::HeaderSizeInsufficient(raw_len));
        }
        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P|X|  CC   |M|     PT      |       sequence number         |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                           timestamp                           |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |           synchronization source (SSRC) identifier            |
         * +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * |            contributing source (CSRC) identifiers             |
         * |                             ....                              |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let b0 = raw[0];
        let version = b0 >> VERSION_SHIFT & VERSION_MASK;
        if version != 2 {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let padding = (b0 >> PADDING_SHIFT) & 1 == 1;
        let extension = (b0 >> EXTENSION_SHIFT) & 1 == 1;
        let cc = usize::from(b0 & CC_MASK);
        if raw_len < HEADER_LENGTH + 4 * cc {
            return Err(PacketError::HeaderSizeInsufficient(raw_len));
        }
        raw.advance(1);

        let b1 = raw.get_u8();
        let marker = (b1 >> MARKER_SHIFT) == 1;
        let payload_type = b1 & PT_MASK;
        let sequence_number = raw.get_u16();
        let timestamp = raw.get_u32();
        let ssrc = raw.get_u32();
        let csrc = (0..cc).map(|_| raw.get_u32()).collect();

        let (extension_profile, extensions) = if extension {
            parse_extensions(raw)?
        } else {
            (0, Vec::new())
        };

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extensions,
        })
    }
}

fn parse_extensions(raw: &mut Bytes) -> Result<(u16, Vec<Extension>), PacketError> {
    if raw.remaining() < 4 {
        return Err(PacketError::HeaderSizeInsufficientForExtension);
    }
    let profile = raw.get_u16();
    let len = usize::from(raw.get_u16()) * 4;
    if raw.remaining() < len {
        return Err(PacketError::HeaderSizeInsufficientForExtension);
    }
    let mut body = raw.split_to(len);
    let mut extensions = Vec::new();

    if profile == EXTENSION_PROFILE_ONE_BYTE {
        while body.has_remaining() {
            let b = body.get_u8();
            if b == 0 {
                continue; // padding
            }
            let id = b >> 4;
            if id == EXTENSION_ID_RESERVED {
                break;
            }
            let len = usize::from(b & 0x0F) + 1;
            if body.remaining() < len {
                return Err(PacketError::HeaderSizeInsufficientForExtension);
            }
            extensions.push(Extension {
                id,
                payload: body.split_to(len),
            });
        }
    } else if profile & EXTENSION_PROFILE_TWO_BYTE_MASK == EXTENSION_PROFILE_TWO_BYTE {
        while body.has_remaining() {
            let id = body.get_u8();
            if id == 0 {
                continue; // padding
            }
            if !body.has_remaining() {
                return Err(PacketError::HeaderSizeInsufficientForExtension);
            }
            let len = usize::from(body.get_u8());
            if body.remaining() < len {
                return Err(PacketError::HeaderSizeInsufficientForExtension);
            }
            extensions.push(Extension {
                id,
                payload: body.split_to(len),
            });
        }
    } else {
        extensions.push(Extension { id: 0, payload: body });
    }
    Ok((profile, extensions))
}
