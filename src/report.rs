//! JSON rendering of session descriptions and RTP packet headers.

use log::{error, info};
use serde::Serialize;

use crate::client::{MediaDescription, SessionDescription};
use crate::rtp;

const DESCRIPTION_INDENT: &[u8] = b" ";
const PACKET_INDENT: &[u8] = b"  ";

/// Receives what the probe observes.
pub trait Reporter: Send + Sync {
    /// Called once, after a successful `DESCRIBE`.
    fn description(&self, description: &SessionDescription);

    /// Called for every RTP packet of every media.
    fn packet(&self, media: &MediaDescription, packet: &rtp::Packet);
}

/// Writes descriptions and packets to the log at `info` level.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn description(&self, description: &SessionDescription) {
        match description_json(description) {
            Ok(json) => info!("SDP in JSON:\n{}", json),
            Err(e) => error!("Error marshaling SDP to JSON: {}", e),
        }
    }

    fn packet(&self, media: &MediaDescription, packet: &rtp::Packet) {
        match packet_json(packet) {
            Ok(json) => info!("Received RTP packet (media {}):\n{}", media.index, json),
            Err(e) => error!("Error marshaling RTP packet to JSON: {}", e),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExtensionRecord {
    pub id: u8,
    /// Hex-encoded extension payload.
    pub payload: String,
}

/// The header fields of one packet, in output order.
#[derive(Debug, Serialize)]
pub struct PacketRecord<'a> {
    pub version: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub extension: bool,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub ssrc: u32,
    pub csrc: &'a [u32],
    pub extensions: Vec<ExtensionRecord>,
    pub extension_profile: u16,
}

impl<'a> From<&'a rtp::Header> for PacketRecord<'a> {
    fn from(h: &'a rtp::Header) -> Self {
        PacketRecord {
            version: h.version,
            sequence_number: h.sequence_number,
            timestamp: h.timestamp,
            extension: h.extension,
            padding: h.padding,
            marker: h.marker,
            payload_type: h.payload_type,
            ssrc: h.ssrc,
            csrc: &h.csrc,
            extensions: h
                .extensions
                .iter()
                .map(|e| ExtensionRecord {
                    id: e.id,
                    payload: hex::encode(&e.payload),
                })
                .collect(),
            extension_profile: h.extension_profile,
        }
    }
}

/// Pretty-prints `value` with `indent` as the per-level indentation.
pub fn to_indented_json<T: Serialize + ?Sized>(
    value: &T,
    indent: &[u8],
) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(buf).expect("serde_json output is UTF-8"))
}

pub fn packet_json(packet: &rtp::Packet) -> Result<String, serde_json::Error> {
    to_indented_json(&PacketRecord::from(&packet.header), PACKET_INDENT)
}

pub fn description_json(description: &SessionDescription) -> Result<String, serde_json::Error> {
    to_indented_json(description, DESCRIPTION_INDENT)
}
