//! A small RTSP client which describes, sets up and plays a presentation and
//! hands every received RTP packet to one callback.
//!
//! [`probe::run`] sequences the whole session for the `rtsp-inspect` binary;
//! [`client::Client`] exposes the individual steps.

use std::net::SocketAddr;

use bytes::Bytes;
use rtsp_types::Message;

pub mod client;
pub mod error;
pub mod probe;
pub mod report;
pub mod rtp;
pub mod tokyo;

pub use error::Error;

#[macro_export]
macro_rules! bail {
    ($e:expr) => {
        return Err($crate::error::Error(std::sync::Arc::new($e)))
    };
}

#[macro_export]
macro_rules! wrap {
    ($e:expr) => {
        $crate::error::Error(std::sync::Arc::new($e))
    };
}

/// A message read from the RTSP connection, with where and when it arrived.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub ctx: RtspMessageContext,
    pub msg: Message<Bytes>,
}

#[derive(Copy, Clone, Debug)]
pub struct WallTime(time::Timespec);

impl WallTime {
    pub fn now() -> Self {
        Self(time::get_time())
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(
            &time::at(self.0)
                .strftime("%FT%T")
                .map_err(|_| std::fmt::Error)?,
            f,
        )
    }
}

/// Addresses and establishment time of the RTSP control connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub established_wall: WallTime,
    pub established: std::time::Instant,
}

impl std::fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Byte position within the connection and receive time of one message.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    pub pos: u64,
    pub received_wall: WallTime,
    pub received: std::time::Instant,
}

impl RtspMessageContext {
    pub(crate) fn at(pos: u64) -> Self {
        Self {
            pos,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        }
    }

    pub fn received(&self) -> std::time::Instant {
        self.received
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl std::fmt::Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Returns the range of `subset` within `buf`, which it must borrow from.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}
