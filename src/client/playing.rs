//! Background tasks of a playing session.
//!
//! Receivers (the RTSP connection for interleaved media, one socket per UDP
//! RTP/RTCP port) feed a bounded queue; a single consumer task drains it into
//! the packet callback.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    MediaDescription, MediaTransport, PacketCallback, RtspConnection, SessionHeader,
    SessionOptions, SetupMedia,
};
use crate::error::ErrorInt;
use crate::{rtp, wrap, ReceivedMessage};

/// Large enough for any UDP datagram.
const UDP_BUFFER_SIZE: usize = 65_536;

/// Position of a media among the set-up media.
type MediaIndex = usize;

/// Consecutive receive failures after which a UDP receiver gives up.
const MAX_RECV_FAILURES: u32 = 8;

/// Pause after the first receive failure; doubles with each further one.
const RECV_FAILURE_BACKOFF: Duration = Duration::from_millis(10);

/// Tracks consecutive `recv_from` failures of one socket.
#[derive(Debug, Default)]
struct RecvFailures(u32);

impl RecvFailures {
    /// Returns how long to pause before receiving again, or `None` once the
    /// socket should be abandoned.
    fn failed(&mut self) -> Option<Duration> {
        self.0 += 1;
        if self.0 >= MAX_RECV_FAILURES {
            return None;
        }
        Some(RECV_FAILURE_BACKOFF * 2u32.pow(self.0 - 1))
    }

    fn succeeded(&mut self) {
        self.0 = 0;
    }
}

/// A packet on its way to the callback, tagged with the position of its media
/// among the set-up media.
struct Delivery {
    media: MediaIndex,
    packet: rtp::Packet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChannelType {
    Rtp,
    Rtcp,
}

pub(crate) struct Playing {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Playing {
    pub(crate) fn start(
        conn: RtspConnection,
        session: SessionHeader,
        control: Url,
        setups: Vec<SetupMedia>,
        callback: Option<PacketCallback>,
        options: &SessionOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(options.queue_size);
        let mut tasks = Vec::new();
        let mut channels = Vec::new();
        let mut medias = Vec::with_capacity(setups.len());

        for (i, setup) in setups.into_iter().enumerate() {
            medias.push(setup.media);
            match setup.transport {
                MediaTransport::Interleaved { channel_id } => channels.push((channel_id, i)),
                MediaTransport::Udp {
                    pair,
                    source,
                    server_port,
                } => {
                    let rtp_rx = UdpReceiver {
                        media: i,
                        channel_type: ChannelType::Rtp,
                        source,
                        expected_port: server_port.map(|(p, _)| p),
                        any_port: options.any_port,
                    };
                    let rtcp_rx = UdpReceiver {
                        channel_type: ChannelType::Rtcp,
                        expected_port: server_port.map(|(_, p)| p),
                        ..rtp_rx
                    };
                    tasks.push(tokio::spawn(rtp_rx.run(
                        pair.rtp_socket,
                        tx.clone(),
                        cancel.clone(),
                    )));
                    tasks.push(tokio::spawn(rtcp_rx.run(
                        pair.rtcp_socket,
                        tx.clone(),
                        cancel.clone(),
                    )));
                }
            }
        }

        let keepalive = Duration::from_secs(u64::from(session.timeout_sec.max(2)) / 2);
        let control_task = ControlTask {
            conn,
            session,
            control,
            channels,
            keepalive,
        };
        tasks.push(tokio::spawn(control_task.run(tx, cancel.clone())));
        tasks.push(tokio::spawn(consume(rx, medias, callback)));

        Playing { cancel, tasks }
    }

    /// Cancels the receivers, which tears the session down, and waits for
    /// queued packets to reach the callback.
    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!("Session task failed: {}", e);
            }
        }
    }
}

impl Drop for Playing {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Delivery>,
    medias: Vec<MediaDescription>,
    callback: Option<PacketCallback>,
) {
    while let Some(d) = rx.recv().await {
        match callback {
            Some(ref cb) => cb(&medias[d.media], &d.packet),
            None => trace!(
                "No callback registered; discarding packet seq={} of media {}",
                d.packet.header.sequence_number,
                medias[d.media].index
            ),
        }
    }
    debug!("Packet queue closed");
}

enum ControlEvent {
    Cancelled,
    Keepalive,
    Message(Option<Result<ReceivedMessage, crate::Error>>),
}

struct ControlTask {
    conn: RtspConnection,
    session: SessionHeader,
    control: Url,
    /// Interleaved RTP channel id per set-up media; RTCP uses the next id.
    channels: Vec<(u8, MediaIndex)>,
    keepalive: Duration,
}

impl ControlTask {
    fn lookup(&self, channel_id: u8) -> Option<(MediaIndex, ChannelType)> {
        self.channels.iter().find_map(|&(c, media)| {
            if c == channel_id {
                Some((media, ChannelType::Rtp))
            } else if c.checked_add(1) == Some(channel_id) {
                Some((media, ChannelType::Rtcp))
            } else {
                None
            }
        })
    }

    /// Sends `OPTIONS` with the session id so the server doesn't expire the
    /// session. The reply is read by the main loop.
    async fn send_keepalive(&mut self) -> Result<(), crate::Error> {
        let mut req =
            rtsp_types::Request::builder(rtsp_types::Method::Options, rtsp_types::Version::V1_0)
                .request_uri(self.control.clone())
                .header(rtsp_types::headers::SESSION, self.session.id.to_string())
                .build(Bytes::new());
        let cseq = self.conn.fill_req(&mut req)?;
        trace!("Sending keepalive CSeq {}", cseq);
        self.conn.write(rtsp_types::Message::Request(req)).await
    }

    async fn run(mut self, tx: mpsc::Sender<Delivery>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.keepalive;
        let mut keepalive_timer = tokio::time::interval_at(start, self.keepalive);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => ControlEvent::Cancelled,
                _ = keepalive_timer.tick() => ControlEvent::Keepalive,
                msg = self.conn.inner.next() => ControlEvent::Message(msg),
            };
            let msg = match event {
                ControlEvent::Cancelled => break,
                ControlEvent::Keepalive => {
                    if let Err(e) = self.send_keepalive().await {
                        error!("Unable to send keepalive: {}", e);
                        return;
                    }
                    continue;
                }
                ControlEvent::Message(msg) => msg,
            };
            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    error!("{}", e);
                    return;
                }
                None => {
                    warn!("RTSP connection closed by server");
                    return;
                }
            };
            match msg.msg {
                rtsp_types::Message::Data(data) => {
                    let channel_id = data.channel_id();
                    match self.lookup(channel_id) {
                        Some((media, ChannelType::Rtp)) => {
                            if let Some(packet) = parse_rtp(media, data.into_body()) {
                                // Awaiting here applies backpressure to the TCP stream.
                                if tx.send(Delivery { media, packet }).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some((media, ChannelType::Rtcp)) => trace!(
                            "{}-byte RTCP packet for media {}",
                            data.into_body().len(),
                            media
                        ),
                        None => warn!(
                            "{}",
                            wrap!(ErrorInt::RtspUnassignedChannelError {
                                conn_ctx: *self.conn.ctx(),
                                msg_ctx: msg.ctx,
                                channel_id,
                            })
                        ),
                    }
                }
                rtsp_types::Message::Response(r) if !r.status().is_success() => {
                    warn!("Keepalive got {} response", r.status())
                }
                rtsp_types::Message::Response(_) => trace!("Keepalive acknowledged"),
                rtsp_types::Message::Request(r) => warn!(
                    "Ignoring {} request from server while playing",
                    Into::<&str>::into(r.method())
                ),
            }
        }
        drop(tx);
        if let Err(e) = super::teardown(&mut self.conn, &self.control, &self.session).await {
            debug!("TEARDOWN failed: {}", e);
        }
    }
}

fn parse_rtp(media: MediaIndex, raw: Bytes) -> Option<rtp::Packet> {
    match rtp::Packet::parse(raw) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!("Dropping invalid RTP packet for media {}: {}", media, e);
            None
        }
    }
}

#[derive(Copy, Clone)]
struct UdpReceiver {
    media: MediaIndex,
    channel_type: ChannelType,
    source: std::net::IpAddr,
    expected_port: Option<u16>,
    any_port: bool,
}

impl UdpReceiver {
    async fn run(self, socket: UdpSocket, tx: mpsc::Sender<Delivery>, cancel: CancellationToken) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let mut failures = RecvFailures::default();
        loop {
            let r = tokio::select! {
                _ = cancel.cancelled() => return,
                r = socket.recv_from(&mut buf) => r,
            };
            let (len, from) = match r {
                Ok(r) => {
                    failures.succeeded();
                    r
                }
                Err(e) => match failures.failed() {
                    Some(pause) => {
                        debug!("UDP receive error for media {}: {}", self.media, e);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(pause) => continue,
                        }
                    }
                    None => {
                        error!(
                            "Giving up on {:?} socket of media {} after {} receive errors: {}",
                            self.channel_type, self.media, MAX_RECV_FAILURES, e
                        );
                        return;
                    }
                },
            };
            if !super::accepts_udp_source(from, self.source, self.expected_port, self.any_port) {
                debug!("Ignoring UDP datagram from unexpected {} for media {}", from, self.media);
                continue;
            }
            if self.channel_type == ChannelType::Rtcp {
                trace!("{}-byte RTCP packet for media {}", len, self.media);
                continue;
            }
            let Some(packet) = parse_rtp(self.media, Bytes::copy_from_slice(&buf[..len])) else {
                continue;
            };
            match tx.try_send(Delivery {
                media: self.media,
                packet,
            }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Packet queue full; dropping RTP packet for media {}", self.media)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}
