//! Tokio-based RTSP control connection: a `Framed` TCP stream which yields
//! requests, responses and `$`-interleaved data messages.

use std::ops::Range;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use pretty_hex::PrettyHex;
use rtsp_types::{Data, Message};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Host;

use crate::error::{Error, ErrorInt};
use crate::{wrap, ConnectionContext, ReceivedMessage, RtspMessageContext, WallTime};

/// How much of an unparseable buffer is included in a framing error.
const MAX_DUMP_BYTES: usize = 128;

struct Codec {
    ctx: ConnectionContext,
    read_pos: u64,
}

enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

/// Removes the `len`-byte message at the front of `src` and returns its body.
fn take_body(src: &mut BytesMut, len: usize, body: Option<Range<usize>>) -> Bytes {
    match body {
        Some(r) => {
            let mut raw_msg = src.split_to(len);
            raw_msg.advance(r.start);
            raw_msg.truncate(r.len());
            raw_msg.freeze()
        }
        None => {
            src.advance(len);
            Bytes::new()
        }
    }
}

impl Codec {
    fn parse_data(src: &mut BytesMut) -> Option<(usize, Message<Bytes>)> {
        if src.len() < 4 {
            return None;
        }
        let channel_id = src[1];
        let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
        if src.len() < len {
            src.reserve(len - src.len());
            return None;
        }
        let mut msg = src.split_to(len);
        msg.advance(4);
        Some((len, Message::Data(Data::new(channel_id, msg.freeze()))))
    }

    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        if !src.is_empty() && src[0] == b'$' {
            return Ok(Self::parse_data(src));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
            Err(rtsp_types::ParseError::Error) => {
                let conf = pretty_hex::HexConfig {
                    title: false,
                    ..Default::default()
                };
                let shown = src.len().min(MAX_DUMP_BYTES);
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; next {} of {} buffered bytes are:\n{:#?}",
                        shown,
                        src.len(),
                        (&src[0..shown]).hex_conf(conf)
                    ),
                    pos: self.read_pos,
                });
            }
        };

        let msg = match msg {
            Message::Request(req) => {
                let body = crate::as_range(src, req.body());
                let req = req.replace_body(rtsp_types::Empty);
                Message::Request(req.replace_body(take_body(src, len, body)))
            }
            Message::Response(resp) => {
                let body = crate::as_range(src, resp.body());
                let resp = resp.replace_body(rtsp_types::Empty);
                Message::Response(resp.replace_body(take_body(src, len, body)))
            }
            Message::Data(_) => unreachable!("'$' prefix is handled above"),
        };
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src)? {
            None => return Ok(None),
            Some(m) => m,
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext::at(self.read_pos),
        };
        self.read_pos += u64::try_from(len).expect("usize fits in u64");
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}

pub struct Connection(Framed<TcpStream, Codec>);

impl Connection {
    pub async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let established = Instant::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self(Framed::new(
            stream,
            Codec {
                ctx: ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall,
                    established,
                },
                read_pos: 0,
            },
        )))
    }

    pub fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    /// Context for an error discovered at the current end of the read buffer.
    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext::at(
            self.0.codec().read_pos
                + u64::try_from(self.0.read_buffer().remaining()).expect("usize fits in u64"),
        )
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            CodecError::ParseError { .. } => unreachable!("encoder never parses"),
        }
    }
}

impl Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(source) => ErrorInt::RtspReadError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: self.eof_ctx(),
                    source,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: RtspMessageContext::at(pos),
                    description,
                },
            })
        })
    }
}

impl Sink<Message<Bytes>> for Connection {
    type Error = ErrorInt;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.0
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}
