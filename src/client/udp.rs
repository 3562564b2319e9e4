//! UDP sockets for RTP/RTCP reception.

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;

/// How many ephemeral ports to try before giving up on finding an even one
/// whose successor is also free.
const MAX_BIND_ATTEMPTS: usize = 16;

/// A bound RTP/RTCP socket pair on consecutive ports, RTP on the even one
/// (RFC 3550 section 11).
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    /// Binds any free port pair on `ip`; no fixed port range is enforced.
    pub(crate) async fn bind(ip: IpAddr) -> Result<Self, std::io::Error> {
        let mut last_err = None;
        for _ in 0..MAX_BIND_ATTEMPTS {
            let rtp_socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
            let rtp_port = rtp_socket.local_addr()?.port();
            if rtp_port % 2 != 0 || rtp_port == u16::MAX {
                continue;
            }
            match UdpSocket::bind(SocketAddr::new(ip, rtp_port + 1)).await {
                Ok(rtcp_socket) => {
                    return Ok(UdpPair {
                        rtp_port,
                        rtp_socket,
                        rtcp_socket,
                    })
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("no even port pair found in {} attempts", MAX_BIND_ATTEMPTS),
            )
        }))
    }
}
