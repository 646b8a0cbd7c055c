//! Packet decoding
//!
//! Queue payloads start at the IP header (no link layer). DNS-bearing
//! packets must decode exactly three layers deep: IP, UDP or TCP, DNS.
//! Generic traffic only needs its addresses read.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use hickory_proto::op::Message;

use crate::error::{Error, Result};

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Address family of a filter and all of its queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Transport protocol of a DNS exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// UDP (protocol number 17)
    Udp,
    /// TCP (protocol number 6)
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// Canonical 5-tuple fingerprint correlating a DNS query with its reply.
///
/// Always constructed in outbound orientation: parsing the inbound reply
/// swaps its endpoints, so a query and its reply produce identical IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Transport carrying the exchange.
    pub transport: Transport,
    /// Endpoint that sent the query.
    pub src: SocketAddr,
    /// Endpoint the query was sent to.
    pub dst: SocketAddr,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}-{}", self.transport, self.src, self.dst)
    }
}

/// Decode a DNS-bearing packet into its message and connection ID.
///
/// Fails unless all three layers parse. `inbound` marks packets
/// travelling towards this host (DNS replies); their endpoints are
/// swapped so the ID matches the one recorded for the query.
pub fn decode_dns_packet(
    payload: &[u8],
    family: IpFamily,
    inbound: bool,
) -> Result<(Message, ConnectionId)> {
    let ip = IpSlices::parse(payload, family)?;

    let (transport, src_port, dst_port, dns_bytes) = match ip.protocol {
        IPPROTO_UDP => {
            let udp = UdpHeaderSlice::from_slice(ip.transport)
                .map_err(|e| Error::packet_parse(format!("invalid UDP header: {e}")))?;
            let data = &ip.transport[udp.slice().len()..];
            (Transport::Udp, udp.source_port(), udp.destination_port(), data)
        }
        IPPROTO_TCP => {
            let tcp = TcpHeaderSlice::from_slice(ip.transport)
                .map_err(|e| Error::packet_parse(format!("invalid TCP header: {e}")))?;
            let data = &ip.transport[tcp.slice().len()..];
            (
                Transport::Tcp,
                tcp.source_port(),
                tcp.destination_port(),
                strip_tcp_dns_prefix(data)?,
            )
        }
        other => {
            return Err(Error::packet_parse(format!(
                "unsupported transport protocol {other}"
            )))
        }
    };

    let message = Message::from_vec(dns_bytes)
        .map_err(|e| Error::packet_parse(format!("invalid DNS message: {e}")))?;

    let conn_id = if inbound {
        ConnectionId {
            transport,
            src: SocketAddr::new(ip.dst, dst_port),
            dst: SocketAddr::new(ip.src, src_port),
        }
    } else {
        ConnectionId {
            transport,
            src: SocketAddr::new(ip.src, src_port),
            dst: SocketAddr::new(ip.dst, dst_port),
        }
    };

    Ok((message, conn_id))
}

/// Decode only the addresses of a packet. Upper layers are ignored.
pub fn decode_ip_packet(payload: &[u8], family: IpFamily) -> Result<(IpAddr, IpAddr)> {
    let ip = IpSlices::parse(payload, family)?;
    Ok((ip.src, ip.dst))
}

struct IpSlices<'a> {
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    transport: &'a [u8],
}

impl<'a> IpSlices<'a> {
    fn parse(payload: &'a [u8], family: IpFamily) -> Result<Self> {
        match family {
            IpFamily::V4 => {
                let ip = Ipv4HeaderSlice::from_slice(payload)
                    .map_err(|e| Error::packet_parse(format!("invalid IPv4 header: {e}")))?;
                let header_len = ip.slice().len();
                Ok(Self {
                    src: IpAddr::V4(ip.source_addr()),
                    dst: IpAddr::V4(ip.destination_addr()),
                    protocol: ip.protocol(),
                    transport: &payload[header_len..],
                })
            }
            IpFamily::V6 => {
                let ip = Ipv6HeaderSlice::from_slice(payload)
                    .map_err(|e| Error::packet_parse(format!("invalid IPv6 header: {e}")))?;
                let header_len = ip.slice().len();
                Ok(Self {
                    src: IpAddr::V6(ip.source_addr()),
                    dst: IpAddr::V6(ip.destination_addr()),
                    protocol: ip.next_header(),
                    transport: &payload[header_len..],
                })
            }
        }
    }
}

/// DNS over TCP prefixes the message with its length (RFC 1035 §4.2.2).
fn strip_tcp_dns_prefix(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 2 {
        return Err(Error::PacketTooSmall {
            expected: 2,
            actual: data.len(),
        });
    }
    let msg_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let body = &data[2..];
    if body.len() < msg_len {
        return Err(Error::PacketTooSmall {
            expected: msg_len,
            actual: body.len(),
        });
    }
    Ok(&body[..msg_len])
}
