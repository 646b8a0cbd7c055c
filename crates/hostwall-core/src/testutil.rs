//! Packet builders and resolver doubles shared by the engine tests.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::Mutex;

use crate::conntrack::ConnState;
use crate::error::{Error, Result};
use crate::packet::IpFamily;
use crate::queue::QueuedPacket;
use crate::resolver::HostResolver;

/// Answer records for built DNS replies.
pub(crate) enum Answer {
    A(std::net::Ipv4Addr),
    Aaaa(std::net::Ipv6Addr),
    Cname(&'static str),
    Srv(&'static str),
}

/// Encode a DNS query for `name` (type A).
pub(crate) fn dns_query(name: &str) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(0x5157);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(fqdn(name), RecordType::A));
    msg.to_vec().expect("encoding DNS query")
}

/// Encode a DNS reply for `name` carrying the given answers.
pub(crate) fn dns_reply_with(name: &str, answers: &[Answer], ttl: u32) -> Vec<u8> {
    let qname = fqdn(name);

    let mut msg = Message::new();
    msg.set_id(0x5157);
    msg.set_message_type(MessageType::Response);
    msg.set_recursion_desired(true);
    msg.set_recursion_available(true);
    msg.add_query(Query::query(qname.clone(), RecordType::A));

    for answer in answers {
        let rdata = match answer {
            Answer::A(v4) => RData::A(A(*v4)),
            Answer::Aaaa(v6) => RData::AAAA(AAAA(*v6)),
            Answer::Cname(target) => RData::CNAME(CNAME(fqdn(target))),
            Answer::Srv(target) => RData::SRV(SRV::new(10, 5, 443, fqdn(target))),
        };
        msg.add_answer(Record::from_rdata(qname.clone(), ttl, rdata));
    }

    msg.to_vec().expect("encoding DNS reply")
}

/// Encode a DNS reply whose answers are plain address records.
pub(crate) fn dns_reply(name: &str, ips: &[IpAddr], ttl: u32) -> Vec<u8> {
    let answers: Vec<Answer> = ips
        .iter()
        .map(|ip| match ip {
            IpAddr::V4(v4) => Answer::A(*v4),
            IpAddr::V6(v6) => Answer::Aaaa(*v6),
        })
        .collect();
    dns_reply_with(name, &answers, ttl)
}

fn fqdn(name: &str) -> Name {
    let dotted = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    };
    Name::from_str(&dotted).expect("test hostname")
}

/// Build an IPv4/UDP packet around `payload` as a queued packet.
pub(crate) fn udp_packet(
    src: &str,
    dst: &str,
    payload: &[u8],
    ct_state: Option<ConnState>,
) -> QueuedPacket {
    let src: SocketAddr = src.parse().expect("src addr");
    let dst: SocketAddr = dst.parse().expect("dst addr");
    let (SocketAddr::V4(src), SocketAddr::V4(dst)) = (src, dst) else {
        panic!("udp_packet builds IPv4 packets");
    };

    let builder = etherparse::PacketBuilder::ipv4(src.ip().octets(), dst.ip().octets(), 64)
        .udp(src.port(), dst.port());
    let mut bytes = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut bytes, payload).expect("building packet");

    QueuedPacket {
        ct_state,
        payload: bytes,
    }
}

/// Build a plain IPv4/TCP data packet between the two addresses.
pub(crate) fn ip_packet(src: &str, dst: &str) -> QueuedPacket {
    let src: std::net::Ipv4Addr = src.parse().expect("src ip");
    let dst: std::net::Ipv4Addr = dst.parse().expect("dst ip");

    let builder =
        etherparse::PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(43210, 443, 1, 0x8000);
    let payload = b"\x16\x03\x01";
    let mut bytes = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut bytes, payload).expect("building packet");

    QueuedPacket {
        ct_state: None,
        payload: bytes,
    }
}

/// Scriptable in-memory resolver.
#[derive(Default, Clone)]
pub(crate) struct MockResolver {
    inner: Arc<MockResolverInner>,
}

#[derive(Default)]
struct MockResolverInner {
    ips: Mutex<HashMap<String, Vec<IpAddr>>>,
    ptr: Mutex<HashMap<IpAddr, Vec<String>>>,
    fail: AtomicBool,
    reverse_calls: AtomicUsize,
}

impl MockResolver {
    pub(crate) fn with_ips(self, hostname: &str, addrs: &[IpAddr]) -> Self {
        self.inner
            .ips
            .lock()
            .insert(hostname.to_string(), addrs.to_vec());
        self
    }

    pub(crate) fn with_ptr(self, addr: IpAddr, names: &[&str]) -> Self {
        self.inner
            .ptr
            .lock()
            .insert(addr, names.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Make every lookup fail with a resolver error.
    pub(crate) fn failing(self) -> Self {
        self.inner.fail.store(true, Ordering::Relaxed);
        self
    }

    pub(crate) fn reverse_calls(&self) -> usize {
        self.inner.reverse_calls.load(Ordering::Relaxed)
    }
}

impl HostResolver for MockResolver {
    fn lookup_ips(&self, hostname: &str, _family: IpFamily) -> Result<Vec<IpAddr>> {
        if self.inner.fail.load(Ordering::Relaxed) {
            return Err(Error::resolve(hostname, "mock failure"));
        }
        Ok(self
            .inner
            .ips
            .lock()
            .get(hostname)
            .cloned()
            .unwrap_or_default())
    }

    fn reverse_lookup(&self, addr: IpAddr) -> Result<Vec<String>> {
        self.inner.reverse_calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.fail.load(Ordering::Relaxed) {
            return Err(Error::resolve(addr.to_string(), "mock failure"));
        }
        Ok(self
            .inner
            .ptr
            .lock()
            .get(&addr)
            .cloned()
            .unwrap_or_default())
    }
}
