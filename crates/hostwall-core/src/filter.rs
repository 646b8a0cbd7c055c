//! Per-filter packet decisions
//!
//! A [`Filter`] is the runtime instance of one configured policy: its
//! DNS-request gate, its traffic gate, the caches binding the two
//! together, and the optional background task keeping configured
//! hostnames resolved.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::Name;
use nfq::Verdict;
use tracing::{debug, error, info, warn};

use crate::cache::TimedCache;
use crate::config::FilterOptions;
use crate::conntrack;
use crate::error::Result;
use crate::packet::{decode_dns_packet, decode_ip_packet, ConnectionId, IpFamily};
use crate::queue::{PacketHandler, QueueWorker, QueuedPacket};
use crate::resolver::HostResolver;
use crate::sync::{ReadySignal, ShutdownToken};

/// How long an outstanding DNS query may wait for its reply.
pub(crate) const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack added on top of the refresh interval when caching hostname
/// lookups, so entries survive until the next refresh lands.
const RECACHE_TTL_SLACK: Duration = Duration::from_secs(60);

/// Runtime state of one configured filter.
pub struct Filter {
    inner: Arc<FilterInner>,
    dns_worker: Option<QueueWorker>,
    traffic_worker: Option<QueueWorker>,
    precache: Option<JoinHandle<()>>,
    shutdown: ShutdownToken,
}

/// State shared between a filter's handlers and the response handler.
pub(crate) struct FilterInner {
    pub(crate) opts: FilterOptions,
    pub(crate) family: IpFamily,
    pub(crate) is_self_filter: bool,

    pub(crate) dns_ready: ReadySignal,
    pub(crate) traffic_ready: ReadySignal,

    /// DNS queries allowed out and awaiting their reply.
    pub(crate) pending: TimedCache<ConnectionId>,
    /// IPs general traffic may reach. Present iff a traffic queue exists.
    pub(crate) allowed_ips: Option<TimedCache<IpAddr>>,
    /// Hostnames allowed beyond the configured list (CNAME/SRV targets).
    /// Present iff a traffic queue exists; the self-filter never has one.
    pub(crate) additional_hostnames: Option<TimedCache<String>>,

    pub(crate) resolver: Arc<dyn HostResolver>,
}

impl Filter {
    /// Bring one filter up: open its queues, signal their readiness and
    /// start the pre-cache task if configured.
    pub fn start(
        opts: FilterOptions,
        family: IpFamily,
        is_self_filter: bool,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self> {
        let has_traffic_queue = opts.traffic_queue != 0;

        let inner = Arc::new(FilterInner {
            opts,
            family,
            is_self_filter,
            dns_ready: ReadySignal::new(),
            traffic_ready: ReadySignal::new(),
            pending: TimedCache::new("pending-queries"),
            allowed_ips: has_traffic_queue.then(|| TimedCache::new("allowed-ips")),
            additional_hostnames: has_traffic_queue.then(|| TimedCache::new("additional-hostnames")),
            resolver,
        });

        let shutdown = ShutdownToken::new();
        let mut filter = Self {
            inner: inner.clone(),
            dns_worker: None,
            traffic_worker: None,
            precache: None,
            shutdown,
        };

        if has_traffic_queue {
            filter.traffic_worker = Some(QueueWorker::spawn(
                "traffic",
                inner.opts.traffic_queue,
                TrafficHandler {
                    filter: inner.clone(),
                },
            )?);
            inner.traffic_ready.signal();

            if !inner.opts.cached_hostnames.is_empty() {
                let task_inner = inner.clone();
                let task_shutdown = filter.shutdown.clone();
                filter.precache = Some(std::thread::spawn(move || {
                    cache_hostnames(&task_inner, &task_shutdown);
                }));
            }
        }

        if inner.opts.dns_queue != 0 {
            filter.dns_worker = Some(QueueWorker::spawn(
                "dns-req",
                inner.opts.dns_queue,
                DnsRequestHandler {
                    filter: inner.clone(),
                },
            )?);
            inner.dns_ready.signal();
        }

        Ok(filter)
    }

    pub(crate) fn inner(&self) -> Arc<FilterInner> {
        self.inner.clone()
    }

    /// Tear the filter down: finish the background task, close the
    /// queues, stop the caches.
    pub fn close(&mut self) {
        self.shutdown.trigger();
        if let Some(task) = self.precache.take() {
            let _ = task.join();
        }

        if let Some(mut worker) = self.dns_worker.take() {
            worker.close();
        }
        if let Some(mut worker) = self.traffic_worker.take() {
            worker.close();
        }

        self.inner.pending.stop();
        if let Some(cache) = &self.inner.allowed_ips {
            cache.stop();
        }
        if let Some(cache) = &self.inner.additional_hostnames {
            cache.stop();
        }
    }
}

impl FilterInner {
    /// Hostname allow rules: exact match against the configured list, a
    /// dot-separated suffix match (`foo.example.com` matches
    /// `example.com`, `fooexample.com` does not), or presence in the
    /// additional-hostnames cache. The self-filter has no such cache and
    /// never consults one.
    pub(crate) fn hostname_allowed(&self, hostname: &str) -> bool {
        for allowed in &self.opts.allowed_hostnames {
            if hostname == allowed {
                return true;
            }
            if hostname.len() > allowed.len() + 1
                && hostname.ends_with(allowed)
                && hostname.as_bytes()[hostname.len() - allowed.len() - 1] == b'.'
            {
                return true;
            }
        }

        if self.is_self_filter {
            return false;
        }

        match &self.additional_hostnames {
            Some(cache) => cache.exists(&hostname.to_string()),
            None => false,
        }
    }

    /// Check that every question of a DNS message asks for an allowed
    /// hostname. A message without questions fails.
    pub(crate) fn validate_questions(&self, msg: &Message) -> bool {
        if msg.header().query_count() == 0 {
            // a DNS request with no questions is nonsense, drop it
            info!(filter = %self.opts.name, "dropping DNS request with no questions");
            return false;
        }

        for query in msg.queries() {
            let name = dns_name_string(query.name());
            if !self.hostname_allowed(&name) {
                info!(filter = %self.opts.name, question = %name, "dropping DNS request");
                return false;
            }
        }

        true
    }

    /// Traffic gate: a packet passes if either endpoint is an allowed
    /// IP, or (opt-in) if a reverse lookup of a non-private endpoint
    /// yields an allowed hostname.
    fn validate_ips(&self, src: IpAddr, dst: IpAddr) -> Result<bool> {
        let Some(allowed_ips) = &self.allowed_ips else {
            return Ok(false);
        };

        // destination first, outbound is the common case
        if allowed_ips.exists(&dst) {
            return Ok(true);
        }

        let allowed = allowed_ips.exists(&src);
        if !self.opts.lookup_unknown_ips || allowed {
            return Ok(allowed);
        }

        if !is_private(dst) && self.lookup_and_validate_ip(dst)? {
            return Ok(true);
        }
        if !is_private(src) {
            return self.lookup_and_validate_ip(src);
        }

        Ok(false)
    }

    fn lookup_and_validate_ip(&self, ip: IpAddr) -> Result<bool> {
        info!(filter = %self.opts.name, ip = %ip, "performing reverse IP lookup");
        let names = self.resolver.reverse_lookup(ip)?;

        let ttl = self.opts.allow_answers_for.unwrap_or_default();
        for name in &names {
            let name = name.strip_suffix('.').unwrap_or(name);
            if self.hostname_allowed(name) {
                info!(filter = %self.opts.name, ip = %ip, ?ttl, "allowing IP after reverse lookup");
                if let Some(allowed_ips) = &self.allowed_ips {
                    allowed_ips.add(ip, ttl);
                }
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Gate for outbound DNS requests on a filter's `dnsQueue`.
pub(crate) struct DnsRequestHandler {
    pub(crate) filter: Arc<FilterInner>,
}

impl PacketHandler for DnsRequestHandler {
    fn decide(&self, pkt: &QueuedPacket) -> Option<Verdict> {
        self.filter.dns_ready.wait();
        let f = &self.filter;

        let state = pkt.ct_state?;

        // requests must come from a new or established connection;
        // reply-side states stay allowed for re-used UDP sockets
        if matches!(state.0, conntrack::IS_REPLY | conntrack::RELATED_REPLY) {
            debug!(
                filter = %f.opts.name,
                conn.state = state.0,
                "DNS request with reply-side connection state"
            );
        }
        if !state.is_new() && !state.is_established() {
            warn!(
                filter = %f.opts.name,
                conn.state = state.0,
                "dropping DNS request with unknown connection state"
            );
            return Some(Verdict::Drop);
        }

        let (msg, conn_id) = match decode_dns_packet(&pkt.payload, f.family, false) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(filter = %f.opts.name, error = %e, "error parsing DNS packet");
                return None;
            }
        };

        // replies have no business on the request queue
        if msg.header().answer_count() > 0 {
            warn!(
                filter = %f.opts.name,
                conn.id = %conn_id,
                "dropping DNS reply sent to DNS request filter"
            );
            return Some(Verdict::Drop);
        }

        if !f.opts.allow_all_hostnames && !f.validate_questions(&msg) {
            return Some(Verdict::Drop);
        }

        info!(
            filter = %f.opts.name,
            conn.id = %conn_id,
            questions = ?question_strings(&msg),
            "allowing DNS request"
        );

        // the reply must find this entry, so record it before accepting
        debug!(filter = %f.opts.name, conn.id = %conn_id, "adding connection");
        f.pending.add(conn_id, DNS_QUERY_TIMEOUT);

        Some(Verdict::Accept)
    }

    fn verdict_failed(&self, pkt: &QueuedPacket) {
        // the accept never reached the kernel; retract the pending entry
        if let Ok((_, conn_id)) = decode_dns_packet(&pkt.payload, self.filter.family, false) {
            debug!(filter = %self.filter.opts.name, conn.id = %conn_id, "removing connection");
            self.filter.pending.remove(&conn_id);
        }
    }
}

/// Gate for general traffic on a filter's `trafficQueue`.
pub(crate) struct TrafficHandler {
    pub(crate) filter: Arc<FilterInner>,
}

impl PacketHandler for TrafficHandler {
    fn decide(&self, pkt: &QueuedPacket) -> Option<Verdict> {
        self.filter.traffic_ready.wait();
        let f = &self.filter;

        let (src, dst) = match decode_ip_packet(&pkt.payload, f.family) {
            Ok(addrs) => addrs,
            Err(e) => {
                error!(filter = %f.opts.name, error = %e, "error parsing packet");
                return None;
            }
        };

        match f.validate_ips(src, dst) {
            Ok(true) => {
                info!(filter = %f.opts.name, conn.src = %src, conn.dst = %dst, "allowing packet");
                Some(Verdict::Accept)
            }
            Ok(false) => {
                info!(filter = %f.opts.name, conn.src = %src, conn.dst = %dst, "dropping packet");
                Some(Verdict::Drop)
            }
            Err(e) => {
                error!(
                    filter = %f.opts.name,
                    conn.src = %src,
                    conn.dst = %dst,
                    error = %e,
                    "error validating IPs"
                );
                Some(Verdict::Drop)
            }
        }
    }
}

/// Background refresh of `cachedHostnames`: resolve each name and keep
/// its addresses allowed until one refresh past the next run.
fn cache_hostnames(inner: &FilterInner, shutdown: &ShutdownToken) {
    debug!(filter = %inner.opts.name, "starting cache loop");

    let interval = inner.opts.re_cache_every.unwrap_or_default();
    let ttl = interval + RECACHE_TTL_SLACK;

    loop {
        for hostname in &inner.opts.cached_hostnames {
            info!(filter = %inner.opts.name, hostname = %hostname, "caching lookup of hostname");

            let addrs = match inner.resolver.lookup_ips(hostname, inner.family) {
                Ok(addrs) if addrs.is_empty() => {
                    warn!(filter = %inner.opts.name, hostname = %hostname, "could not resolve hostname");
                    continue;
                }
                Ok(addrs) => addrs,
                Err(e) => {
                    error!(
                        filter = %inner.opts.name,
                        hostname = %hostname,
                        error = %e,
                        "error resolving hostname"
                    );
                    continue;
                }
            };

            let Some(allowed_ips) = &inner.allowed_ips else {
                continue;
            };
            for addr in addrs {
                info!(filter = %inner.opts.name, ip = %addr, ?ttl, "allowing IP from cached lookup");
                allowed_ips.add(addr, ttl);

                // an IPv4-mapped IPv6 answer will most likely be used
                // in its unmapped form, allow that too
                if let IpAddr::V6(v6) = addr {
                    if let Some(v4) = v6.to_ipv4_mapped() {
                        info!(filter = %inner.opts.name, ip = %v4, ?ttl, "allowing IP from cached lookup");
                        allowed_ips.add(IpAddr::V4(v4), ttl);
                    }
                }
            }
        }

        if shutdown.wait_timeout(interval) {
            debug!(filter = %inner.opts.name, "exiting cache loop");
            return;
        }
    }
}

/// Render a wire name the way configs spell hostnames: UTF-8, no
/// trailing root dot.
pub(crate) fn dns_name_string(name: &Name) -> String {
    let mut s = name.to_utf8();
    if s.ends_with('.') {
        s.pop();
    }
    s
}

pub(crate) fn question_strings(msg: &Message) -> Vec<String> {
    msg.queries()
        .iter()
        .map(|q| format!("{}: {}", dns_name_string(q.name()), q.query_type()))
        .collect()
}

/// RFC 1918 / unique-local addresses are never reverse-resolved.
fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => v6.is_unique_local(),
    }
}
