//! Filter manager and the shared DNS-response gate
//!
//! All filters share one inbound queue for DNS replies. A reply is only
//! honoured if some filter let the matching request out; the answers it
//! carries then widen that filter's allow caches.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use hickory_proto::rr::RData;
use nfq::Verdict;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::filter::{dns_name_string, question_strings, Filter, FilterInner};
use crate::packet::{decode_dns_packet, IpFamily};
use crate::queue::{PacketHandler, QueueWorker, QueuedPacket};
use crate::resolver::HostResolver;
use crate::sync::ReadySignal;

/// Owns every filter plus the shared DNS-response queue.
pub struct FilterManager {
    inner: Arc<ManagerInner>,
    response_worker: Option<QueueWorker>,
    filters: Vec<Filter>,
}

pub(crate) struct ManagerInner {
    family: IpFamily,
    ready: ReadySignal,
    /// Set exactly once, before `ready` fires; the response handler
    /// iterates it without locking.
    filters: OnceLock<Vec<Arc<FilterInner>>>,
}

impl FilterManager {
    /// Start the engine: the shared response queue first, then every
    /// configured filter in order, then the readiness signal that lets
    /// the response handler run.
    pub fn start(config: &Config, resolver: Arc<dyn HostResolver>) -> Result<Self> {
        let inner = Arc::new(ManagerInner {
            family: config.family(),
            ready: ReadySignal::new(),
            filters: OnceLock::new(),
        });

        let mut response_worker = QueueWorker::spawn(
            "dns-resp",
            config.inbound_dns_queue,
            DnsResponseHandler {
                manager: inner.clone(),
            },
        )?;

        let mut filters: Vec<Filter> = Vec::with_capacity(config.filters.len());
        for opts in &config.filters {
            let is_self_filter = config.is_self_filter(opts);
            match Filter::start(opts.clone(), config.family(), is_self_filter, resolver.clone()) {
                Ok(filter) => filters.push(filter),
                Err(e) => {
                    error!(filter = %opts.name, error = %e, "error starting filter");
                    // unblock the response handler (it will find no
                    // filters and withhold verdicts), then tear down
                    inner.ready.signal();
                    response_worker.close();
                    for filter in &mut filters {
                        filter.close();
                    }
                    return Err(e);
                }
            }
        }

        let shared: Vec<Arc<FilterInner>> = filters.iter().map(Filter::inner).collect();
        let _ = inner.filters.set(shared);
        // every filter is fully wired; unblock the response handler
        inner.ready.signal();

        info!(filters = filters.len(), "all filters started");

        Ok(Self {
            inner,
            response_worker: Some(response_worker),
            filters,
        })
    }

    /// Stop the engine: the response queue first, then each filter.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.response_worker.take() {
            worker.close();
        }
        for filter in &mut self.filters {
            filter.close();
        }
    }
}

impl Drop for FilterManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Gate for inbound DNS replies on the shared queue.
pub(crate) struct DnsResponseHandler {
    pub(crate) manager: Arc<ManagerInner>,
}

impl PacketHandler for DnsResponseHandler {
    fn decide(&self, pkt: &QueuedPacket) -> Option<Verdict> {
        self.manager.ready.wait();

        let state = pkt.ct_state?;

        // Only replies on established connections are honoured: a local
        // attacker must not be able to unlock arbitrary IPs by injecting
        // a crafted "response" that was never requested.
        if !state.is_established() {
            warn!(
                conn.state = state.0,
                "dropping DNS response that is not from an established connection"
            );
            return Some(Verdict::Drop);
        }

        let (msg, conn_id) = match decode_dns_packet(&pkt.payload, self.manager.family, true) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "error parsing DNS packet");
                return None;
            }
        };

        let filters = self.manager.filters.get()?;
        let Some(owner) = filters.iter().find(|f| f.pending.exists(&conn_id)) else {
            warn!(
                conn.id = %conn_id,
                questions = ?question_strings(&msg),
                "dropping DNS response from unknown connection"
            );
            return Some(Verdict::Drop);
        };

        debug!(conn.id = %conn_id, filter = %owner.opts.name, "removing connection");
        owner.pending.remove(&conn_id);

        if !owner.opts.allow_all_hostnames {
            // requests for disallowed hostnames never get out, so this
            // should always pass; check anyway
            if !owner.validate_questions(&msg) {
                return Some(Verdict::Drop);
            }

            // the self-filter's own lookups are recorded by the task
            // that requested them, never from reply contents
            if !owner.is_self_filter && msg.header().answer_count() > 0 {
                harvest_answers(owner, &msg);
            }
        }

        Some(Verdict::Accept)
    }
}

/// Record a validated reply's answers: addresses become allowed IPs,
/// alias targets become additionally allowed hostnames. Everything
/// expires after the filter's `allowAnswersFor`, regardless of the
/// record TTLs the server chose.
fn harvest_answers(filter: &FilterInner, msg: &hickory_proto::op::Message) {
    let ttl = filter.opts.allow_answers_for.unwrap_or_default();

    for answer in msg.answers() {
        match answer.data() {
            Some(RData::A(a)) => {
                let ip = IpAddr::V4(a.0);
                info!(filter = %filter.opts.name, answer.ip = %ip, ?ttl, "allowing IP from DNS reply");
                if let Some(allowed_ips) = &filter.allowed_ips {
                    allowed_ips.add(ip, ttl);
                }
            }
            Some(RData::AAAA(aaaa)) => {
                let ip = IpAddr::V6(aaaa.0);
                info!(filter = %filter.opts.name, answer.ip = %ip, ?ttl, "allowing IP from DNS reply");
                if let Some(allowed_ips) = &filter.allowed_ips {
                    allowed_ips.add(ip, ttl);
                }
            }
            Some(RData::CNAME(cname)) => {
                let name = dns_name_string(&cname.0);
                info!(filter = %filter.opts.name, answer.name = %name, ?ttl, "allowing hostname from DNS reply");
                if let Some(additional) = &filter.additional_hostnames {
                    additional.add(name, ttl);
                }
            }
            Some(RData::SRV(srv)) => {
                let name = dns_name_string(srv.target());
                info!(filter = %filter.opts.name, answer.name = %name, ?ttl, "allowing hostname from DNS reply");
                if let Some(additional) = &filter.additional_hostnames {
                    additional.add(name, ttl);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterOptions;
    use crate::conntrack::{self, ConnState};
    use crate::filter::tests::test_filter;
    use crate::filter::{DnsRequestHandler, DNS_QUERY_TIMEOUT};
    use crate::testutil::{dns_query, dns_reply, dns_reply_with, udp_packet, Answer, MockResolver};
    use std::time::Duration;

    const CLIENT: &str = "10.0.0.2:40000";
    const SERVER: &str = "10.0.0.53:53";

    fn options(name: &str, allowed: &[&str]) -> FilterOptions {
        FilterOptions {
            name: name.to_string(),
            dns_queue: 1000,
            traffic_queue: 1001,
            allowed_hostnames: allowed.iter().map(|s| s.to_string()).collect(),
            allow_answers_for: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    fn test_manager(filters: Vec<Arc<FilterInner>>) -> DnsResponseHandler {
        let inner = Arc::new(ManagerInner {
            family: IpFamily::V4,
            ready: ReadySignal::new(),
            filters: OnceLock::new(),
        });
        let _ = inner.filters.set(filters);
        inner.ready.signal();
        DnsResponseHandler { manager: inner }
    }

    fn established() -> Option<ConnState> {
        Some(ConnState(conntrack::ESTABLISHED_REPLY))
    }

    /// Send a request through the filter so its reply has a pending entry.
    fn admit_request(filter: &Arc<FilterInner>, name: &str) {
        let handler = DnsRequestHandler {
            filter: filter.clone(),
        };
        let pkt = udp_packet(
            CLIENT,
            SERVER,
            &dns_query(name),
            Some(ConnState(conntrack::NEW)),
        );
        assert_eq!(handler.decide(&pkt), Some(Verdict::Accept));
    }

    #[test]
    fn test_matched_reply_allows_ips() {
        let filter = test_filter(options("web", &["example.com"]), MockResolver::default());
        admit_request(&filter, "a.b.example.com");

        let handler = test_manager(vec![filter.clone()]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        // record TTL 30s, but allowAnswersFor (10s) is what sticks
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("a.b.example.com", &[ip], 30),
            established(),
        );

        assert_eq!(handler.decide(&reply), Some(Verdict::Accept));
        assert!(filter.pending.is_empty());
        assert!(filter.allowed_ips.as_ref().unwrap().exists(&ip));
    }

    #[test]
    fn test_answer_ttl_uses_configured_clamp() {
        let mut opts = options("web", &["example.com"]);
        opts.allow_answers_for = Some(Duration::from_millis(30));
        let filter = test_filter(opts, MockResolver::default());
        admit_request(&filter, "example.com");

        let handler = test_manager(vec![filter.clone()]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("example.com", &[ip], 3600),
            established(),
        );
        assert_eq!(handler.decide(&reply), Some(Verdict::Accept));

        let allowed_ips = filter.allowed_ips.as_ref().unwrap();
        assert!(allowed_ips.exists(&ip));
        std::thread::sleep(Duration::from_millis(60));
        // the hour-long record TTL did not outlive the clamp
        assert!(!allowed_ips.exists(&ip));
    }

    #[test]
    fn test_forged_reply_dropped() {
        let filter = test_filter(options("web", &["example.com"]), MockResolver::default());
        let handler = test_manager(vec![filter.clone()]);

        // no request was ever admitted for this exchange
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("example.com", &[ip], 30),
            established(),
        );

        assert_eq!(handler.decide(&reply), Some(Verdict::Drop));
        assert!(!filter.allowed_ips.as_ref().unwrap().exists(&ip));
    }

    #[test]
    fn test_non_established_reply_dropped() {
        let filter = test_filter(options("web", &["example.com"]), MockResolver::default());
        admit_request(&filter, "example.com");

        let handler = test_manager(vec![filter.clone()]);
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("example.com", &["1.2.3.4".parse().unwrap()], 30),
            Some(ConnState(conntrack::NEW)),
        );

        assert_eq!(handler.decide(&reply), Some(Verdict::Drop));
        // the pending entry survives; only a matched reply consumes it
        assert_eq!(filter.pending.len(), 1);
    }

    #[test]
    fn test_missing_conn_state_is_noop() {
        let filter = test_filter(options("web", &["example.com"]), MockResolver::default());
        let handler = test_manager(vec![filter.clone()]);

        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("example.com", &["1.2.3.4".parse().unwrap()], 30),
            None,
        );
        assert_eq!(handler.decide(&reply), None);
    }

    #[test]
    fn test_first_matching_filter_owns_reply() {
        let first = test_filter(options("first", &["example.com"]), MockResolver::default());
        let second = test_filter(
            FilterOptions {
                name: "second".to_string(),
                dns_queue: 2000,
                traffic_queue: 2001,
                allowed_hostnames: vec!["example.com".to_string()],
                allow_answers_for: Some(Duration::from_secs(10)),
                ..Default::default()
            },
            MockResolver::default(),
        );

        // both filters saw an identical exchange; list order wins
        admit_request(&first, "example.com");
        second
            .pending
            .add(first_pending_id(&first), DNS_QUERY_TIMEOUT);

        let handler = test_manager(vec![first.clone(), second.clone()]);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("example.com", &[ip], 30),
            established(),
        );
        assert_eq!(handler.decide(&reply), Some(Verdict::Accept));

        assert!(first.pending.is_empty());
        assert!(first.allowed_ips.as_ref().unwrap().exists(&ip));
        // the second filter's entry is untouched
        assert_eq!(second.pending.len(), 1);
        assert!(!second.allowed_ips.as_ref().unwrap().exists(&ip));
    }

    fn first_pending_id(filter: &Arc<FilterInner>) -> crate::packet::ConnectionId {
        let (_, id) = decode_dns_packet(
            &udp_packet(CLIENT, SERVER, &dns_query("example.com"), None).payload,
            IpFamily::V4,
            false,
        )
        .unwrap();
        assert!(filter.pending.exists(&id));
        id
    }

    #[test]
    fn test_cname_and_srv_extend_hostnames() {
        let filter = test_filter(options("web", &["example.com"]), MockResolver::default());
        admit_request(&filter, "example.com");

        let handler = test_manager(vec![filter.clone()]);
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply_with(
                "example.com",
                &[
                    Answer::Cname("edge.cdn.net"),
                    Answer::Srv("sip.example.org"),
                    Answer::A("1.2.3.4".parse().unwrap()),
                ],
                30,
            ),
            established(),
        );
        assert_eq!(handler.decide(&reply), Some(Verdict::Accept));

        let additional = filter.additional_hostnames.as_ref().unwrap();
        assert!(additional.exists(&"edge.cdn.net".to_string()));
        assert!(additional.exists(&"sip.example.org".to_string()));
        assert!(filter
            .allowed_ips
            .as_ref()
            .unwrap()
            .exists(&"1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn test_self_filter_reply_not_harvested() {
        let opts = FilterOptions {
            name: "self".to_string(),
            dns_queue: 100,
            allowed_hostnames: vec!["deb.debian.org".to_string()],
            ..Default::default()
        };
        let has_no_traffic_queue = opts.traffic_queue == 0;
        assert!(has_no_traffic_queue);

        let self_filter = Arc::new(FilterInner {
            opts,
            family: IpFamily::V4,
            is_self_filter: true,
            dns_ready: ReadySignal::new(),
            traffic_ready: ReadySignal::new(),
            pending: crate::cache::TimedCache::new("pending-queries"),
            allowed_ips: None,
            additional_hostnames: None,
            resolver: Arc::new(MockResolver::default()),
        });
        self_filter.dns_ready.signal();
        admit_request(&self_filter, "deb.debian.org");

        let handler = test_manager(vec![self_filter.clone()]);
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply_with(
                "deb.debian.org",
                &[
                    Answer::Cname("debian.map.fastly.net"),
                    Answer::A("151.101.1.0".parse().unwrap()),
                ],
                30,
            ),
            established(),
        );

        // the reply passes, but nothing is recorded anywhere
        assert_eq!(handler.decide(&reply), Some(Verdict::Accept));
        assert!(self_filter.pending.is_empty());
        assert!(self_filter.allowed_ips.is_none());
        assert!(self_filter.additional_hostnames.is_none());
    }

    #[test]
    fn test_reply_question_revalidated() {
        let filter = test_filter(options("web", &["example.com"]), MockResolver::default());

        // force a pending entry for an exchange whose question is not
        // allowed, as if the config changed between request and reply
        let id = decode_dns_packet(
            &udp_packet(CLIENT, SERVER, &dns_query("evil.net"), None).payload,
            IpFamily::V4,
            false,
        )
        .unwrap()
        .1;
        filter.pending.add(id, DNS_QUERY_TIMEOUT);

        let handler = test_manager(vec![filter.clone()]);
        let ip: IpAddr = "6.6.6.6".parse().unwrap();
        let reply = udp_packet(SERVER, CLIENT, &dns_reply("evil.net", &[ip], 30), established());

        assert_eq!(handler.decide(&reply), Some(Verdict::Drop));
        assert!(!filter.allowed_ips.as_ref().unwrap().exists(&ip));
    }

    #[test]
    fn test_allow_all_filter_skips_harvest() {
        let opts = FilterOptions {
            name: "open".to_string(),
            dns_queue: 1000,
            allow_all_hostnames: true,
            ..Default::default()
        };
        let filter = test_filter(opts, MockResolver::default());
        admit_request(&filter, "anything.net");

        let handler = test_manager(vec![filter.clone()]);
        let reply = udp_packet(
            SERVER,
            CLIENT,
            &dns_reply("anything.net", &["5.5.5.5".parse().unwrap()], 30),
            established(),
        );
        assert_eq!(handler.decide(&reply), Some(Verdict::Accept));
    }
}
