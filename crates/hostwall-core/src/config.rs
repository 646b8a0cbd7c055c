//! Configuration management
//!
//! Parses the TOML configuration, enforces the cross-field rules the
//! engine depends on, and synthesizes the `self` filter that governs
//! the engine's own DNS lookups.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::packet::IpFamily;

/// Name of the synthesized filter for the engine's own DNS traffic.
pub const SELF_FILTER_NAME: &str = "self";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Queue number receiving DNS replies, shared by all filters.
    #[serde(rename = "inboundDNSQueue", default)]
    pub inbound_dns_queue: u16,

    /// Queue number carrying the engine's own DNS lookups.
    #[serde(rename = "selfDNSQueue", default)]
    pub self_dns_queue: u16,

    /// Address family of every queue.
    #[serde(default)]
    pub ipv6: bool,

    /// Per-filter policies, applied in order.
    #[serde(default)]
    pub filters: Vec<FilterOptions>,
}

/// Immutable policy of one filter.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct FilterOptions {
    /// Unique name, used in logs and error messages.
    #[serde(default)]
    pub name: String,

    /// Queue receiving this filter's outbound DNS requests. Zero means
    /// the filter has no DNS queue.
    #[serde(rename = "dnsQueue", default)]
    pub dns_queue: u16,

    /// Queue receiving this filter's general traffic. Zero means the
    /// filter only gates DNS.
    #[serde(rename = "trafficQueue", default)]
    pub traffic_queue: u16,

    /// Accept every DNS request without inspecting questions.
    #[serde(rename = "allowAllHostnames", default)]
    pub allow_all_hostnames: bool,

    /// Reverse-resolve unknown IPs before giving up on a traffic packet.
    #[serde(rename = "lookupUnknownIPs", default)]
    pub lookup_unknown_ips: bool,

    /// Hostnames requests may ask for; subdomains match implicitly.
    #[serde(rename = "allowedHostnames", default)]
    pub allowed_hostnames: Vec<String>,

    /// Hostnames resolved periodically in the background so their IPs
    /// stay allowed without client DNS traffic.
    #[serde(rename = "cachedHostnames", default)]
    pub cached_hostnames: Vec<String>,

    /// How long DNS answers stay allowed, regardless of record TTLs.
    #[serde(
        rename = "allowAnswersFor",
        default,
        deserialize_with = "duration::deserialize"
    )]
    pub allow_answers_for: Option<Duration>,

    /// Interval between cached-hostname refreshes.
    #[serde(
        rename = "reCacheEvery",
        default,
        deserialize_with = "duration::deserialize"
    )]
    pub re_cache_every: Option<Duration>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from a TOML string, validate it and
    /// synthesize the self-filter.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        config.synthesize_self_filter();
        Ok(config)
    }

    /// Address family shared by all queues.
    pub fn family(&self) -> IpFamily {
        if self.ipv6 {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    /// True when `opts` is the synthesized self-filter of this config.
    pub fn is_self_filter(&self, opts: &FilterOptions) -> bool {
        self.self_dns_queue != 0 && opts.dns_queue == self.self_dns_queue
    }

    fn validate(&self) -> Result<()> {
        if self.filters.is_empty() {
            return Err(Error::config("at least one filter must be specified"));
        }
        if self.inbound_dns_queue == 0 {
            return Err(Error::config(r#""inboundDNSQueue" must be set"#));
        }
        if self.self_dns_queue != 0 && self.self_dns_queue == self.inbound_dns_queue {
            return Err(Error::config(
                r#""inboundDNSQueue" and "selfDNSQueue" must be different"#,
            ));
        }

        let mut self_queue_needed = false;
        for (i, filter) in self.filters.iter().enumerate() {
            filter
                .validate()
                .map_err(|e| Error::config(format!("{}: {e}", filter.label(i))))?;

            for (j, other) in self.filters.iter().enumerate().take(i) {
                if filter.name == other.name {
                    return Err(Error::config(format!(
                        r#"filter #{i}: filter name "{}" is already used by filter #{j}"#,
                        filter.name
                    )));
                }
                if filter.dns_queue != 0 && filter.dns_queue == other.dns_queue {
                    return Err(Error::config(format!(
                        r#"filter "{}": dnsQueue {} is already used by filter "{}""#,
                        filter.name, filter.dns_queue, other.name
                    )));
                }
                if filter.traffic_queue != 0 && filter.traffic_queue == other.traffic_queue {
                    return Err(Error::config(format!(
                        r#"filter "{}": trafficQueue {} is already used by filter "{}""#,
                        filter.name, filter.traffic_queue, other.name
                    )));
                }
            }

            if filter.lookup_unknown_ips || !filter.cached_hostnames.is_empty() {
                self_queue_needed = true;
            }
        }

        if self.self_dns_queue != 0 && !self_queue_needed {
            return Err(Error::config(
                r#""selfDNSQueue" must only be set when at least one filter either sets "lookupUnknownIPs" to true or "cachedHostnames" is not empty"#,
            ));
        }
        if self.self_dns_queue == 0 && self_queue_needed {
            return Err(Error::config(
                r#""selfDNSQueue" must be set when at least one filter either sets "lookupUnknownIPs" to true or "cachedHostnames" is not empty"#,
            ));
        }

        Ok(())
    }

    /// When the engine resolves hostnames itself, its DNS requests
    /// traverse `selfDNSQueue` and must pass a filter like everyone
    /// else's. That filter is synthesized here and prepended: it may ask
    /// for every cached hostname, plus the reverse-lookup zones when any
    /// filter resolves unknown IPs.
    fn synthesize_self_filter(&mut self) {
        if self.self_dns_queue == 0 {
            return;
        }

        let mut allowed_hostnames = Vec::new();
        if self.filters.iter().any(|f| f.lookup_unknown_ips) {
            allowed_hostnames.push("in-addr.arpa".to_string());
            allowed_hostnames.push("ip6.arpa".to_string());
        }
        for filter in &self.filters {
            allowed_hostnames.extend(filter.cached_hostnames.iter().cloned());
        }

        self.filters.insert(
            0,
            FilterOptions {
                name: SELF_FILTER_NAME.to_string(),
                dns_queue: self.self_dns_queue,
                allowed_hostnames,
                ..Default::default()
            },
        );
    }
}

impl FilterOptions {
    fn label(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("filter #{index}")
        } else {
            format!(r#"filter "{}""#, self.name)
        }
    }

    /// True when this filter has no hostname list of its own and exists
    /// purely for cached-hostname or reverse-lookup driven allowances.
    fn passive(&self) -> bool {
        self.allowed_hostnames.is_empty()
            && (!self.cached_hostnames.is_empty() || self.lookup_unknown_ips)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err(r#""name" must be set"#.to_string());
        }
        if self.dns_queue == 0 && !self.passive() {
            return Err(r#""dnsQueue" must be set"#.to_string());
        }
        if self.traffic_queue == 0 && !self.allow_all_hostnames {
            return Err(r#""trafficQueue" must be set"#.to_string());
        }
        if self.dns_queue != 0 && self.dns_queue == self.traffic_queue {
            return Err(r#""dnsQueue" and "trafficQueue" must be different"#.to_string());
        }
        if self.allow_all_hostnames && self.traffic_queue != 0 {
            return Err(
                r#""trafficQueue" must not be set when "allowAllHostnames" is true"#.to_string(),
            );
        }
        if self.allow_all_hostnames {
            if !self.allowed_hostnames.is_empty() {
                return Err(
                    r#""allowedHostnames" must be empty when "allowAllHostnames" is true"#
                        .to_string(),
                );
            }
            if self.allow_answers_for.is_some() {
                return Err(
                    r#""allowAnswersFor" must not be set when "allowAllHostnames" is true"#
                        .to_string(),
                );
            }
            if !self.cached_hostnames.is_empty() {
                return Err(
                    r#""cachedHostnames" must be empty when "allowAllHostnames" is true"#
                        .to_string(),
                );
            }
        } else {
            if self.allowed_hostnames.is_empty() && !self.passive() {
                return Err(r#""allowedHostnames" must not be empty"#.to_string());
            }
            if !self.allowed_hostnames.is_empty() && self.allow_answers_for.is_none() {
                return Err(
                    r#""allowAnswersFor" must be set when "allowedHostnames" is not empty"#
                        .to_string(),
                );
            }
        }
        if !self.cached_hostnames.is_empty() && self.re_cache_every.is_none() {
            return Err(
                r#""reCacheEvery" must be set when "cachedHostnames" is not empty"#.to_string(),
            );
        }
        if self.cached_hostnames.is_empty() && self.re_cache_every.is_some() {
            return Err(
                r#""reCacheEvery" must not be set when "cachedHostnames" is empty"#.to_string(),
            );
        }
        if self.dns_queue != 0 && self.passive() {
            return Err(
                r#""dnsQueue" must not be set when "allowedHostnames" is empty and either "cachedHostnames" is not empty or "lookupUnknownIPs" is true"#
                    .to_string(),
            );
        }

        Ok(())
    }
}

/// Serde support for duration strings like `"30s"`, `"5m"` or `"1h30m"`.
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(s) => parse(&s).map(Some).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse(input: &str) -> Result<Duration, String> {
        let s = input.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        let mut chars = s.char_indices().peekable();
        while chars.peek().is_some() {
            let start = chars.peek().map(|(i, _)| *i).unwrap_or_default();
            let mut end = start;
            while let Some((i, c)) = chars.peek().copied() {
                if c.is_ascii_digit() {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            if end == start {
                return Err(format!("invalid duration {input:?}"));
            }
            let number: u64 = s[start..end]
                .parse()
                .map_err(|_| format!("invalid duration {input:?}"))?;

            let unit_start = end;
            let mut unit_end = unit_start;
            while let Some((i, c)) = chars.peek().copied() {
                if c.is_ascii_alphabetic() {
                    unit_end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            total += match &s[unit_start..unit_end] {
                "ms" => Duration::from_millis(number),
                "s" => Duration::from_secs(number),
                "m" => Duration::from_secs(number * 60),
                "h" => Duration::from_secs(number * 3600),
                _ => return Err(format!("invalid duration unit in {input:?}")),
            };
        }

        Ok(total)
    }
}
