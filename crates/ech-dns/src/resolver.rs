//! Secure name resolution with HTTPS resource records (RFC 9460).
//!
//! [`Resolver::resolve`] turns a hostname, `host:port`, or URI into a
//! [`ResolveResult`]: addresses, service-mode HTTPS records sorted by
//! priority, and the resolved addresses of the records' target names.
//! AliasMode records are chased (bounded, loop-detected); per-key results
//! are cached by TTL with single-flight deduplication.
//!
//! [`ResolveResult::targets`] then iterates dialing [`Target`]s in
//! preference order, carrying each target's ECH config list and ALPN set.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::time::Instant;

use crate::cache::{CacheValue, DnsCache};
use crate::message::{
    HttpsRecord, Message, RData, TYPE_A, TYPE_AAAA, TYPE_CNAME, TYPE_HTTPS,
};
use crate::transport::{DnsTransport, DohTransport};
use crate::{DnsError, DnsResult};

/// AliasMode chains longer than this are abandoned.
const MAX_ALIAS_HOPS: usize = 5;
/// Queries are padded to a multiple of this (RFC 8467).
const QUERY_PAD_BLOCK: usize = 128;

/// The shared default resolver (Cloudflare DoH), lazily initialized.
pub fn default_resolver() -> Arc<Resolver> {
    static DEFAULT: Lazy<Arc<Resolver>> = Lazy::new(|| Arc::new(Resolver::cloudflare()));
    DEFAULT.clone()
}

/// A parsed resolver input: hostname, `host:port`, or URI.
///
/// Port precedence is URI port, then `host:port` port, then the scheme
/// default (80 for http, 443 for https and unknown schemes). `http` is
/// normalized to `https`: HTTPS resource records always imply https.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn parse(input: &str) -> DnsResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DnsError::InvalidName("empty address".into()));
        }
        let (raw_scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => (String::new(), input),
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();

        let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, after) = stripped
                .split_once(']')
                .ok_or_else(|| DnsError::InvalidName(format!("unclosed bracket: {input}")))?;
            (host.to_string(), after.strip_prefix(':').map(str::to_string))
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && !host.contains(':')
            {
                (host.to_string(), Some(port.to_string()))
            } else {
                // A bare IPv6 literal, not a port suffix.
                (authority.to_string(), None)
            }
        } else {
            (authority.to_string(), None)
        };
        if host.is_empty() {
            return Err(DnsError::InvalidName(format!("no host in {input:?}")));
        }

        let default_port = match raw_scheme.as_str() {
            "http" => 80,
            _ => 443,
        };
        let port = match port_str {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| DnsError::InvalidName(format!("bad port in {input:?}")))?,
            None => default_port,
        };
        let scheme = if raw_scheme.is_empty() || raw_scheme == "http" {
            "https".to_string()
        } else {
            raw_scheme
        };
        Ok(HostPort {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// The HTTPS-RR query name per RFC 9460 §2.3.
    pub fn qname(&self) -> String {
        if self.scheme == "https" {
            if self.port == 80 || self.port == 443 {
                self.host.clone()
            } else {
                format!("_{}._https.{}", self.port, self.host)
            }
        } else if self.port == 443 {
            format!("_{}.{}", self.scheme, self.host)
        } else {
            format!("_{}._{}.{}", self.port, self.scheme, self.host)
        }
    }
}

/// One connection candidate produced from a [`ResolveResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: SocketAddr,
    /// The ECH config list from the HTTPS record, if any.
    pub ech: Option<Vec<u8>>,
    pub alpn: Vec<String>,
}

/// The outcome of resolving one input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveResult {
    pub port: u16,
    /// A and AAAA addresses of the (post-alias) owner name.
    pub address: Vec<IpAddr>,
    /// Service-mode HTTPS records, priority ascending.
    pub https: Vec<HttpsRecord>,
    /// Resolved addresses of the HTTPS records' target names.
    pub additional: HashMap<String, Vec<IpAddr>>,
}

impl ResolveResult {
    /// The first non-empty ECH config list among the HTTPS records.
    pub fn ech_config_list(&self) -> Option<&[u8]> {
        self.https
            .iter()
            .find(|h| !h.ech.is_empty())
            .map(|h| h.ech.as_slice())
    }

    /// Iterates dial targets in preference order: service-mode records by
    /// priority, then the plain addresses when no record yielded anything.
    /// Targets are deduplicated by `(ip, port)` and filtered by the address
    /// family of `network` (`tcp4`/`udp4`, `tcp6`/`udp6`, or both).
    pub fn targets(&self, network: &str) -> impl Iterator<Item = Target> {
        let mut out: Vec<Target> = Vec::new();
        let mut seen: HashSet<SocketAddr> = HashSet::new();
        for rr in &self.https {
            if rr.priority == 0 {
                continue;
            }
            let port = if rr.port != 0 {
                rr.port
            } else if self.port == 80 {
                // HTTPS records imply https.
                443
            } else {
                self.port
            };
            let mut alpn = rr.alpn.clone();
            if !rr.no_default_alpn && !alpn.iter().any(|p| p == "http/1.1") {
                alpn.push("http/1.1".to_string());
            }
            let ech = (!rr.ech.is_empty()).then(|| rr.ech.clone());
            let target_name = normalize_name(&rr.target);
            let addresses: Vec<IpAddr> = if !target_name.is_empty() {
                self.additional
                    .get(&target_name)
                    .cloned()
                    .unwrap_or_default()
            } else if !self.address.is_empty() {
                self.address.clone()
            } else {
                rr.ipv4_hint
                    .iter()
                    .copied()
                    .map(IpAddr::V4)
                    .chain(rr.ipv6_hint.iter().copied().map(IpAddr::V6))
                    .collect()
            };
            for ip in addresses {
                let address = SocketAddr::new(ip, port);
                if family_allows(network, &ip) && seen.insert(address) {
                    out.push(Target {
                        address,
                        ech: ech.clone(),
                        alpn: alpn.clone(),
                    });
                }
            }
        }
        if out.is_empty() {
            for ip in &self.address {
                let address = SocketAddr::new(*ip, self.port);
                if family_allows(network, ip) && seen.insert(address) {
                    out.push(Target {
                        address,
                        ech: None,
                        alpn: Vec::new(),
                    });
                }
            }
        }
        out.into_iter()
    }
}

fn family_allows(network: &str, ip: &IpAddr) -> bool {
    if network.ends_with('4') {
        ip.is_ipv4()
    } else if network.ends_with('6') {
        ip.is_ipv6()
    } else {
        true
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// A DNS-over-HTTPS resolver with HTTPS-RR support and a TTL cache.
pub struct Resolver {
    transport: Arc<dyn DnsTransport>,
    cache: DnsCache,
}

impl Resolver {
    /// A resolver for any RFC 8484 DoH service URL (https only).
    pub fn new(url: &str) -> DnsResult<Self> {
        Ok(Self::with_transport(Arc::new(DohTransport::new(url)?)))
    }

    /// A resolver over a custom transport (tests, DoH3, ...).
    pub fn with_transport(transport: Arc<dyn DnsTransport>) -> Self {
        Self {
            transport,
            cache: DnsCache::new(),
        }
    }

    /// Cloudflare public DoH.
    pub fn cloudflare() -> Self {
        Self::new("https://1.1.1.1/dns-query").expect("well-formed built-in url")
    }

    /// Google public DoH.
    pub fn google() -> Self {
        Self::new("https://dns.google/dns-query").expect("well-formed built-in url")
    }

    /// Wikimedia public DoH.
    pub fn wikimedia() -> Self {
        Self::new("https://wikimedia-dns.org/dns-query").expect("well-formed built-in url")
    }

    /// Resizes the lookup cache; 0 disables caching.
    pub fn set_cache_size(&self, size: usize) {
        self.cache.set_capacity(size);
    }

    /// Resolves a hostname, `host:port`, or URI.
    pub async fn resolve(&self, name: &str) -> DnsResult<ResolveResult> {
        let hp = HostPort::parse(name)?;
        let mut result = ResolveResult {
            port: hp.port,
            ..ResolveResult::default()
        };
        if hp.host == "localhost" {
            result.address = vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ];
            return Ok(result);
        }
        if let Ok(ip) = hp.host.parse::<IpAddr>() {
            result.address.push(ip);
            return Ok(result);
        }

        // HTTPS records first, chasing AliasMode targets.
        let mut owner = hp.host.clone();
        let mut qname = hp.qname();
        let mut visited: HashSet<String> = HashSet::new();
        let mut hops = 0usize;
        loop {
            if !visited.insert(qname.clone()) {
                return Err(DnsError::InvalidName(format!("HTTPS alias loop at {qname}")));
            }
            let answers = match self.resolve_one(&qname, TYPE_HTTPS).await {
                Ok(answers) => answers,
                // HTTPS records are optional.
                Err(DnsError::NonExistentDomain) => Vec::new(),
                Err(e) => return Err(e),
            };
            let mut records: Vec<HttpsRecord> = answers
                .into_iter()
                .filter_map(|data| match data {
                    RData::Https(h) => Some(h),
                    _ => None,
                })
                .collect();
            if records.is_empty() {
                break;
            }
            if records[0].priority == 0 {
                let target = normalize_name(&records[0].target);
                if target.is_empty() {
                    // AliasMode with an empty target: no HTTPS records
                    // apply to this name.
                    break;
                }
                hops += 1;
                if hops > MAX_ALIAS_HOPS {
                    return Err(DnsError::InvalidName(format!(
                        "too many HTTPS alias redirections for {}",
                        hp.host
                    )));
                }
                tracing::debug!(
                    target: "ech_dns::resolver",
                    from = %qname,
                    to = %target,
                    "following HTTPS alias"
                );
                owner = target.clone();
                qname = target;
                continue;
            }
            records.sort_by_key(|r| r.priority);
            result.https = records;
            break;
        }

        // Resolve each service-mode target name; failures here only cost
        // that entry.
        for rr in &result.https {
            let target = normalize_name(&rr.target);
            if target.is_empty() {
                continue;
            }
            let mut ips: Vec<IpAddr> = Vec::new();
            for qtype in [TYPE_A, TYPE_AAAA] {
                if let Ok(answers) = self.resolve_one(&target, qtype).await {
                    ips.extend(answers.iter().filter_map(RData::as_ip));
                }
            }
            if !ips.is_empty() {
                result.additional.insert(target, ips);
            }
        }

        // A/AAAA on the final owner name.
        let mut lookup_err: Option<DnsError> = None;
        for qtype in [TYPE_A, TYPE_AAAA] {
            match self.resolve_one(&owner, qtype).await {
                Ok(answers) => result
                    .address
                    .extend(answers.iter().filter_map(RData::as_ip)),
                Err(e) => lookup_err = Some(e),
            }
        }
        if result.address.is_empty() {
            if let Some(err) = lookup_err {
                let other_sources = !result.additional.is_empty()
                    || result
                        .https
                        .iter()
                        .any(|h| !h.ipv4_hint.is_empty() || !h.ipv6_hint.is_empty());
                if !other_sources {
                    return Err(err);
                }
            }
        }
        Ok(result)
    }

    /// One `(name, qtype)` lookup through the cache. Concurrent callers for
    /// the same key share a single network round-trip.
    pub(crate) async fn resolve_one(&self, name: &str, qtype: u16) -> DnsResult<Vec<RData>> {
        let key = (normalize_name(name), qtype);
        let Some(slot) = self.cache.slot(&key) else {
            return self.fetch(&key.0, qtype).await.map(|(records, _)| records);
        };
        let mut state = slot.lock.lock().await;
        if let Some(value) = &state.value {
            if state.expires_at > Instant::now() {
                return match value {
                    CacheValue::Records(records) => Ok(records.clone()),
                    CacheValue::NxDomain => Err(DnsError::NonExistentDomain),
                };
            }
        }
        match self.fetch(&key.0, qtype).await {
            Ok((records, min_ttl)) => {
                let ttl = match (&records[..], min_ttl) {
                    ([], _) | (_, None) => self.cache.negative_ttl(),
                    (_, Some(ttl)) => Duration::from_secs(u64::from(ttl)),
                };
                state.value = Some(CacheValue::Records(records.clone()));
                state.expires_at = Instant::now() + ttl;
                Ok(records)
            }
            Err(DnsError::NonExistentDomain) => {
                state.value = Some(CacheValue::NxDomain);
                state.expires_at = Instant::now() + self.cache.negative_ttl();
                Err(DnsError::NonExistentDomain)
            }
            // Transport failures are not cached.
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, name: &str, qtype: u16) -> DnsResult<(Vec<RData>, Option<u32>)> {
        let query = Message::query(name, qtype).encode_padded(QUERY_PAD_BLOCK)?;
        let response = self.transport.query(&query).await?;
        let msg = Message::decode(&response)?;
        if msg.rcode != 0 {
            return Err(DnsError::from_rcode(msg.rcode));
        }
        // Accept answers for the queried name, following CNAME links within
        // the response.
        let mut want = name.to_string();
        let mut records = Vec::new();
        let mut min_ttl: Option<u32> = None;
        for rr in &msg.answer {
            if normalize_name(&rr.name) != want {
                continue;
            }
            if rr.typ == qtype {
                min_ttl = Some(min_ttl.map_or(rr.ttl, |t| t.min(rr.ttl)));
                records.push(rr.data.clone());
            } else if rr.typ == TYPE_CNAME {
                if let RData::Name(target) = &rr.data {
                    min_ttl = Some(min_ttl.map_or(rr.ttl, |t| t.min(rr.ttl)));
                    want = normalize_name(target);
                }
            }
        }
        tracing::debug!(
            target: "ech_dns::resolver",
            name,
            qtype,
            answers = records.len(),
            "lookup"
        );
        Ok((records, min_ttl))
    }
}
