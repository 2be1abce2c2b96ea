use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use once_cell::sync::Lazy;
use tracing::warn;

use super::GateRejection;

/// An IPv4 network in `a.b.c.d/len` form. A bare address parses as a /32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            network,
            prefix_len: prefix_len.min(32),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.prefix_len));
        (u32::from(addr) & mask) == (u32::from(self.network) & mask)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (addr_part, len_part) = match raw.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (raw, None),
        };
        let network: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| format!("invalid network address {:?}", raw))?;
        let prefix_len = match len_part {
            Some(l) => l
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= 32)
                .ok_or_else(|| format!("invalid prefix length in {:?}", raw))?,
            None => 32,
        };
        Ok(Cidr::new(network, prefix_len))
    }
}

/// Loopback, RFC 1918, link-local, and CGNAT ranges. An address in one of
/// these is always treated as a reverse-proxy hop, never as a client.
static PRIVATE_RANGES: Lazy<Vec<Cidr>> = Lazy::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "100.64.0.0/10",
    ]
    .iter()
    .map(|c| c.parse().expect("static range"))
    .collect()
});

/// Cloudflare's published IPv4 ranges; traffic may legitimately arrive
/// through them when the service sits behind the CDN.
static CDN_RANGES: Lazy<Vec<Cidr>> = Lazy::new(|| {
    [
        "173.245.48.0/20",
        "103.21.244.0/22",
        "103.22.200.0/22",
        "103.31.4.0/22",
        "141.101.64.0/18",
        "108.162.192.0/18",
        "190.93.240.0/20",
        "188.114.96.0/20",
        "197.234.240.0/22",
        "198.41.128.0/17",
        "162.158.0.0/15",
        "104.16.0.0/13",
        "104.24.0.0/14",
        "172.64.0.0/13",
        "131.0.72.0/22",
    ]
    .iter()
    .map(|c| c.parse().expect("static range"))
    .collect()
});

/// YooKassa's published notification source ranges.
static YOOKASSA_RANGES: Lazy<Vec<Cidr>> = Lazy::new(|| {
    [
        "185.71.76.0/27",
        "185.71.77.0/27",
        "77.75.153.0/25",
        "77.75.156.11",
        "77.75.156.35",
        "77.75.154.128/25",
    ]
    .iter()
    .map(|c| c.parse().expect("static range"))
    .collect()
});

/// Source-address gate for an IP-authenticated provider.
#[derive(Debug, Clone)]
pub struct IpGate {
    label: &'static str,
    trusted_proxies: Vec<Cidr>,
    allow_list: Vec<Cidr>,
}

impl IpGate {
    /// Gate for YooKassa notifications. `extra_proxies` and `extra_allowed`
    /// come from configuration and extend the built-in lists.
    pub fn yookassa(extra_proxies: &[String], extra_allowed: &[String]) -> Self {
        let mut allow_list = YOOKASSA_RANGES.clone();
        allow_list.extend(parse_configured(extra_allowed, "yookassa allow-list"));
        Self {
            label: "yookassa",
            trusted_proxies: parse_configured(extra_proxies, "trusted proxies"),
            allow_list,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Resolve the true source address and check it against the allow-list.
    ///
    /// The forwarded-for chain is walked from the rightmost (nearest) entry
    /// backward; an address counts as passthrough only when it is a known
    /// reverse-proxy network. Headers are ignored entirely when the direct
    /// transport peer is itself not a trusted proxy: an untrusted peer can
    /// forge any header it likes.
    pub fn check(&self, peer: IpAddr, forwarded_chain: &[&str]) -> Result<Ipv4Addr, GateRejection> {
        let peer_v4 = match as_ipv4(peer) {
            Some(v4) => v4,
            None => {
                return Err(GateRejection::DisallowedSource {
                    resolved: peer.to_string(),
                    candidates: vec![peer.to_string()],
                })
            }
        };

        let mut candidates = vec![peer_v4.to_string()];
        let resolved = if !self.is_trusted_proxy(peer_v4) {
            peer_v4
        } else {
            self.walk_chain(peer_v4, forwarded_chain, &mut candidates)?
        };

        if self.allow_list.iter().any(|c| c.contains(resolved)) {
            Ok(resolved)
        } else {
            warn!(
                provider = self.label,
                resolved = %resolved,
                candidates = ?candidates,
                "webhook source address rejected"
            );
            Err(GateRejection::DisallowedSource {
                resolved: resolved.to_string(),
                candidates,
            })
        }
    }

    fn is_trusted_proxy(&self, addr: Ipv4Addr) -> bool {
        PRIVATE_RANGES.iter().any(|c| c.contains(addr))
            || CDN_RANGES.iter().any(|c| c.contains(addr))
            || self.trusted_proxies.iter().any(|c| c.contains(addr))
    }

    fn walk_chain(
        &self,
        peer: Ipv4Addr,
        forwarded_chain: &[&str],
        candidates: &mut Vec<String>,
    ) -> Result<Ipv4Addr, GateRejection> {
        let mut last_trusted = peer;
        for entry in forwarded_chain.iter().rev() {
            let trimmed = entry.trim();
            let addr: Ipv4Addr = trimmed.parse().map_err(|_| GateRejection::MalformedChain {
                entry: trimmed.to_string(),
            })?;
            candidates.push(addr.to_string());
            if self.is_trusted_proxy(addr) {
                last_trusted = addr;
                continue;
            }
            return Ok(addr);
        }
        // Every hop was a recognized proxy; the leftmost one is the best
        // available answer and will normally fail the allow-list.
        Ok(last_trusted)
    }
}

fn as_ipv4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn parse_configured(raw: &[String], what: &str) -> Vec<Cidr> {
    raw.iter()
        .filter_map(|entry| match entry.parse::<Cidr>() {
            Ok(cidr) => Some(cidr),
            Err(err) => {
                warn!("ignoring invalid {} entry {:?}: {}", what, entry, err);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> IpGate {
        IpGate::yookassa(&["203.0.113.0/24".to_string()], &[])
    }

    fn peer(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn cidr_membership() {
        let cidr: Cidr = "185.71.76.0/27".parse().unwrap();
        assert!(cidr.contains("185.71.76.29".parse().unwrap()));
        assert!(!cidr.contains("185.71.76.32".parse().unwrap()));
        let single: Cidr = "77.75.156.11".parse().unwrap();
        assert!(single.contains("77.75.156.11".parse().unwrap()));
        assert!(!single.contains("77.75.156.12".parse().unwrap()));
    }

    #[test]
    fn direct_peer_in_allow_list_is_accepted_without_headers() {
        let resolved = gate().check(peer("185.71.76.5"), &[]).unwrap();
        assert_eq!(resolved, "185.71.76.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn untrusted_peer_ignores_forged_headers() {
        // The header claims a legitimate provider address, but the peer is
        // not a trusted proxy so the header must be ignored.
        let err = gate()
            .check(peer("198.51.100.7"), &["185.71.76.5"])
            .unwrap_err();
        assert!(matches!(err, GateRejection::DisallowedSource { .. }));
    }

    #[test]
    fn chain_is_unwound_through_trusted_proxies() {
        // peer is a local nginx, then a configured proxy hop, then the real
        // provider source.
        let resolved = gate()
            .check(peer("127.0.0.1"), &["185.71.76.5", "203.0.113.9"])
            .unwrap();
        assert_eq!(resolved, "185.71.76.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn trusted_peer_with_disallowed_origin_is_rejected() {
        let err = gate()
            .check(peer("127.0.0.1"), &["8.8.8.8"])
            .unwrap_err();
        match err {
            GateRejection::DisallowedSource { resolved, .. } => assert_eq!(resolved, "8.8.8.8"),
            other => panic!("unexpected rejection: {:?}", other),
        }
    }

    #[test]
    fn malformed_chain_fails_closed() {
        let err = gate()
            .check(peer("127.0.0.1"), &["185.71.76.5", "not-an-ip"])
            .unwrap_err();
        assert!(matches!(err, GateRejection::MalformedChain { .. }));
    }

    #[test]
    fn absent_chain_falls_back_to_peer() {
        // Trusted local peer with no forwarded-for header resolves to itself
        // and is rejected by the allow-list.
        let err = gate().check(peer("127.0.0.1"), &[]).unwrap_err();
        assert!(matches!(err, GateRejection::DisallowedSource { .. }));
    }
}
