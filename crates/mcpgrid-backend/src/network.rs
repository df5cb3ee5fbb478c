//! Subnet selection for the shared platform network.
//!
//! The docker backend creates one bridge network for all deployments. Its
//! subnet is chosen by scanning the subnets already present on the host and
//! picking the first free /24 inside a rotating set of private /16
//! supernets. The walk is deterministic given the existing set: candidates
//! are tried numerically lowest first, so tests (and operators) can predict
//! the outcome.

use std::net::Ipv4Addr;

use tracing::warn;

/// Default supernets, tried in order until one has a free /24.
pub const DEFAULT_SUPERNETS: &[&str] = &[
    "10.100.0.0/16",
    "10.101.0.0/16",
    "10.102.0.0/16",
    "10.103.0.0/16",
    "10.104.0.0/16",
];

/// An IPv4 CIDR block in canonical form (host bits zeroed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    base: u32,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.trim().split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask = prefix_mask(prefix);
        Some(Self {
            base: u32::from(addr) & mask,
            prefix,
        })
    }

    fn first(&self) -> u32 {
        self.base
    }

    fn last(&self) -> u32 {
        self.base | !prefix_mask(self.prefix)
    }

    pub fn intersects(&self, other: &Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// RFC 1918 private space.
    pub fn is_private(&self) -> bool {
        let octets = Ipv4Addr::from(self.base).octets();
        matches!(octets, [10, ..])
            || matches!(octets, [172, b, ..] if (16..=31).contains(&b))
            || matches!(octets, [192, 168, ..])
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

/// Outcome of subnet selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetChoice {
    /// Create the network with this explicit subnet.
    Subnet(Cidr),
    /// Every candidate pool is taken; create the network without explicit
    /// IPAM and let the runtime pick.
    NoIpam,
}

/// Parse the runtime's existing subnet strings, dropping anything malformed,
/// non-IPv4, or outside private space (each with a warning).
pub fn parse_existing(raw: &[String]) -> Vec<Cidr> {
    let mut parsed = Vec::new();
    for entry in raw {
        if entry.contains(':') {
            warn!(%entry, "ignoring IPv6 subnet");
            continue;
        }
        match Cidr::parse(entry) {
            Some(cidr) if cidr.is_private() => parsed.push(cidr),
            Some(cidr) => warn!(%cidr, "ignoring non-private subnet"),
            None => warn!(%entry, "ignoring malformed subnet"),
        }
    }
    parsed
}

/// Pick the first /24 not intersecting any existing subnet.
///
/// `preferred` (from `MCP_SUBNET`) is tried before the defaults when it is a
/// valid private block; an invalid override is logged and skipped rather
/// than failing the deployment.
pub fn select_subnet(existing: &[Cidr], preferred: Option<&str>) -> SubnetChoice {
    let mut supernets: Vec<Cidr> = Vec::new();

    if let Some(raw) = preferred {
        match Cidr::parse(raw) {
            Some(cidr) if cidr.is_private() && cidr.prefix <= 24 => supernets.push(cidr),
            Some(cidr) => {
                warn!(subnet = %cidr, "MCP_SUBNET override is not a usable private block, falling back");
            }
            None => {
                warn!(subnet = raw, "MCP_SUBNET override is malformed, falling back");
            }
        }
    }

    for default in DEFAULT_SUPERNETS {
        let cidr = Cidr::parse(default).expect("default supernets are well-formed");
        if !supernets.contains(&cidr) {
            supernets.push(cidr);
        }
    }

    for supernet in supernets {
        let step = 1u32 << 8; // one /24
        let mut base = supernet.first();
        loop {
            let candidate = Cidr { base, prefix: 24 };
            if candidate.last() > supernet.last() {
                break;
            }
            if !existing.iter().any(|e| e.intersects(&candidate)) {
                return SubnetChoice::Subnet(candidate);
            }
            let Some(next) = base.checked_add(step) else {
                break;
            };
            base = next;
        }
    }

    warn!("all candidate supernets are occupied, creating network without explicit IPAM");
    SubnetChoice::NoIpam
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidrs(entries: &[&str]) -> Vec<Cidr> {
        entries.iter().map(|s| Cidr::parse(s).unwrap()).collect()
    }

    #[test]
    fn parses_and_canonicalizes() {
        let c = Cidr::parse("10.100.5.17/24").unwrap();
        assert_eq!(c.to_string(), "10.100.5.0/24");
        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("not-a-subnet").is_none());
        assert!(Cidr::parse("10.0.0.0").is_none());
    }

    #[test]
    fn intersection_is_symmetric() {
        let a = Cidr::parse("10.100.0.0/16").unwrap();
        let b = Cidr::parse("10.100.42.0/24").unwrap();
        let c = Cidr::parse("10.101.0.0/24").unwrap();
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
        assert!(!c.intersects(&b));
    }

    #[test]
    fn private_space_detection() {
        assert!(Cidr::parse("10.1.2.0/24").unwrap().is_private());
        assert!(Cidr::parse("172.16.0.0/12").unwrap().is_private());
        assert!(Cidr::parse("172.31.9.0/24").unwrap().is_private());
        assert!(Cidr::parse("192.168.1.0/24").unwrap().is_private());
        assert!(!Cidr::parse("172.32.0.0/16").unwrap().is_private());
        assert!(!Cidr::parse("8.8.8.0/24").unwrap().is_private());
    }

    #[test]
    fn empty_existing_set_picks_first_candidate() {
        let choice = select_subnet(&[], None);
        assert_eq!(
            choice,
            SubnetChoice::Subnet(Cidr::parse("10.100.0.0/24").unwrap())
        );
    }

    #[test]
    fn skips_occupied_blocks_and_fills_the_gap() {
        let existing = cidrs(&["10.100.0.0/24", "10.100.1.0/24", "10.100.3.0/24"]);
        let choice = select_subnet(&existing, Some("10.100.0.0/16"));
        assert_eq!(
            choice,
            SubnetChoice::Subnet(Cidr::parse("10.100.2.0/24").unwrap())
        );
    }

    #[test]
    fn rotates_to_next_supernet_when_preferred_is_full() {
        let existing = cidrs(&["10.100.0.0/16"]);
        let choice = select_subnet(&existing, None);
        assert_eq!(
            choice,
            SubnetChoice::Subnet(Cidr::parse("10.101.0.0/24").unwrap())
        );
    }

    #[test]
    fn exhaustion_of_all_pools_means_no_ipam() {
        let existing = cidrs(&[
            "10.100.0.0/16",
            "10.101.0.0/16",
            "10.102.0.0/16",
            "10.103.0.0/16",
            "10.104.0.0/16",
        ]);
        assert_eq!(select_subnet(&existing, None), SubnetChoice::NoIpam);
    }

    #[test]
    fn malformed_and_ipv6_entries_are_ignored() {
        let raw = vec![
            "10.100.0.0/24".to_string(),
            "garbage".to_string(),
            "fd00::/64".to_string(),
            "8.8.8.0/24".to_string(),
        ];
        let parsed = parse_existing(&raw);
        assert_eq!(parsed, cidrs(&["10.100.0.0/24"]));
    }

    #[test]
    fn invalid_override_falls_back_to_defaults() {
        let choice = select_subnet(&[], Some("not-a-subnet"));
        assert_eq!(
            choice,
            SubnetChoice::Subnet(Cidr::parse("10.100.0.0/24").unwrap())
        );

        let choice = select_subnet(&[], Some("8.0.0.0/16"));
        assert_eq!(
            choice,
            SubnetChoice::Subnet(Cidr::parse("10.100.0.0/24").unwrap())
        );
    }

    #[test]
    fn valid_override_is_tried_first() {
        let choice = select_subnet(&[], Some("192.168.0.0/16"));
        assert_eq!(
            choice,
            SubnetChoice::Subnet(Cidr::parse("192.168.0.0/24").unwrap())
        );
    }

    #[test]
    fn selection_never_returns_an_intersecting_subnet() {
        let existing = cidrs(&[
            "10.100.0.0/24",
            "10.100.128.0/17",
            "10.101.0.0/24",
            "192.168.0.0/16",
        ]);
        match select_subnet(&existing, None) {
            SubnetChoice::Subnet(chosen) => {
                assert!(existing.iter().all(|e| !e.intersects(&chosen)));
            }
            SubnetChoice::NoIpam => panic!("pools are not exhausted"),
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let existing = cidrs(&["10.100.0.0/24", "10.100.2.0/24"]);
        let a = select_subnet(&existing, None);
        let b = select_subnet(&existing, None);
        assert_eq!(a, b);
        assert_eq!(
            a,
            SubnetChoice::Subnet(Cidr::parse("10.100.1.0/24").unwrap())
        );
    }
}
