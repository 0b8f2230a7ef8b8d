//! CIDR matching and ordered IP access rules.
//!
//! Rules are evaluated in the order the administrator defined them; the
//! first rule whose network contains the client address decides the outcome
//! (whitelist permits, blacklist forbids). An address no rule contains is
//! permitted.

use std::{net::IpAddr, str::FromStr};

use crate::core::domain::{IpRule, RuleKind};

/// CIDR network representation
#[derive(Debug, Clone)]
pub struct IpNetwork {
    /// Base IP address
    addr: IpAddr,
    /// Prefix length (e.g., 24 for /24)
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a new IP network from an address and prefix length
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        match addr {
            IpAddr::V4(_) if prefix_len > 32 => {
                return Err("IPv4 prefix length must be <= 32".to_string());
            }
            IpAddr::V6(_) if prefix_len > 128 => {
                return Err("IPv6 prefix length must be <= 128".to_string());
            }
            _ => {}
        }

        Ok(Self { addr, prefix_len })
    }

    /// Parse from CIDR notation (e.g., "192.168.1.0/24"). A bare address is
    /// treated as a single-host network (/32 or /128).
    pub fn parse(s: &str) -> Result<Self, String> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len: u8 = prefix_str
                .parse()
                .map_err(|e| format!("Invalid prefix length: {e}"))?;
            Self::new(addr, prefix_len)
        } else {
            let addr = IpAddr::from_str(s).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self { addr, prefix_len })
        }
    }

    /// Check if an IP address is contained in this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        // IPs must be same version
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let net_bits = u32::from(net);
                let addr_bits = u32::from(addr);
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                (net_bits & mask) == (addr_bits & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let net_bits = u128::from(net);
                let addr_bits = u128::from(addr);
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                (net_bits & mask) == (addr_bits & mask)
            }
            _ => false,
        }
    }
}

impl std::str::FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::parse(s)
    }
}

/// Outcome of evaluating a client address against a rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Permit,
    Deny,
}

/// Evaluate `rules` in order for `ip`. The first containing rule is
/// authoritative; no match permits.
pub fn evaluate(rules: &[IpRule], ip: IpAddr) -> Access {
    for rule in rules {
        if rule.cidr.contains(ip) {
            return match rule.kind {
                RuleKind::Whitelist => Access::Permit,
                RuleKind::Blacklist => Access::Deny,
            };
        }
    }
    Access::Permit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(cidr: &str, kind: RuleKind) -> IpRule {
        IpRule {
            cidr: IpNetwork::parse(cidr).expect("valid cidr"),
            kind,
            description: String::new(),
        }
    }

    #[test]
    fn test_ipnetwork_v4_contains() {
        let network = IpNetwork::parse("192.168.1.0/24").expect("valid network");
        assert!(network.contains("192.168.1.1".parse().expect("valid ip")));
        assert!(network.contains("192.168.1.255".parse().expect("valid ip")));
        assert!(!network.contains("192.168.2.1".parse().expect("valid ip")));
    }

    #[test]
    fn test_ipnetwork_v6_contains() {
        let network = IpNetwork::parse("2001:db8::/32").expect("valid network");
        assert!(network.contains("2001:db8::1".parse().expect("valid ip")));
        assert!(!network.contains("2001:db9::1".parse().expect("valid ip")));
    }

    #[test]
    fn test_ipnetwork_single_ip() {
        let network = IpNetwork::parse("192.168.1.1").expect("valid network");
        assert!(network.contains("192.168.1.1".parse().expect("valid ip")));
        assert!(!network.contains("192.168.1.2".parse().expect("valid ip")));
    }

    #[test]
    fn test_ipnetwork_version_mismatch() {
        let network = IpNetwork::parse("10.0.0.0/8").expect("valid network");
        assert!(!network.contains("::1".parse().expect("valid ip")));
    }

    #[test]
    fn blacklist_match_denies() {
        let rules = vec![rule("203.0.113.0/24", RuleKind::Blacklist)];
        assert_eq!(evaluate(&rules, "203.0.113.7".parse().unwrap()), Access::Deny);
        assert_eq!(
            evaluate(&rules, "198.51.100.7".parse().unwrap()),
            Access::Permit
        );
    }

    #[test]
    fn first_containing_rule_wins() {
        // Whitelist listed first shadows the broader blacklist behind it.
        let rules = vec![
            rule("203.0.113.0/28", RuleKind::Whitelist),
            rule("203.0.113.0/24", RuleKind::Blacklist),
        ];
        assert_eq!(
            evaluate(&rules, "203.0.113.7".parse().unwrap()),
            Access::Permit
        );
        assert_eq!(
            evaluate(&rules, "203.0.113.200".parse().unwrap()),
            Access::Deny
        );

        // Reversed order, reversed outcome for the overlapping range.
        let reversed = vec![
            rule("203.0.113.0/24", RuleKind::Blacklist),
            rule("203.0.113.0/28", RuleKind::Whitelist),
        ];
        assert_eq!(
            evaluate(&reversed, "203.0.113.7".parse().unwrap()),
            Access::Deny
        );
    }

    #[test]
    fn no_match_permits() {
        let rules = vec![rule("10.0.0.0/8", RuleKind::Whitelist)];
        assert_eq!(
            evaluate(&rules, "192.0.2.1".parse().unwrap()),
            Access::Permit
        );
    }

    #[test]
    fn empty_rules_permit() {
        assert_eq!(evaluate(&[], "192.0.2.1".parse().unwrap()), Access::Permit);
    }
}
