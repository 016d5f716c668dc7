//! Subnet rule sets and the reject-path list.
//!
//! Both are built once from comma-separated configuration strings and are
//! read-only afterwards.

use ipnet::IpNet;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};
use tracing::info;

use crate::error::RuleError;

/// Reject-path entry meaning "every path".
pub const MATCH_ALL_PATHS: &str = "%%%MATCH_ALL_PATHS%%%";

/// Stand-in for an unconfigured IP list. No reachable client sends from it.
pub const NON_ROUTABLE: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// One CIDR block. The base address is stored with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetRule {
    net: IpNet,
}

impl SubnetRule {
    /// Parses `address[/prefix]`. Without a prefix the rule matches exactly one host.
    pub fn parse(token: &str) -> Result<Self, RuleError> {
        let token = token.trim();
        let (address, prefix) = match token.split_once('/') {
            Some((address, prefix)) => (address.trim(), Some(prefix.trim())),
            None => (token, None),
        };

        let address: IpAddr = address.parse().map_err(|_| RuleError::InvalidAddress {
            rule: token.to_string(),
        })?;
        let prefix_len = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid_prefix(token))?,
            None => host_prefix_len(address),
        };
        let net = IpNet::new(address, prefix_len).map_err(|_| invalid_prefix(token))?;

        Ok(Self { net: net.trunc() })
    }

    /// Exact match on a single address.
    #[must_use]
    pub fn host(address: IpAddr) -> Self {
        Self {
            net: IpNet::from(address),
        }
    }

    #[must_use]
    pub fn base_address(&self) -> IpAddr {
        self.net.network()
    }

    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Addresses of the other family never match.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.net.contains(&ip)
    }
}

impl fmt::Display for SubnetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.net, f)
    }
}

const fn host_prefix_len(address: IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn invalid_prefix(token: &str) -> RuleError {
    RuleError::InvalidPrefix {
        rule: token.to_string(),
    }
}

/// Ordered list of subnet rules. A match anywhere in the list counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<SubnetRule>,
}

impl RuleSet {
    /// Builds a rule set from a comma-separated CIDR list.
    ///
    /// An empty list becomes [`RuleSet::non_routable`], so a missing setting
    /// can never turn into "match everything".
    pub fn build(raw: &str) -> Result<Self, RuleError> {
        let rules = raw
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(SubnetRule::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if rules.is_empty() {
            info!(rule = %NON_ROUTABLE, "No rules configured, using non-routable placeholder");
            return Ok(Self::non_routable());
        }

        for rule in &rules {
            info!(rule = %rule, "Rule added");
        }
        Ok(Self { rules })
    }

    /// The set used when nothing is configured: only `255.255.255.255/32`.
    ///
    /// A client can still put `255.255.255.255` into X-Forwarded-For itself. As
    /// an accept-list placeholder that candidate then matches and is allowed
    /// before any later, deny-listed candidate is looked at.
    #[must_use]
    pub fn non_routable() -> Self {
        Self {
            rules: vec![SubnetRule::host(NON_ROUTABLE)],
        }
    }

    #[must_use]
    pub fn first_match(&self, ip: IpAddr) -> Option<&SubnetRule> {
        self.rules.iter().find(|rule| rule.contains(ip))
    }

    #[must_use]
    pub fn rules(&self) -> &[SubnetRule] {
        &self.rules
    }
}

/// Path segments that make a deny-IP match stick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RejectPaths {
    /// Nothing configured: a deny-IP match always rejects.
    #[default]
    Disabled,
    /// [`MATCH_ALL_PATHS`] was configured: a deny-IP match always rejects.
    MatchAll,
    /// Lower-cased first path segments. A deny-IP match rejects only on one of these.
    Segments(Vec<String>),
}

impl RejectPaths {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let entries: Vec<&str> = raw
            .split(',')
            .map(|entry| entry.trim().trim_matches('/'))
            .filter(|entry| !entry.is_empty())
            .collect();

        if entries.is_empty() {
            return Self::Disabled;
        }
        if entries
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(MATCH_ALL_PATHS))
        {
            info!("Reject paths: all paths");
            return Self::MatchAll;
        }

        let segments: Vec<String> = entries.iter().map(|entry| entry.to_lowercase()).collect();
        info!(paths = ?segments, "Reject paths configured");
        Self::Segments(segments)
    }

    /// Whether the path override is in play, i.e. whether the request path matters.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Whether a deny-IP match on a request for `segment` should be rejected.
    #[must_use]
    pub fn rejects(&self, segment: &str) -> bool {
        match self {
            Self::Disabled | Self::MatchAll => true,
            Self::Segments(segments) => {
                let segment = segment.to_lowercase();
                segments.iter().any(|candidate| *candidate == segment)
            }
        }
    }
}
