//! Upstream host and IP matching

use crate::config::RepositoryConfig;
use crate::error::ValidationError;
use ipnet::IpNet;
use std::net::IpAddr;
use wildmatch::WildMatch;

/// Decides which upstream proxies an access code may point at
#[derive(Debug, Clone, Default)]
pub struct UpstreamFilter {
    patterns: Vec<WildMatch>,
    ranges: Vec<IpNet>,
}

impl UpstreamFilter {
    /// Create a filter that permits every upstream
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the repository's allow lists
    pub fn from_config(config: &RepositoryConfig) -> Result<Self, ValidationError> {
        let mut filter = Self::new();

        for pattern in &config.allowed_hosts {
            filter.add_pattern(pattern);
        }

        for cidr in &config.allowed_ranges {
            let range = cidr
                .parse::<IpNet>()
                .map_err(|_| ValidationError::InvalidCidr { cidr: cidr.clone() })?;
            filter.add_range(range);
        }

        Ok(filter)
    }

    /// Add a wildcard pattern for host matching
    pub fn add_pattern(&mut self, pattern: &str) {
        self.patterns.push(WildMatch::new(&pattern.to_ascii_lowercase()));
    }

    /// Add a CIDR range
    pub fn add_range(&mut self, range: IpNet) {
        self.ranges.push(range);
    }

    /// True when no allow rules are configured
    pub fn is_open(&self) -> bool {
        self.patterns.is_empty() && self.ranges.is_empty()
    }

    /// Check whether an upstream given by host name and resolved address
    /// is permitted
    pub fn allows(&self, host: &str, ip: IpAddr) -> bool {
        if self.is_open() {
            return true;
        }

        let host = host.to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
            || self.ranges.iter().any(|net| net.contains(&ip))
    }
}
