use crate::domain_utils::DomainUtils;
use serde::{Serialize, Serializer};
use std::net::IpAddr;

/// One string evaluated against the blocklist: a host name or an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    value: String,
    address: Option<IpAddr>,
}

impl Candidate {
    pub fn new(value: &str) -> Self {
        match DomainUtils::parse_address(value) {
            Some(addr) => Candidate {
                value: addr.to_string(),
                address: Some(addr),
            },
            None => Candidate {
                value: DomainUtils::normalize_host(value),
                address: None,
            },
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn is_address(&self) -> bool {
        self.address.is_some()
    }
}

impl Serialize for Candidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

/// Everything known about one domain lookup: the domain itself, its MX
/// hosts and the addresses of both, in discovery order and without
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateSet {
    domain: String,
    items: Vec<Candidate>,
    degraded: bool,
}

impl CandidateSet {
    pub fn new(domain: &str) -> Self {
        let domain = Candidate::new(domain);
        CandidateSet {
            domain: domain.value().to_string(),
            items: vec![domain],
            degraded: false,
        }
    }

    /// Add a candidate unless an equal one is already present
    pub fn insert(&mut self, value: &str) -> bool {
        let candidate = Candidate::new(value);
        if candidate.value().is_empty() || self.items.contains(&candidate) {
            return false;
        }
        self.items.push(candidate);
        true
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when every DNS lookup failed and the set is just the domain
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn values(&self) -> Vec<&str> {
        self.items.iter().map(Candidate::value).collect()
    }
}
