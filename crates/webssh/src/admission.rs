//! Admission checks on peer addresses.
//!
//! Policy storage lives outside this crate. The gateway and the daemon only
//! ask a filter whether an address may open a session.

use std::collections::HashSet;
use std::net::IpAddr;

/// Decides whether a peer address may open a session.
pub trait AdmissionFilter: Send + Sync {
    /// Returns `true` to allow `ip`.
    fn admit(&self, ip: IpAddr) -> bool;
}

/// Admits every address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AdmissionFilter for AllowAll {
    fn admit(&self, _ip: IpAddr) -> bool {
        true
    }
}

/// Admits only the listed addresses.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: HashSet<IpAddr>,
}

impl AllowList {
    /// Creates an empty list, which admits nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an address.
    pub fn allow(mut self, ip: IpAddr) -> Self {
        self.allowed.insert(ip);
        self
    }
}

impl FromIterator<IpAddr> for AllowList {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self {
            allowed: iter.into_iter().collect(),
        }
    }
}

impl AdmissionFilter for AllowList {
    fn admit(&self, ip: IpAddr) -> bool {
        self.allowed.contains(&ip)
    }
}

impl<F> AdmissionFilter for F
where
    F: Fn(IpAddr) -> bool + Send + Sync,
{
    fn admit(&self, ip: IpAddr) -> bool {
        self(ip)
    }
}
