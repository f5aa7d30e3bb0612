use std::fmt;

use serde::{Deserialize, Serialize};

/// A condition that must hold before a daemon is considered usable.
///
/// Daemons declare a set of checks; the readiness prober removes each one as
/// it is satisfied and reports the daemon ready once none remain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// A TCP port on `localhost` that must accept connections.
    Port(u16),
    /// A peer identifier that must appear in the joined-peers listing.
    PeerName(String),
}

impl ReadinessCheck {
    /// Builds a port check.
    #[must_use]
    pub const fn port(port: u16) -> Self {
        Self::Port(port)
    }

    /// Builds a peer-name check.
    #[must_use]
    pub fn peer(name: impl Into<String>) -> Self {
        Self::PeerName(name.into())
    }
}

impl fmt::Display for ReadinessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "port:{port}"),
            Self::PeerName(name) => write!(f, "peer:{name}"),
        }
    }
}
