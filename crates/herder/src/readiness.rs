//! Decides when a freshly started daemon can actually serve requests.
//!
//! A daemon declares [`ReadinessCheck`]s; the prober polls the pending ones
//! on the cooperative scheduler, removing each as it passes, until none remain
//! or the daemon stops being alive. The caller bounds the wait with a timeout
//! and treats an elapsed timeout as "not ready".

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use herder_config::{ProcessConfig, ReadinessCheck};

use crate::command::CommandError;
use crate::result::ShellResult;

pub(crate) const READINESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::readiness");

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Checks still waiting to pass. Satisfied checks are removed and never
/// re-added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChecks {
    checks: BTreeSet<ReadinessCheck>,
}

impl PendingChecks {
    /// Collects the checks a process declared.
    #[must_use]
    pub fn from_config(config: &ProcessConfig) -> Self {
        config.checks().iter().cloned().collect()
    }

    /// Whether every check has passed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Number of checks still pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether `check` is still pending.
    #[must_use]
    pub fn contains(&self, check: &ReadinessCheck) -> bool {
        self.checks.contains(check)
    }

    /// Marks `check` as satisfied.
    pub fn remove(&mut self, check: &ReadinessCheck) -> bool {
        self.checks.remove(check)
    }

    /// Iterates the pending checks in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = &ReadinessCheck> {
        self.checks.iter()
    }

    fn snapshot(&self) -> Vec<ReadinessCheck> {
        self.checks.iter().cloned().collect()
    }
}

impl FromIterator<ReadinessCheck> for PendingChecks {
    fn from_iter<I: IntoIterator<Item = ReadinessCheck>>(iter: I) -> Self {
        Self {
            checks: iter.into_iter().collect(),
        }
    }
}

/// Source of the owning process's liveness flag.
pub trait Liveness {
    /// Whether the process is still considered alive.
    fn is_alive(&mut self) -> bool;
}

/// Companion query listing the peers that have joined a coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerQuery {
    /// Runs the joined-peers query.
    ///
    /// The payload is expected to be a list of peer ids, a map keyed by peer
    /// id, or a single id.
    async fn joined_peers(&self) -> Result<ShellResult, CommandError>;
}

/// Errors that stop probing outright.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// A peer check was declared but no collaborator can answer it.
    #[error("'{label}' declares peer check '{peer}' but has no peer query")]
    MissingPeerQuery {
        /// Display name of the daemon.
        label: String,
        /// Peer id that cannot be checked.
        peer: String,
    },
}

/// Polls pending readiness checks for one daemon.
pub struct ReadinessProber<'a> {
    label: &'a str,
    poll_interval: Duration,
    peers: Option<&'a dyn PeerQuery>,
}

impl<'a> ReadinessProber<'a> {
    /// Creates a prober that sleeps `poll_interval` between passes.
    #[must_use]
    pub const fn new(label: &'a str, poll_interval: Duration) -> Self {
        Self {
            label,
            poll_interval,
            peers: None,
        }
    }

    /// Supplies the collaborator that answers peer checks.
    #[must_use]
    pub const fn with_peer_query(mut self, peers: &'a dyn PeerQuery) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Polls until every check passes or `liveness` reports the process gone.
    ///
    /// Returns `Ok(true)` once `pending` is empty, immediately and without a
    /// single polling cycle when it starts empty. Returns `Ok(false)` as soon
    /// as liveness is lost. Liveness is re-read before every individual check.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::MissingPeerQuery`] when a peer check is pending
    /// and no collaborator was supplied.
    pub async fn wait(
        &self,
        pending: &mut PendingChecks,
        liveness: &mut dyn Liveness,
    ) -> Result<bool, ProbeError> {
        self.ensure_peer_query(pending)?;
        if !liveness.is_alive() {
            return Ok(false);
        }
        if pending.is_empty() {
            return Ok(true);
        }
        loop {
            for check in pending.snapshot() {
                tokio::task::yield_now().await;
                if !liveness.is_alive() {
                    return Ok(false);
                }
                if self.probe(&check).await {
                    pending.remove(&check);
                    debug!(
                        target: READINESS_TARGET,
                        daemon = self.label,
                        %check,
                        remaining = pending.len(),
                        "readiness check passed"
                    );
                }
            }
            if pending.is_empty() {
                return Ok(true);
            }
            tokio::time::sleep(self.poll_interval).await;
            if !liveness.is_alive() {
                return Ok(false);
            }
        }
    }

    fn ensure_peer_query(&self, pending: &PendingChecks) -> Result<(), ProbeError> {
        if self.peers.is_some() {
            return Ok(());
        }
        let missing = pending.iter().find_map(|check| match check {
            ReadinessCheck::PeerName(peer) => Some(peer.clone()),
            ReadinessCheck::Port(_) => None,
        });
        match missing {
            Some(peer) => Err(ProbeError::MissingPeerQuery {
                label: self.label.to_owned(),
                peer,
            }),
            None => Ok(()),
        }
    }

    async fn probe(&self, check: &ReadinessCheck) -> bool {
        match check {
            ReadinessCheck::Port(port) => self.probe_port(*port).await,
            ReadinessCheck::PeerName(peer) => self.probe_peer(peer).await,
        }
    }

    async fn probe_port(&self, port: u16) -> bool {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("localhost", port))).await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(error)) => {
                debug!(
                    target: READINESS_TARGET,
                    daemon = self.label,
                    port,
                    %error,
                    "port not accepting connections yet"
                );
                false
            }
            Err(_) => {
                debug!(
                    target: READINESS_TARGET,
                    daemon = self.label,
                    port,
                    "port connect attempt timed out"
                );
                false
            }
        }
    }

    async fn probe_peer(&self, peer: &str) -> bool {
        let Some(peers) = self.peers else {
            return false;
        };
        let result = match peers.joined_peers().await {
            Ok(result) => result,
            Err(error) => {
                debug!(
                    target: READINESS_TARGET,
                    daemon = self.label,
                    peer,
                    %error,
                    "joined-peers query failed"
                );
                return false;
            }
        };
        if result.exitcode() != 0 {
            debug!(
                target: READINESS_TARGET,
                daemon = self.label,
                peer,
                exitcode = result.exitcode(),
                stderr = result.stderr(),
                "joined-peers query exited non-zero"
            );
            return false;
        }
        let Some(listing) = result.payload() else {
            debug!(
                target: READINESS_TARGET,
                daemon = self.label,
                peer,
                "joined-peers query returned no data"
            );
            return false;
        };
        listing_contains(listing, peer)
    }
}

fn listing_contains(listing: &Value, peer: &str) -> bool {
    match listing {
        Value::Array(items) => items.iter().any(|item| item.as_str() == Some(peer)),
        Value::Object(map) => map.contains_key(peer),
        Value::String(name) => name == peer,
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}
