use std::fmt;

/// Where a [`super::DaemonSupervisor`] is in its launch sequence.
///
/// ```text
/// NotStarted -> Spawning(1) -> AliveUnconfirmed(1) -> Ready(1)
///                  |                 |
///                  +-----------------+--> Spawning(2) -> ... -> Failed(n)
/// ```
///
/// `AliveUnconfirmed` means the process survived its liveness window but its
/// readiness checks have not all passed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No attempt has been made.
    NotStarted,
    /// A fresh process is being spawned for this attempt.
    Spawning {
        /// One-based attempt number.
        attempt: u32,
    },
    /// The process is alive; readiness is being probed.
    AliveUnconfirmed {
        /// One-based attempt number.
        attempt: u32,
    },
    /// The daemon is alive and every readiness check passed.
    Ready {
        /// Attempt that succeeded.
        attempt: u32,
    },
    /// Every attempt failed.
    Failed {
        /// Attempts made.
        attempts: u32,
    },
}

impl SupervisorState {
    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::NotStarted, Self::Spawning { attempt }) => attempt == 1,
            (Self::Spawning { attempt }, Self::AliveUnconfirmed { attempt: probed }) => {
                attempt == probed
            }
            (Self::AliveUnconfirmed { attempt }, Self::Ready { attempt: ready }) => {
                attempt == ready
            }
            (
                Self::Spawning { attempt } | Self::AliveUnconfirmed { attempt },
                Self::Spawning { attempt: retry },
            ) => attempt.checked_add(1) == Some(retry),
            (
                Self::Spawning { attempt } | Self::AliveUnconfirmed { attempt },
                Self::Failed { attempts },
            ) => attempt == attempts,
            _ => false,
        }
    }

    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Spawning { attempt } => write!(f, "spawning (attempt {attempt})"),
            Self::AliveUnconfirmed { attempt } => {
                write!(f, "alive, awaiting readiness (attempt {attempt})")
            }
            Self::Ready { attempt } => write!(f, "ready (attempt {attempt})"),
            Self::Failed { attempts } => write!(f, "failed after {attempts} attempts"),
        }
    }
}
