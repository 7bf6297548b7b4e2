//! Lifecycle states shared by services and nodes.
//!
//! Every [`Service`](crate::service::Service) owns its own [`LifecycleState`]. A
//! [`Node`](crate::node::Node) never stores one: its state is derived from the states of
//! its services with one of two aggregation rules, depending on which operation is in
//! flight.
//!
//! | children (connect)                  | aggregate      |
//! |-------------------------------------|----------------|
//! | none                                | `Disconnected` |
//! | any `Connecting`, some `Connected`  | `Degraded`     |
//! | any `Connecting`, none `Connected`  | `Connecting`   |
//! | all `Connected`                     | `Connected`    |
//! | all `Disconnected`                  | `Disconnected` |
//! | `Connected` and `Disconnected` mix  | `Degraded`     |
//!
//! The disconnect rule has no `Degraded` outcome: any `Disconnecting` child makes the
//! aggregate `Disconnecting`, everything else is `Disconnected`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity status of a service or node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not connected, nothing in progress.
    #[default]
    Disconnected,
    /// Connect in progress.
    Connecting,
    /// Fully connected.
    Connected,
    /// Partially connected; stable but not every endpoint is up.
    Degraded,
    /// Disconnect in progress.
    Disconnecting,
}

impl LifecycleState {
    /// Aggregate child states produced by a connect operation.
    ///
    /// A `Degraded` child counts as partially connected. A `Disconnecting` child counts
    /// as disconnected.
    pub fn aggregate_connect<I>(states: I) -> LifecycleState
    where
        I: IntoIterator<Item = LifecycleState>,
    {
        let mut total = 0usize;
        let mut connecting = 0usize;
        let mut connected = 0usize;
        let mut degraded = 0usize;
        let mut disconnected = 0usize;

        for state in states {
            total += 1;
            match state {
                LifecycleState::Connecting => connecting += 1,
                LifecycleState::Connected => connected += 1,
                LifecycleState::Degraded => degraded += 1,
                LifecycleState::Disconnected | LifecycleState::Disconnecting => {
                    disconnected += 1
                }
            }
        }

        if total == 0 {
            return LifecycleState::Disconnected;
        }

        if connecting > 0 {
            return if connected > 0 || degraded > 0 {
                LifecycleState::Degraded
            } else {
                LifecycleState::Connecting
            };
        }

        if connected == total {
            LifecycleState::Connected
        } else if disconnected == total {
            LifecycleState::Disconnected
        } else {
            LifecycleState::Degraded
        }
    }

    /// Aggregate child states produced by a disconnect operation.
    pub fn aggregate_disconnect<I>(states: I) -> LifecycleState
    where
        I: IntoIterator<Item = LifecycleState>,
    {
        if states
            .into_iter()
            .any(|s| s == LifecycleState::Disconnecting)
        {
            LifecycleState::Disconnecting
        } else {
            LifecycleState::Disconnected
        }
    }

    /// Aggregate the current (not operation-bound) states of a set of children.
    ///
    /// A disconnect in progress on any child dominates; otherwise the connect rule applies.
    pub fn aggregate_current<I>(states: I) -> LifecycleState
    where
        I: IntoIterator<Item = LifecycleState>,
    {
        let states: Vec<LifecycleState> = states.into_iter().collect();
        if states.contains(&LifecycleState::Disconnecting) {
            LifecycleState::Disconnecting
        } else {
            Self::aggregate_connect(states)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
