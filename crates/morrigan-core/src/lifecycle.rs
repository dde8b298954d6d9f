use serde::{Deserialize, Serialize};

/// Strict total order of server states, plus the terminal `Error` state
/// reachable from any pre-`Ready` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Instanced,
    Initializing,
    Initialized,
    Starting,
    StartingConnected,
    Started,
    Ready,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    pub fn event_name(&self) -> &'static str {
        match self {
            LifecycleState::Instanced => "instanced",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::StartingConnected => "startingConnected",
            LifecycleState::Started => "started",
            LifecycleState::Ready => "ready",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        }
    }
}

/// Fired exactly once per state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_strictly_ordered() {
        assert!(LifecycleState::Instanced < LifecycleState::Initializing);
        assert!(LifecycleState::Ready < LifecycleState::Stopping);
        assert!(LifecycleState::Stopping < LifecycleState::Stopped);
    }
}
