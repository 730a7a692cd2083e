use std::sync::Arc;
use std::time::Duration;

use tt_core::aggregator::TeamState;
use tt_core::store::SessionStore;

use crate::hub::BroadcastHub;

/// Shared state for WebSocket and REST handlers.
pub struct ApiState {
    /// Snapshot reads of the aggregated in-memory model.
    pub teams: Arc<TeamState>,
    /// Historical queries, independent of current in-memory state.
    pub store: Arc<SessionStore>,
    pub hub: BroadcastHub,
    /// Liveness message interval towards observers.
    pub heartbeat: Duration,
}

impl ApiState {
    pub fn new(
        teams: Arc<TeamState>,
        store: Arc<SessionStore>,
        hub: BroadcastHub,
        heartbeat: Duration,
    ) -> Self {
        Self {
            teams,
            store,
            hub,
            heartbeat,
        }
    }
}
