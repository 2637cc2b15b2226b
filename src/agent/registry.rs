//! Agent Registry - tracks every running agent of a launcher

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use super::supervisor::{AgentControl, DisconnectCause};
use crate::session::LaunchState;

/// Information about a registered agent
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: Uuid,
    pub host: String,
    pub state: LaunchState,
    pub started_at: Instant,
}

struct Entry {
    control: AgentControl,
    started_at: Instant,
}

/// Manages all running agents
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, control: AgentControl) {
        let id = control.id();
        info!("Agent registered: id={}, host={}", id, control.host());
        self.agents.write().insert(
            id,
            Entry {
                control,
                started_at: Instant::now(),
            },
        );
    }

    pub fn unregister(&self, id: Uuid) -> Option<AgentControl> {
        let entry = self.agents.write().remove(&id);
        if entry.is_some() {
            info!("Agent unregistered: id={}", id);
        }
        entry.map(|e| e.control)
    }

    pub fn get(&self, id: Uuid) -> Option<AgentControl> {
        self.agents.read().get(&id).map(|e| e.control.clone())
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents
            .read()
            .values()
            .map(|e| AgentInfo {
                id: e.control.id(),
                host: e.control.host().to_string(),
                state: e.control.state(),
                started_at: e.started_at,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.agents.read().len()
    }

    /// Disconnect every agent and wait for their teardown (for host shutdown)
    pub async fn close_all(&self) -> Vec<(Uuid, DisconnectCause)> {
        let controls: Vec<_> = {
            let mut agents = self.agents.write();
            agents.drain().map(|(_, e)| e.control).collect()
        };

        let mut closed = Vec::with_capacity(controls.len());
        for control in controls {
            info!("Closing agent: {} on {}", control.id(), control.host());
            closed.push((control.id(), control.disconnect().await));
        }
        closed
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
