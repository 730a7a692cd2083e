use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::classify::PathClass;
use crate::types::{
    InboxMessage, RawInboxMessage, StateSnapshot, Task, Team, TeamChange, TeamConfig,
    TeamSnapshot, TeamUpdate,
};
use crate::watcher::ChangeEvent;

// ---------------------------------------------------------------------------
// TeamState
// ---------------------------------------------------------------------------

/// The canonical in-memory model: every observed team plus the most
/// recently active one.
///
/// Exactly one writer (the aggregator) takes the write side of the lock,
/// once per merge; snapshot readers observe pre- or post-merge state and
/// never a partial merge.
#[derive(Default)]
pub struct TeamState {
    teams: RwLock<HashMap<String, Team>>,
    active_team: RwLock<Option<String>>,
}

impl TeamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the full current state, shaped for observers. Teams are
    /// ordered by name; only visible tasks are included.
    pub async fn snapshot(&self) -> StateSnapshot {
        let teams = self.teams.read().await;
        let mut out: Vec<TeamSnapshot> = teams
            .values()
            .map(|team| TeamSnapshot {
                name: team.name.clone(),
                config: team.config.clone(),
                inboxes: team.inboxes.clone(),
                tasks: team.visible_tasks(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        StateSnapshot {
            teams: out,
            active_team: self.active_team.read().await.clone(),
        }
    }

    /// A copy of one team's full model state, internal tasks included.
    pub async fn team(&self, name: &str) -> Option<Team> {
        self.teams.read().await.get(name).cloned()
    }

    /// The current config snapshot for one team, if one has been observed.
    pub async fn team_config(&self, name: &str) -> Option<TeamConfig> {
        self.teams
            .read()
            .await
            .get(name)
            .and_then(|team| team.config.clone())
    }
}

// ---------------------------------------------------------------------------
// StateAggregator
// ---------------------------------------------------------------------------

/// Consumes classified change events strictly one at a time, re-reads the
/// affected file, parses it, and merges it into the canonical model.
///
/// Every successful merge emits a [`TeamUpdate`] for the session store and
/// broadcast hub. A failed read or parse is never fatal: the previous value
/// stays in place and the next notification self-heals the state.
pub struct StateAggregator {
    state: Arc<TeamState>,
    updates: flume::Sender<TeamUpdate>,
}

impl StateAggregator {
    pub fn new(state: Arc<TeamState>, updates: flume::Sender<TeamUpdate>) -> Self {
        Self { state, updates }
    }

    /// Drive the aggregator until the event stream disconnects. Events are
    /// processed in arrival order; there is no concurrent merging.
    pub async fn run(self, events: flume::Receiver<ChangeEvent>) {
        while let Ok(event) = events.recv_async().await {
            self.apply(&event).await;
        }
        debug!("event stream closed, aggregator stopping");
    }

    /// Merge a single event into the model.
    pub async fn apply(&self, event: &ChangeEvent) {
        match &event.class {
            PathClass::TeamConfig { team } => self.apply_config(team, &event.path).await,
            PathClass::Inbox { team, agent } => self.apply_inbox(team, agent, &event.path).await,
            PathClass::Task { team, task_id } => self.apply_task(team, task_id, &event.path).await,
            PathClass::Ignored => {}
        }
    }

    async fn apply_config(&self, team: &str, path: &Path) {
        let Some(config) = read_json::<TeamConfig>(path).await else {
            return;
        };
        {
            let mut teams = self.state.teams.write().await;
            teams
                .entry(team.to_string())
                .or_insert_with(|| Team::named(team))
                .config = Some(config.clone());
        }
        *self.state.active_team.write().await = Some(team.to_string());
        debug!(team, created_at = config.created_at, "team config replaced");
        self.emit(team, TeamChange::Config(config));
    }

    async fn apply_inbox(&self, team: &str, agent: &str, path: &Path) {
        let Some(raw) = read_json::<Vec<RawInboxMessage>>(path).await else {
            return;
        };
        // The backing file holds the agent's whole inbox; this is always a
        // full replacement, never a merge.
        let messages: Vec<InboxMessage> = raw.into_iter().map(InboxMessage::from_raw).collect();
        {
            let mut teams = self.state.teams.write().await;
            teams
                .entry(team.to_string())
                .or_insert_with(|| Team::named(team))
                .inboxes
                .insert(agent.to_string(), messages.clone());
        }
        debug!(team, agent, count = messages.len(), "inbox replaced");
        self.emit(
            team,
            TeamChange::Inbox {
                agent: agent.to_string(),
                messages,
            },
        );
    }

    async fn apply_task(&self, team: &str, task_id: &str, path: &Path) {
        let Some(mut task) = read_json::<Task>(path).await else {
            return;
        };
        if task.id.is_empty() {
            task.id = task_id.to_string();
        }
        task.mark_internal_from_metadata();

        let tasks = {
            let mut teams = self.state.teams.write().await;
            let entry = teams
                .entry(team.to_string())
                .or_insert_with(|| Team::named(team));
            entry.tasks.insert(task_id.to_string(), task);
            let mut all: Vec<Task> = entry.tasks.values().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            all
        };
        debug!(team, task_id, "task replaced");
        self.emit(team, TeamChange::Tasks(tasks));
    }

    fn emit(&self, team: &str, change: TeamChange) {
        if self
            .updates
            .send(TeamUpdate {
                team: team.to_string(),
                change,
            })
            .is_err()
        {
            debug!(team, "no update consumers, dropping change description");
        }
    }
}

/// Read and parse one watched file. Both failure modes are transient by
/// design: the file may be mid-write or briefly missing, so the caller
/// retains its previous value and waits for the next notification.
async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "read failed, retaining previous state");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "parse failed, retaining previous state");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
