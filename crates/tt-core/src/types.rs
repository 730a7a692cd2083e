use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Team configuration
// ---------------------------------------------------------------------------

/// A team's configuration snapshot as written by the agent runtime.
///
/// The runtime rewrites the whole config file on every change, so a parsed
/// `TeamConfig` always replaces the previous snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Creation time in epoch milliseconds. Together with the team name this
    /// identifies one run of the team (one session).
    pub created_at: i64,
    #[serde(default)]
    pub lead_agent_id: Option<String>,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// One agent in a team's roster. Immutable once part of a config snapshot;
/// a new snapshot supersedes the old one atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub joined_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Inbox messages
// ---------------------------------------------------------------------------

/// An inbox message exactly as it appears in the backing file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInboxMessage {
    pub from: String,
    pub text: String,
    /// ISO-8601, passed through verbatim.
    pub timestamp: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub read: bool,
}

/// Classification of a message body, derived at ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    PlainText,
    TaskAssignment,
    ShutdownRequest,
    IdleNotification,
    ShutdownApproval,
}

impl MessageKind {
    /// Maps the `type` discriminator found in a structured body. Unknown
    /// discriminators stay plain text.
    pub fn from_discriminator(s: &str) -> Option<Self> {
        match s {
            "task_assignment" => Some(MessageKind::TaskAssignment),
            "shutdown_request" => Some(MessageKind::ShutdownRequest),
            "idle_notification" => Some(MessageKind::IdleNotification),
            "shutdown_approval" => Some(MessageKind::ShutdownApproval),
            _ => None,
        }
    }
}

/// An inbox message enriched at ingestion: the raw fields plus the body
/// classification and, for structured bodies, the parsed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub from: String,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl InboxMessage {
    /// Classify a raw message. A body that parses as a JSON object carrying
    /// a recognized `type` discriminator becomes a structured message with
    /// the parsed object as payload; anything else is plain text.
    pub fn from_raw(raw: RawInboxMessage) -> Self {
        let (kind, payload) = match serde_json::from_str::<serde_json::Value>(&raw.text) {
            Ok(serde_json::Value::Object(obj)) => {
                let kind = obj
                    .get("type")
                    .and_then(|v| v.as_str())
                    .and_then(MessageKind::from_discriminator);
                match kind {
                    Some(kind) => (kind, Some(serde_json::Value::Object(obj))),
                    None => (MessageKind::PlainText, None),
                }
            }
            _ => (MessageKind::PlainText, None),
        };
        Self {
            from: raw.from,
            text: raw.text,
            timestamp: raw.timestamp,
            color: raw.color,
            read: raw.read,
            kind,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Deleted,
}

/// A team task, replaced wholesale on every change to its backing file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub active_form: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Derived at ingestion from `metadata._internal`; internal tasks stay
    /// in the model but are held back from observers.
    #[serde(default)]
    pub internal: bool,
}

impl Task {
    /// Recompute the internal flag from the task's metadata.
    pub fn mark_internal_from_metadata(&mut self) {
        self.internal = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("_internal"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    }

    /// True when the task belongs in externally visible listings. Deleted
    /// and internal tasks are retained in the model but excluded here.
    pub fn is_visible(&self) -> bool {
        !self.internal && self.status != TaskStatus::Deleted
    }
}

// ---------------------------------------------------------------------------
// Team
// ---------------------------------------------------------------------------

/// One coordinated group of agents: a config snapshot, per-agent inboxes,
/// and the team's task map.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Team {
    pub name: String,
    pub config: Option<TeamConfig>,
    /// Agent name -> that agent's full inbox, replaced wholesale per change.
    pub inboxes: HashMap<String, Vec<InboxMessage>>,
    /// Task id -> task, including internal and deleted tasks.
    pub tasks: HashMap<String, Task>,
}

impl Team {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The team's externally visible tasks, ordered by id.
    pub fn visible_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.is_visible())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

// ---------------------------------------------------------------------------
// Change descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Config,
    Inbox,
    Task,
}

/// What changed inside one team after a successful merge.
#[derive(Debug, Clone, PartialEq)]
pub enum TeamChange {
    /// The new config snapshot.
    Config(TeamConfig),
    /// One agent's inbox, replaced wholesale.
    Inbox {
        agent: String,
        messages: Vec<InboxMessage>,
    },
    /// The team's full task list after the change, internal and deleted
    /// tasks included; consumers filter for their audience.
    Tasks(Vec<Task>),
}

impl TeamChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            TeamChange::Config(_) => ChangeKind::Config,
            TeamChange::Inbox { .. } => ChangeKind::Inbox,
            TeamChange::Tasks(_) => ChangeKind::Task,
        }
    }
}

/// A change description produced by the aggregator and consumed by the
/// session store and the broadcast hub independently.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamUpdate {
    pub team: String,
    pub change: TeamChange,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A point-in-time copy of one team, shaped for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSnapshot {
    pub name: String,
    pub config: Option<TeamConfig>,
    pub inboxes: HashMap<String, Vec<InboxMessage>>,
    /// Visible tasks only.
    pub tasks: Vec<Task>,
}

/// The full aggregated state sent to a newly connected observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub teams: Vec<TeamSnapshot>,
    pub active_team: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawInboxMessage {
        RawInboxMessage {
            from: "lead".into(),
            text: text.into(),
            timestamp: "2026-08-01T12:00:00Z".into(),
            color: None,
            read: false,
        }
    }

    #[test]
    fn structured_body_is_classified_with_payload() {
        let msg = InboxMessage::from_raw(raw(r#"{"type":"task_assignment","taskId":"5"}"#));
        assert_eq!(msg.kind, MessageKind::TaskAssignment);
        let payload = msg.payload.expect("structured payload");
        assert_eq!(payload["taskId"], "5");
    }

    #[test]
    fn plain_text_body_has_no_payload() {
        let msg = InboxMessage::from_raw(raw("hello"));
        assert_eq!(msg.kind, MessageKind::PlainText);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn json_body_without_known_discriminator_stays_plain() {
        let msg = InboxMessage::from_raw(raw(r#"{"type":"something_else"}"#));
        assert_eq!(msg.kind, MessageKind::PlainText);
        assert!(msg.payload.is_none());

        // A JSON scalar is not a structured message either.
        let msg = InboxMessage::from_raw(raw(r#""just a quoted string""#));
        assert_eq!(msg.kind, MessageKind::PlainText);
    }

    #[test]
    fn config_parses_runtime_field_names() {
        let json = r#"{
            "name": "alpha",
            "description": "demo team",
            "createdAt": 1722470400000,
            "leadAgentId": "agent-1",
            "members": [
                {"agentId": "agent-1", "name": "lead", "agentType": "lead",
                 "model": "m-large", "color": "blue", "joinedAt": 1722470400000}
            ]
        }"#;
        let config: TeamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.created_at, 1_722_470_400_000);
        assert_eq!(config.lead_agent_id.as_deref(), Some("agent-1"));
        assert_eq!(config.members[0].agent_id, "agent-1");
    }

    #[test]
    fn task_parses_runtime_field_names() {
        let json = r#"{
            "id": "7", "subject": "ship it", "description": "",
            "activeForm": "shipping it", "status": "in_progress",
            "owner": "agent-2", "blocks": ["8"], "blockedBy": [],
            "metadata": {"_internal": true}
        }"#;
        let mut task: Task = serde_json::from_str(json).unwrap();
        task.mark_internal_from_metadata();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.internal);
        assert!(!task.is_visible());
    }

    #[test]
    fn visible_tasks_excludes_deleted_and_internal() {
        let mut team = Team::named("alpha");
        for (id, status, internal) in [
            ("1", TaskStatus::Pending, false),
            ("2", TaskStatus::Deleted, false),
            ("3", TaskStatus::Completed, true),
        ] {
            team.tasks.insert(
                id.into(),
                Task {
                    id: id.into(),
                    subject: String::new(),
                    description: String::new(),
                    active_form: None,
                    status,
                    owner: None,
                    blocks: vec![],
                    blocked_by: vec![],
                    metadata: None,
                    internal,
                },
            );
        }
        let visible = team.visible_tasks();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "1");
        // Deleted and internal tasks are still part of the model.
        assert_eq!(team.tasks.len(), 3);
    }
}
