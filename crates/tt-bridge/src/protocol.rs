use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tt_core::store::{SessionDetail, SessionRow};
use tt_core::types::{
    ChangeKind, InboxMessage, StateSnapshot, Task, TeamChange, TeamConfig, TeamUpdate,
};

// ---------------------------------------------------------------------------
// Server -> observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// The complete aggregated state; sent on connect and after a team
    /// switch. Observers replace their model wholesale.
    FullState(StateSnapshot),
    /// One team changed; observers apply this incrementally.
    TeamUpdate(TeamUpdatePayload),
    /// Liveness signal carrying the current observer count.
    Heartbeat { observers: usize },
    /// Reply to `get_history`.
    HistoryIndex(Vec<SessionRow>),
    /// Reply to `get_session`.
    SessionDetail(Box<SessionDetail>),
    Error { message: String },
}

// ---------------------------------------------------------------------------
// Observer -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Switch the team this observer is viewing.
    SwitchTeam { team: String },
    /// Request the session history index.
    GetHistory,
    /// Request one full session by id.
    GetSession { id: i64 },
}

// ---------------------------------------------------------------------------
// Incremental update payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPayload {
    pub agent: String,
    pub messages: Vec<InboxMessage>,
}

/// The wire shape of one team change. Exactly one of the optional fields is
/// set, matching `change`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamUpdatePayload {
    pub team: String,
    pub change: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TeamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<InboxPayload>,
    /// Externally visible tasks only; internal and deleted tasks are held
    /// back from observers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

impl From<TeamUpdate> for TeamUpdatePayload {
    fn from(update: TeamUpdate) -> Self {
        let change = update.change.kind();
        let mut payload = Self {
            team: update.team,
            change,
            config: None,
            inbox: None,
            tasks: None,
        };
        match update.change {
            TeamChange::Config(config) => payload.config = Some(config),
            TeamChange::Inbox { agent, messages } => {
                payload.inbox = Some(InboxPayload { agent, messages });
            }
            TeamChange::Tasks(tasks) => {
                payload.tasks = Some(tasks.into_iter().filter(|t| t.is_visible()).collect());
            }
        }
        payload
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The framing every server message travels in: a kind tag, a payload, and
/// the send timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Stamp a message with the current time.
    pub fn now(message: ServerMessage) -> Self {
        Self {
            message,
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_core::types::TaskStatus;

    #[test]
    fn envelope_carries_kind_payload_and_timestamp() {
        let envelope = Envelope::now(ServerMessage::Heartbeat { observers: 3 });
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["payload"]["observers"], 3);
        assert!(value["sentAt"].is_string());
    }

    #[test]
    fn client_messages_parse_from_wire_form() {
        let switch: ClientMessage =
            serde_json::from_str(r#"{"type":"switch_team","payload":{"team":"alpha"}}"#).unwrap();
        assert!(matches!(switch, ClientMessage::SwitchTeam { team } if team == "alpha"));

        let history: ClientMessage = serde_json::from_str(r#"{"type":"get_history"}"#).unwrap();
        assert!(matches!(history, ClientMessage::GetHistory));

        let session: ClientMessage =
            serde_json::from_str(r#"{"type":"get_session","payload":{"id":7}}"#).unwrap();
        assert!(matches!(session, ClientMessage::GetSession { id: 7 }));
    }

    #[test]
    fn update_payload_filters_hidden_tasks() {
        let visible = Task {
            id: "1".into(),
            subject: "a".into(),
            description: String::new(),
            active_form: None,
            status: TaskStatus::Pending,
            owner: None,
            blocks: vec![],
            blocked_by: vec![],
            metadata: None,
            internal: false,
        };
        let mut hidden = visible.clone();
        hidden.id = "2".into();
        hidden.internal = true;
        let mut deleted = visible.clone();
        deleted.id = "3".into();
        deleted.status = TaskStatus::Deleted;

        let payload: TeamUpdatePayload = TeamUpdate {
            team: "alpha".into(),
            change: TeamChange::Tasks(vec![visible, hidden, deleted]),
        }
        .into();

        assert_eq!(payload.change, ChangeKind::Task);
        let tasks = payload.tasks.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "1");
    }

    #[test]
    fn config_update_round_trips_through_the_envelope() {
        let payload: TeamUpdatePayload = TeamUpdate {
            team: "alpha".into(),
            change: TeamChange::Config(TeamConfig {
                name: "alpha".into(),
                description: None,
                created_at: 1000,
                lead_agent_id: None,
                members: vec![],
            }),
        }
        .into();
        let envelope = Envelope::now(ServerMessage::TeamUpdate(payload));

        let parsed: Envelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        let ServerMessage::TeamUpdate(update) = parsed.message else {
            panic!("expected team update");
        };
        assert_eq!(update.team, "alpha");
        assert_eq!(update.config.unwrap().created_at, 1000);
        assert!(update.inbox.is_none());
    }
}
