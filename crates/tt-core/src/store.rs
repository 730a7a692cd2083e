use std::path::Path;

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;

use crate::types::{InboxMessage, Member, MessageKind, Task, TaskStatus, TeamConfig};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One row in the session history index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: i64,
    pub team_name: String,
    pub description: Option<String>,
    /// Creation time of the config snapshot, epoch milliseconds.
    pub created_at: i64,
    /// RFC 3339; set once a newer run of the same team name is observed.
    pub ended_at: Option<String>,
}

/// One persisted inbox message, addressed to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub recipient: String,
    pub from: String,
    pub timestamp: String,
    pub text: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub color: Option<String>,
    pub read: bool,
}

/// Full detail of one session: the config snapshot plus everything recorded
/// while the run was observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub session: SessionRow,
    pub config: TeamConfig,
    pub members: Vec<Member>,
    pub messages: Vec<SessionMessage>,
    /// Externally visible tasks only; internal and deleted rows stay in the
    /// store but are held back from this listing.
    pub tasks: Vec<Task>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// helpers: enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: Serialize>(val: &T) -> String {
    serde_json::to_string(val)
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(&format!("\"{raw}\"")).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Durable, idempotent mirror of observed team runs.
///
/// A session is one run of a team, keyed by (team name, config creation
/// time); the uniqueness constraint lives in the schema so redundant change
/// events, or a second observing process, can race to create the same
/// session and exactly one row results. Every write operation is safe to
/// repeat with the same logical input.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Open (or create) the store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// A purely in-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS sessions (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        team_name     TEXT NOT NULL,
                        created_at    INTEGER NOT NULL,
                        description   TEXT,
                        lead_agent_id TEXT,
                        config_json   TEXT NOT NULL,
                        ended_at      TEXT,
                        UNIQUE(team_name, created_at)
                    );

                    CREATE TABLE IF NOT EXISTS session_members (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        session_id INTEGER NOT NULL REFERENCES sessions(id),
                        agent_id   TEXT NOT NULL,
                        name       TEXT NOT NULL,
                        agent_type TEXT,
                        model      TEXT,
                        color      TEXT,
                        joined_at  INTEGER
                    );

                    CREATE INDEX IF NOT EXISTS idx_members_session
                        ON session_members(session_id, agent_id);

                    CREATE TABLE IF NOT EXISTS session_messages (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        session_id INTEGER NOT NULL REFERENCES sessions(id),
                        recipient  TEXT NOT NULL,
                        sender     TEXT NOT NULL,
                        timestamp  TEXT NOT NULL,
                        text       TEXT NOT NULL,
                        kind       TEXT NOT NULL,
                        payload    TEXT,
                        color      TEXT,
                        read_flag  INTEGER NOT NULL DEFAULT 0,
                        UNIQUE(session_id, recipient, sender, timestamp)
                    );

                    CREATE TABLE IF NOT EXISTS session_tasks (
                        session_id  INTEGER NOT NULL REFERENCES sessions(id),
                        task_id     TEXT NOT NULL,
                        subject     TEXT NOT NULL DEFAULT '',
                        description TEXT NOT NULL DEFAULT '',
                        active_form TEXT,
                        status      TEXT NOT NULL,
                        owner       TEXT,
                        blocks      TEXT NOT NULL DEFAULT '[]',
                        blocked_by  TEXT NOT NULL DEFAULT '[]',
                        internal    INTEGER NOT NULL DEFAULT 0,
                        PRIMARY KEY(session_id, task_id)
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Idempotently create the session for this config's (team, createdAt)
    /// pair. Returns the session id and whether the row was freshly created.
    ///
    /// Races between redundant change events (or a second process on the
    /// same database file) are resolved by the uniqueness constraint plus a
    /// refetch, never by an in-process lock. First creation closes any
    /// still-open session rows for the same team with an older creation
    /// time: a new run of a team name supersedes the previous run.
    pub async fn ensure_session(&self, config: &TeamConfig) -> Result<(i64, bool), StoreError> {
        let team = config.name.clone();
        let created_at = config.created_at;
        let description = config.description.clone();
        let lead = config.lead_agent_id.clone();
        let config_json = serde_json::to_string(config)?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO sessions (team_name, created_at, description, lead_agent_id, config_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(team_name, created_at) DO NOTHING",
                    rusqlite::params![team, created_at, description, lead, config_json],
                )?;
                let id: i64 = tx.query_row(
                    "SELECT id FROM sessions WHERE team_name = ?1 AND created_at = ?2",
                    rusqlite::params![team, created_at],
                    |row| row.get(0),
                )?;
                if inserted > 0 {
                    tx.execute(
                        "UPDATE sessions SET ended_at = ?1
                         WHERE team_name = ?2 AND created_at < ?3 AND ended_at IS NULL",
                        rusqlite::params![now, team, created_at],
                    )?;
                }
                tx.commit()?;
                Ok((id, inserted > 0))
            })
            .await
            .map_err(Into::into)
    }

    /// Record a session's roster. Members carry no natural unique key, so
    /// duplication is guarded by a lookup per (session, agent id); repeat
    /// calls with the same roster insert nothing. The whole roster lands in
    /// one transaction, so a partial roster is never visible.
    pub async fn record_members(
        &self,
        session_id: i64,
        members: &[Member],
    ) -> Result<(), StoreError> {
        let members = members.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for member in &members {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM session_members
                             WHERE session_id = ?1 AND agent_id = ?2",
                            rusqlite::params![session_id, member.agent_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if exists.is_none() {
                        tx.execute(
                            "INSERT INTO session_members
                                (session_id, agent_id, name, agent_type, model, color, joined_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            rusqlite::params![
                                session_id,
                                member.agent_id,
                                member.name,
                                member.agent_type,
                                member.model,
                                member.color,
                                member.joined_at,
                            ],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Record one enriched inbox message. A repeat delivery with identical
    /// (session, recipient, sender, timestamp) is a no-op.
    pub async fn record_message(
        &self,
        session_id: i64,
        recipient: &str,
        message: &InboxMessage,
    ) -> Result<(), StoreError> {
        let recipient = recipient.to_string();
        let message = message.clone();
        let payload = message
            .payload
            .as_ref()
            .map(|p| serde_json::to_string(p))
            .transpose()?;
        let kind = enum_to_sql(&message.kind);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO session_messages
                        (session_id, recipient, sender, timestamp, text, kind, payload, color, read_flag)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        session_id,
                        recipient,
                        message.from,
                        message.timestamp,
                        message.text,
                        kind,
                        payload,
                        message.color,
                        message.read,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Insert or fully replace the row for (session, task id). Status and
    /// ownership transitions overwrite; they never accumulate.
    pub async fn record_task(&self, session_id: i64, task: &Task) -> Result<(), StoreError> {
        let task = task.clone();
        let blocks = serde_json::to_string(&task.blocks)?;
        let blocked_by = serde_json::to_string(&task.blocked_by)?;
        let status = enum_to_sql(&task.status);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO session_tasks
                        (session_id, task_id, subject, description, active_form,
                         status, owner, blocks, blocked_by, internal)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(session_id, task_id) DO UPDATE SET
                        subject=excluded.subject, description=excluded.description,
                        active_form=excluded.active_form, status=excluded.status,
                        owner=excluded.owner, blocks=excluded.blocks,
                        blocked_by=excluded.blocked_by, internal=excluded.internal",
                    rusqlite::params![
                        session_id,
                        task.id,
                        task.subject,
                        task.description,
                        task.active_form,
                        status,
                        task.owner,
                        blocks,
                        blocked_by,
                        task.internal,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The history index, newest run first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, team_name, description, created_at, ended_at
                     FROM sessions ORDER BY created_at DESC, id DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_session(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// One session's full detail, or `None` when the id is unknown.
    pub async fn fetch_session(&self, id: i64) -> Result<Option<SessionDetail>, StoreError> {
        let detail = self
            .conn
            .call(move |conn| {
                let session = conn
                    .query_row(
                        "SELECT id, team_name, description, created_at, ended_at
                         FROM sessions WHERE id = ?1",
                        rusqlite::params![id],
                        row_to_session,
                    )
                    .optional()?;
                let Some(session) = session else {
                    return Ok(None);
                };

                let config_json: String = conn.query_row(
                    "SELECT config_json FROM sessions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT agent_id, name, agent_type, model, color, joined_at
                     FROM session_members WHERE session_id = ?1 ORDER BY id",
                )?;
                let members = stmt
                    .query_map(rusqlite::params![id], |row| {
                        Ok(Member {
                            agent_id: row.get(0)?,
                            name: row.get(1)?,
                            agent_type: row.get(2)?,
                            model: row.get(3)?,
                            color: row.get(4)?,
                            joined_at: row.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stmt = conn.prepare(
                    "SELECT recipient, sender, timestamp, text, kind, payload, color, read_flag
                     FROM session_messages WHERE session_id = ?1 ORDER BY timestamp, id",
                )?;
                let messages = stmt
                    .query_map(rusqlite::params![id], |row| {
                        let kind: String = row.get(4)?;
                        let payload: Option<String> = row.get(5)?;
                        Ok(SessionMessage {
                            recipient: row.get(0)?,
                            from: row.get(1)?,
                            timestamp: row.get(2)?,
                            text: row.get(3)?,
                            kind: enum_from_sql(&kind),
                            payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                            color: row.get(6)?,
                            read: row.get(7)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stmt = conn.prepare(
                    "SELECT task_id, subject, description, active_form, status,
                            owner, blocks, blocked_by, internal
                     FROM session_tasks
                     WHERE session_id = ?1 AND internal = 0 AND status != 'deleted'
                     ORDER BY task_id",
                )?;
                let tasks = stmt
                    .query_map(rusqlite::params![id], |row| {
                        let status: String = row.get(4)?;
                        let blocks: String = row.get(6)?;
                        let blocked_by: String = row.get(7)?;
                        Ok(Task {
                            id: row.get(0)?,
                            subject: row.get(1)?,
                            description: row.get(2)?,
                            active_form: row.get(3)?,
                            status: enum_from_sql::<TaskStatus>(&status),
                            owner: row.get(5)?,
                            blocks: serde_json::from_str(&blocks).unwrap_or_default(),
                            blocked_by: serde_json::from_str(&blocked_by).unwrap_or_default(),
                            metadata: None,
                            internal: row.get(8)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(Some((session, config_json, members, messages, tasks)))
            })
            .await?;

        let Some((session, config_json, members, messages, tasks)) = detail else {
            return Ok(None);
        };
        let config: TeamConfig = serde_json::from_str(&config_json)?;
        Ok(Some(SessionDetail {
            session,
            config,
            members,
            messages,
            tasks,
        }))
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        team_name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        ended_at: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawInboxMessage;
    use std::sync::Arc;

    fn config(name: &str, created_at: i64) -> TeamConfig {
        TeamConfig {
            name: name.into(),
            description: Some("demo".into()),
            created_at,
            lead_agent_id: Some("lead".into()),
            members: vec![
                Member {
                    agent_id: "lead".into(),
                    name: "lead".into(),
                    agent_type: Some("lead".into()),
                    model: Some("m-large".into()),
                    color: Some("blue".into()),
                    joined_at: Some(created_at),
                },
                Member {
                    agent_id: "worker".into(),
                    name: "worker".into(),
                    agent_type: None,
                    model: None,
                    color: None,
                    joined_at: None,
                },
            ],
        }
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            subject: format!("task {id}"),
            description: String::new(),
            active_form: None,
            status,
            owner: Some("worker".into()),
            blocks: vec![],
            blocked_by: vec![],
            metadata: None,
            internal: false,
        }
    }

    fn message(sender: &str, timestamp: &str) -> InboxMessage {
        InboxMessage::from_raw(RawInboxMessage {
            from: sender.into(),
            text: "hello".into(),
            timestamp: timestamp.into(),
            color: None,
            read: false,
        })
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let cfg = config("alpha", 1000);

        let (id, created) = store.ensure_session(&cfg).await.unwrap();
        assert!(created);
        for _ in 0..5 {
            let (again, created) = store.ensure_session(&cfg).await.unwrap();
            assert_eq!(again, id);
            assert!(!created);
        }
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_session_yields_one_row() {
        let store = Arc::new(SessionStore::open_in_memory().await.unwrap());
        let cfg = config("alpha", 1000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let cfg = cfg.clone();
                tokio::spawn(async move { store.ensure_session(&cfg).await.unwrap() })
            })
            .collect();
        let mut ids = Vec::new();
        let mut creations = 0;
        for handle in handles {
            let (id, created) = handle.await.unwrap();
            ids.push(id);
            if created {
                creations += 1;
            }
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(creations, 1);
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_created_at_starts_a_new_session_and_closes_the_old() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let (first, _) = store.ensure_session(&config("alpha", 1000)).await.unwrap();
        let (second, created) = store.ensure_session(&config("alpha", 2000)).await.unwrap();
        assert!(created);
        assert_ne!(first, second);

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        // Newest first; the superseded run carries an end time.
        assert_eq!(sessions[0].id, second);
        assert!(sessions[0].ended_at.is_none());
        assert!(sessions[1].ended_at.is_some());
    }

    #[tokio::test]
    async fn roster_recording_never_duplicates() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let cfg = config("alpha", 1000);
        let (id, _) = store.ensure_session(&cfg).await.unwrap();

        for _ in 0..3 {
            store.record_members(id, &cfg.members).await.unwrap();
        }
        let detail = store.fetch_session(id).await.unwrap().unwrap();
        assert_eq!(detail.members.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_message_delivery_is_a_noop() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let (id, _) = store.ensure_session(&config("alpha", 1000)).await.unwrap();

        let msg = message("worker", "2026-08-01T12:00:00Z");
        for _ in 0..4 {
            store.record_message(id, "lead", &msg).await.unwrap();
        }
        // Same sender and timestamp to a different recipient is a new row.
        store.record_message(id, "worker", &msg).await.unwrap();

        let detail = store.fetch_session(id).await.unwrap().unwrap();
        assert_eq!(detail.messages.len(), 2);
    }

    #[tokio::test]
    async fn task_rows_replace_instead_of_accumulating() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let (id, _) = store.ensure_session(&config("alpha", 1000)).await.unwrap();

        store
            .record_task(id, &task("7", TaskStatus::Pending))
            .await
            .unwrap();
        store
            .record_task(id, &task("7", TaskStatus::Completed))
            .await
            .unwrap();

        let detail = store.fetch_session(id).await.unwrap().unwrap();
        assert_eq!(detail.tasks.len(), 1);
        assert_eq!(detail.tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn internal_and_deleted_tasks_are_hidden_from_detail() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let (id, _) = store.ensure_session(&config("alpha", 1000)).await.unwrap();

        let mut internal = task("1", TaskStatus::Pending);
        internal.internal = true;
        store.record_task(id, &internal).await.unwrap();
        store
            .record_task(id, &task("2", TaskStatus::Deleted))
            .await
            .unwrap();
        store
            .record_task(id, &task("3", TaskStatus::InProgress))
            .await
            .unwrap();

        let detail = store.fetch_session(id).await.unwrap().unwrap();
        assert_eq!(detail.tasks.len(), 1);
        assert_eq!(detail.tasks[0].id, "3");
    }

    #[tokio::test]
    async fn fetch_unknown_session_is_none() {
        let store = SessionStore::open_in_memory().await.unwrap();
        assert!(store.fetch_session(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn structured_message_payload_round_trips() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let (id, _) = store.ensure_session(&config("alpha", 1000)).await.unwrap();

        let msg = InboxMessage::from_raw(RawInboxMessage {
            from: "lead".into(),
            text: r#"{"type":"task_assignment","taskId":"5"}"#.into(),
            timestamp: "2026-08-01T12:00:00Z".into(),
            color: None,
            read: true,
        });
        store.record_message(id, "worker", &msg).await.unwrap();

        let detail = store.fetch_session(id).await.unwrap().unwrap();
        let stored = &detail.messages[0];
        assert_eq!(stored.kind, MessageKind::TaskAssignment);
        assert_eq!(stored.payload.as_ref().unwrap()["taskId"], "5");
        assert!(stored.read);
    }
}
