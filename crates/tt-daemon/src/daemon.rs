use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use tt_bridge::hub::BroadcastHub;
use tt_bridge::protocol::ServerMessage;
use tt_bridge::state::ApiState;
use tt_core::aggregator::{StateAggregator, TeamState};
use tt_core::config::Config;
use tt_core::shutdown::ShutdownSignal;
use tt_core::store::{SessionStore, StoreError};
use tt_core::types::{TeamChange, TeamUpdate};
use tt_core::watcher::{FileWatcher, WatcherConfig};

/// The teamtrace daemon: owns the pipeline from the watched roots to the
/// observer endpoint.
///
/// Shutdown is ordered so no change is lost mid-flight: the watcher stops
/// first (no further notifications), the aggregator and persistence worker
/// drain what is queued, then the server and its observer connections
/// close.
pub struct Daemon {
    config: Config,
    teams: Arc<TeamState>,
    store: Arc<SessionStore>,
    hub: BroadcastHub,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the history store and assemble the daemon. An unwritable store
    /// location is a fatal startup failure.
    pub async fn new(config: Config) -> Result<Self> {
        if let Some(parent) = config.store.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = SessionStore::open(&config.store.path)
            .await
            .context("failed to open history store")?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Assemble the daemon around an already-open store (useful in tests).
    pub fn with_store(config: Config, store: Arc<SessionStore>) -> Self {
        Self {
            config,
            teams: Arc::new(TeamState::new()),
            store,
            hub: BroadcastHub::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// A handle other tasks (e.g. a signal handler) use to stop the daemon.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal fires. Inaccessible watched roots and
    /// an unbindable observer port surface here as fatal errors.
    pub async fn run(self) -> Result<()> {
        // Watcher first: the initial scan synthesizes baseline events before
        // any live notification.
        let watcher = FileWatcher::start(WatcherConfig {
            teams_root: self.config.watch.teams_root.clone(),
            tasks_root: self.config.watch.tasks_root.clone(),
            debounce: Duration::from_millis(self.config.watch.debounce_ms),
        })
        .context("failed to start file watcher")?;
        info!(
            teams_root = %self.config.watch.teams_root.display(),
            tasks_root = %self.config.watch.tasks_root.display(),
            "watching agent runtime roots"
        );

        // One aggregator consumes the classified stream in arrival order.
        let (updates_tx, updates_rx) = flume::unbounded();
        let aggregator = StateAggregator::new(self.teams.clone(), updates_tx);
        let aggregator_task = tokio::spawn(aggregator.run(watcher.events()));

        // Change descriptions fan out to the store and the hub
        // independently; a slow observer never delays persistence.
        let (persist_tx, persist_rx) = flume::unbounded();
        let hub = self.hub.clone();
        let fanout_task = tokio::spawn(async move {
            while let Ok(update) = updates_rx.recv_async().await {
                let _ = persist_tx.send(update.clone());
                hub.publish(ServerMessage::TeamUpdate(update.into()));
            }
        });
        let persist_task = tokio::spawn(persist_updates(
            self.store.clone(),
            self.teams.clone(),
            persist_rx,
        ));

        // Observer endpoint.
        let api_state = Arc::new(ApiState::new(
            self.teams.clone(),
            self.store.clone(),
            self.hub.clone(),
            Duration::from_secs(self.config.bridge.heartbeat_secs),
        ));
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", self.config.bridge.port))
            .await
            .with_context(|| format!("failed to bind observer port {}", self.config.bridge.port))?;
        info!(port = listener.local_addr()?.port(), "observer endpoint listening");

        let mut server_shutdown = self.shutdown.subscribe();
        let server_signal = self.shutdown.clone();
        let server_task = tokio::spawn(async move {
            let serve = axum::serve(listener, tt_bridge::http::router(api_state))
                .with_graceful_shutdown(async move {
                    if !server_signal.is_shutting_down() {
                        let _ = server_shutdown.recv().await;
                    }
                });
            if let Err(e) = serve.await {
                error!(error = %e, "observer server error");
            }
        });

        // Park until shutdown, then wind the pipeline down in order.
        let mut shutdown_rx = self.shutdown.subscribe();
        if !self.shutdown.is_shutting_down() {
            let _ = shutdown_rx.recv().await;
        }

        info!("shutting down: stopping watcher");
        watcher.stop();
        aggregator_task.await.ok();
        fanout_task.await.ok();
        persist_task.await.ok();
        debug!("pipeline drained");
        server_task.await.ok();
        info!("shutdown complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistence worker
// ---------------------------------------------------------------------------

/// Mirror aggregator change descriptions into the session store.
///
/// Inbox and task changes need a session to attach to; the session comes
/// from the team's config. Configs are observed before inboxes and tasks in
/// the initial scan, and the runtime writes a team's config before its
/// agents exchange anything, so a missing session here is a transient
/// ordering gap: the change is skipped and the next notification heals it.
pub async fn persist_updates(
    store: Arc<SessionStore>,
    teams: Arc<TeamState>,
    updates: flume::Receiver<TeamUpdate>,
) {
    let mut sessions: HashMap<String, i64> = HashMap::new();
    while let Ok(update) = updates.recv_async().await {
        if let Err(e) = persist_one(&store, &teams, &mut sessions, &update).await {
            warn!(team = %update.team, error = %e, "failed to persist change");
        }
    }
    debug!("update stream closed, persistence worker stopping");
}

async fn persist_one(
    store: &SessionStore,
    teams: &TeamState,
    sessions: &mut HashMap<String, i64>,
    update: &TeamUpdate,
) -> Result<(), StoreError> {
    match &update.change {
        TeamChange::Config(config) => {
            let (session_id, created) = store.ensure_session(config).await?;
            sessions.insert(update.team.clone(), session_id);
            if created {
                info!(team = %update.team, session = session_id, "session started");
            }
            store.record_members(session_id, &config.members).await?;
        }
        TeamChange::Inbox { agent, messages } => {
            let Some(session_id) = session_for(store, teams, sessions, &update.team).await? else {
                debug!(team = %update.team, "no session yet, skipping inbox persist");
                return Ok(());
            };
            for message in messages {
                store.record_message(session_id, agent, message).await?;
            }
        }
        TeamChange::Tasks(tasks) => {
            let Some(session_id) = session_for(store, teams, sessions, &update.team).await? else {
                debug!(team = %update.team, "no session yet, skipping task persist");
                return Ok(());
            };
            for task in tasks {
                store.record_task(session_id, task).await?;
            }
        }
    }
    Ok(())
}

/// The session id for a team, resolved from the worker's cache or derived
/// from the team's current config snapshot. `None` when no config has been
/// observed yet.
async fn session_for(
    store: &SessionStore,
    teams: &TeamState,
    sessions: &mut HashMap<String, i64>,
    team: &str,
) -> Result<Option<i64>, StoreError> {
    if let Some(session_id) = sessions.get(team) {
        return Ok(Some(*session_id));
    }
    let Some(config) = teams.team_config(team).await else {
        return Ok(None);
    };
    let (session_id, _) = store.ensure_session(&config).await?;
    sessions.insert(team.to_string(), session_id);
    Ok(Some(session_id))
}
