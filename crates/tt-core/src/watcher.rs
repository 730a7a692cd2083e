use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::classify::{PathClass, PathClassifier};
use crate::debounce::ChangeDebouncer;

/// A classified change to one file beneath the watched roots. The class is
/// never [`PathClass::Ignored`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub class: PathClass,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watched root {0} is not accessible: {1}")]
    RootUnavailable(PathBuf, std::io::Error),
    #[error("watch registration failed: {0}")]
    Notify(#[from] notify::Error),
}

/// Where to watch and how long to let notifications settle.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub teams_root: PathBuf,
    pub tasks_root: PathBuf,
    pub debounce: Duration,
}

/// Watches the teams and tasks roots, debounces raw notifications, and
/// emits classified change events as one ordered stream.
///
/// On start the watcher synchronously enumerates every existing file and
/// synthesizes one event per recognized file, so teams that were already
/// running are discovered on a cold start. Live notifications follow.
pub struct FileWatcher {
    events: flume::Receiver<ChangeEvent>,
    // Dropping the notify handle releases the OS watch.
    _watcher: RecommendedWatcher,
    pump: tokio::task::JoinHandle<()>,
}

impl FileWatcher {
    /// Scan the roots, register recursive directory watches, and start the
    /// debounce/classify pump. Fails when either root is inaccessible.
    pub fn start(config: WatcherConfig) -> Result<Self, WatchError> {
        for root in [&config.teams_root, &config.tasks_root] {
            std::fs::metadata(root)
                .map_err(|e| WatchError::RootUnavailable(root.clone(), e))?;
        }

        let classifier = PathClassifier::new(&config.teams_root, &config.tasks_root);
        let (events_tx, events_rx) = flume::unbounded::<ChangeEvent>();

        // Baseline: one synthesized event per existing recognized file,
        // configs first so teams exist before their inboxes and tasks.
        let baseline = scan_existing(&classifier, &[&config.teams_root, &config.tasks_root]);
        debug!(files = baseline.len(), "initial scan complete");
        for event in baseline {
            let _ = events_tx.send(event);
        }

        // notify callbacks run on the watcher's own thread and only forward
        // raw paths; all real work happens on the pump task.
        let (raw_tx, raw_rx) = flume::unbounded::<PathBuf>();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            })?;

        // Directory-registered recursive watches. Glob registration is
        // deliberately avoided: it does not fire for nested modifications
        // on every backend.
        watcher.watch(&config.teams_root, RecursiveMode::Recursive)?;
        watcher.watch(&config.tasks_root, RecursiveMode::Recursive)?;

        let pump = tokio::spawn(pump_events(classifier, config.debounce, raw_rx, events_tx));

        Ok(Self {
            events: events_rx,
            _watcher: watcher,
            pump,
        })
    }

    /// The ordered stream of classified change events. The receiver keeps
    /// yielding queued events after [`stop`](Self::stop) and then reports
    /// disconnection, which is the aggregator's drain signal.
    pub fn events(&self) -> flume::Receiver<ChangeEvent> {
        self.events.clone()
    }

    /// Stop watching: pending debounce timers are cancelled, the OS watch
    /// handle is released, and nothing further is emitted.
    pub fn stop(self) {
        self.pump.abort();
        debug!("file watcher stopped");
    }
}

/// Routes raw notification paths through the debouncer, classifies paths
/// whose burst has quiesced, and forwards recognized changes.
async fn pump_events(
    classifier: PathClassifier,
    delay: Duration,
    raw_rx: flume::Receiver<PathBuf>,
    events_tx: flume::Sender<ChangeEvent>,
) {
    let (fired_tx, fired_rx) = flume::unbounded::<PathBuf>();
    let mut debouncer = ChangeDebouncer::new(delay, fired_tx);

    loop {
        tokio::select! {
            raw = raw_rx.recv_async() => match raw {
                Ok(path) => debouncer.notify(path),
                // Watch handle gone; debouncer Drop cancels pending timers.
                Err(_) => break,
            },
            fired = fired_rx.recv_async() => match fired {
                Ok(path) => match classifier.classify(&path) {
                    PathClass::Ignored => {
                        debug!(path = %path.display(), "ignoring unrecognized change");
                    }
                    class => {
                        if events_tx.send(ChangeEvent { class, path }).is_err() {
                            // No consumer left.
                            break;
                        }
                    }
                },
                Err(_) => break,
            },
        }
    }
}

/// Recursive synchronous enumeration of the watched roots, ordered configs
/// first, then inboxes, then tasks (path-sorted within each group).
fn scan_existing(classifier: &PathClassifier, roots: &[&Path]) -> Vec<ChangeEvent> {
    fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => walk(&path, files),
                Ok(ft) if ft.is_file() => files.push(path),
                _ => {}
            }
        }
    }

    let mut files = Vec::new();
    for root in roots {
        walk(root, &mut files);
    }
    files.sort();

    let mut events: Vec<ChangeEvent> = files
        .into_iter()
        .filter_map(|path| match classifier.classify(&path) {
            PathClass::Ignored => None,
            class => Some(ChangeEvent { class, path }),
        })
        .collect();
    events.sort_by_key(|event| match &event.class {
        PathClass::TeamConfig { .. } => 0,
        PathClass::Inbox { .. } => 1,
        PathClass::Task { .. } => 2,
        PathClass::Ignored => 3,
    });
    events
}
