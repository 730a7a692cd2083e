use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Coalesces bursts of notifications for the same path into one emission.
///
/// Some platforms fire several notifications for a single logical write
/// (open/write/close); without coalescing the aggregator would re-read a
/// file multiple times per change and risk reading a half-written file.
///
/// Each distinct path owns at most one pending timer. A new notification
/// cancels the path's existing timer and starts a fresh one, so under a
/// steady stream of notifications faster than the delay a path is emitted
/// exactly once after the stream quiesces, and a path with zero
/// notifications is never emitted.
///
/// Must be driven from within a tokio runtime; timers are spawned tasks.
pub struct ChangeDebouncer {
    delay: Duration,
    out: flume::Sender<PathBuf>,
    pending: HashMap<PathBuf, JoinHandle<()>>,
}

impl ChangeDebouncer {
    pub fn new(delay: Duration, out: flume::Sender<PathBuf>) -> Self {
        Self {
            delay,
            out,
            pending: HashMap::new(),
        }
    }

    /// Register a raw notification for `path`, restarting its timer.
    pub fn notify(&mut self, path: PathBuf) {
        self.pending.retain(|_, timer| !timer.is_finished());
        if let Some(timer) = self.pending.remove(&path) {
            timer.abort();
        }

        let delay = self.delay;
        let out = self.out.clone();
        let key = path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = out.send_async(path).await;
        });
        self.pending.insert(key, timer);
    }

    /// Cancel every pending timer. Nothing is emitted for a cancelled path.
    pub fn flush(&mut self) {
        for (_, timer) in self.pending.drain() {
            timer.abort();
        }
    }
}

impl Drop for ChangeDebouncer {
    fn drop(&mut self) {
        self.flush();
    }
}
