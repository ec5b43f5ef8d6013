//! Periodic eviction of stale sessions.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use recordguard_events::{ChangeEvent, ChangeNotifier};

use super::tracker::SessionTracker;

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan for stale sessions.
    pub interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            name: "session-reaper".to_string(),
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Reaper runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReaperStats {
    pub ticks: u64,
    pub sessions_reaped: u64,
}

/// Handle to control a running reaper.
///
/// Owned by the manager's lifecycle: started on construction, stopped on
/// shutdown, so no timer leaks across test runs.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ReaperStats>>,
}

impl ReaperHandle {
    /// Spawn the reaper thread.
    pub fn spawn(
        tracker: Arc<SessionTracker>,
        notifier: Arc<ChangeNotifier>,
        config: ReaperConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ReaperStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                reaper_loop(tracker, notifier, config, shutdown_rx, stats_clone);
            })
            .expect("failed to spawn session reaper thread");

        Self {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Request graceful shutdown and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current reaper statistics.
    pub fn stats(&self) -> ReaperStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn reaper_loop(
    tracker: Arc<SessionTracker>,
    notifier: Arc<ChangeNotifier>,
    config: ReaperConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ReaperStats>>,
) {
    info!(reaper = %config.name, interval_ms = config.interval.as_millis() as u64, "session reaper started");

    loop {
        match shutdown_rx.recv_timeout(config.interval) {
            // Interval elapsed without a shutdown signal: run a pass.
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let evicted = tracker.evict_expired();
        if !evicted.is_empty() {
            debug!(reaper = %config.name, count = evicted.len(), "evicted stale sessions");
        }

        if let Ok(mut s) = stats.lock() {
            s.ticks += 1;
            s.sessions_reaped += evicted.len() as u64;
        }

        for session in evicted {
            notifier.publish(&ChangeEvent::session_expired(
                &session.scope,
                session.user_id,
                session.action.as_str(),
            ));
        }
    }

    let final_stats = stats.lock().map(|s| s.clone()).unwrap_or_default();
    if final_stats.sessions_reaped > 0 {
        debug!(
            reaper = %config.name,
            reaped = final_stats.sessions_reaped,
            "session reaper stopping"
        );
    }
    info!(reaper = %config.name, "session reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordguard_core::{RecordId, RecordScope, UserId};
    use recordguard_events::ChangeKind;

    use crate::sessions::SessionAction;

    #[test]
    fn reaper_evicts_and_publishes_expiry() {
        let tracker = SessionTracker::arc(Duration::from_millis(20));
        let notifier = Arc::new(ChangeNotifier::new());
        let (_sub_id, sub) = notifier.subscribe_channel("orders", None);

        let scope = RecordScope::new("orders", RecordId::new());
        let user = UserId::new();
        tracker.start(scope.clone(), user, SessionAction::Editing);

        let handle = ReaperHandle::spawn(
            tracker.clone(),
            notifier.clone(),
            ReaperConfig::default().with_interval(Duration::from_millis(10)),
        );

        let event = sub.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.kind, ChangeKind::SessionExpired);
        assert_eq!(event.user_id, Some(user));
        assert_eq!(tracker.session_count(), 0);

        let stats = handle.stats();
        assert!(stats.ticks >= 1);
        assert_eq!(stats.sessions_reaped, 1);

        handle.shutdown();
    }

    #[test]
    fn shutdown_stops_the_thread_promptly() {
        let tracker = SessionTracker::arc(Duration::from_secs(300));
        let notifier = Arc::new(ChangeNotifier::new());

        let handle = ReaperHandle::spawn(
            tracker,
            notifier,
            ReaperConfig::default().with_interval(Duration::from_secs(60)),
        );

        // Must not block for anything near the 60s interval.
        let start = std::time::Instant::now();
        handle.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn live_sessions_survive_reaper_ticks() {
        let tracker = SessionTracker::arc(Duration::from_secs(300));
        let notifier = Arc::new(ChangeNotifier::new());

        let scope = RecordScope::new("orders", RecordId::new());
        tracker.start(scope.clone(), UserId::new(), SessionAction::Viewing);

        let handle = ReaperHandle::spawn(
            tracker.clone(),
            notifier,
            ReaperConfig::default().with_interval(Duration::from_millis(10)),
        );

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(tracker.session_count(), 1);

        handle.shutdown();
    }
}
