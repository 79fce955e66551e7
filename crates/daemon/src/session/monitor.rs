//! Liveness monitor.
//!
//! Peers are expected to keep their sessions alive with input or pings. The
//! monitor periodically evicts sessions that have gone quiet for longer than
//! the idle threshold.

use std::sync::Arc;
use std::time::Duration;

use shellmux_protocol::SessionId;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::process::Session;
use super::registry::SessionRegistry;

/// Default time between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default idle time after which a session is evicted.
pub const MAX_IDLE: Duration = Duration::from_secs(300);

/// Periodic sweeper over a [`SessionRegistry`].
pub struct LivenessMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    max_idle: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            interval: SWEEP_INTERVAL,
            max_idle: MAX_IDLE,
        }
    }

    /// Sets the time between sweeps.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the idle threshold.
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Sweeps every interval until `cancel` fires.
    ///
    /// The first sweep happens one interval after the call.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            max_idle_secs = self.max_idle.as_secs(),
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::debug!("Liveness monitor stopped");
    }

    /// Evicts every session idle past the threshold right now.
    pub async fn sweep(&self) -> Vec<SessionId> {
        self.sweep_at(std::time::Instant::now()).await
    }

    /// Evicts every session that is idle past the threshold as of `now`.
    ///
    /// Returns the evicted IDs.
    pub async fn sweep_at(&self, now: std::time::Instant) -> Vec<SessionId> {
        let mut stale: Vec<(SessionId, Arc<Session>)> = Vec::new();
        self.registry.for_each(|id, session| {
            if session.idle_for(now) > self.max_idle {
                stale.push((id.clone(), Arc::clone(session)));
            }
        });

        for (id, session) in &stale {
            tracing::info!(
                session_id = %id,
                idle_secs = session.idle_for(now).as_secs(),
                "Evicting idle session"
            );
            session.terminate().await;
        }

        // Only unregister the session we tore down, not one started since.
        for (id, session) in &stale {
            self.registry.remove_if_same(id, session);
        }

        stale.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::process::ShellCommand;

    fn spawn_registered(registry: &SessionRegistry, id: &str) -> Arc<Session> {
        let (session, _streams) = Session::spawn(id, "evt", &ShellCommand::new("/bin/sh")).unwrap();
        let session = Arc::new(session);
        session.touch();
        registry.set(id, Arc::clone(&session));
        session
    }

    #[tokio::test]
    async fn test_sweep_evicts_stale_session() {
        let registry = Arc::new(SessionRegistry::new());
        let session = spawn_registered(&registry, "stale");
        let monitor = LivenessMonitor::new(Arc::clone(&registry));

        let later = session.last_activity() + Duration::from_secs(301);
        let evicted = monitor.sweep_at(later).await;

        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(registry.get("stale").is_none());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_session() {
        let registry = Arc::new(SessionRegistry::new());
        let session = spawn_registered(&registry, "fresh");
        let monitor = LivenessMonitor::new(Arc::clone(&registry));

        let evicted = monitor.sweep().await;
        assert!(evicted.is_empty());

        // Exactly at the threshold is still alive.
        let evicted = monitor
            .sweep_at(session.last_activity() + MAX_IDLE)
            .await;
        assert!(evicted.is_empty());
        assert!(registry.contains("fresh"));
        assert!(!session.is_closed());

        session.terminate().await;
    }

    #[tokio::test]
    async fn test_sweep_mixed() {
        let registry = Arc::new(SessionRegistry::new());
        let old = spawn_registered(&registry, "old");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let young = spawn_registered(&registry, "young");

        let monitor =
            LivenessMonitor::new(Arc::clone(&registry)).with_max_idle(Duration::from_millis(30));
        let evicted = monitor.sweep_at(young.last_activity()).await;

        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(old.is_closed());
        assert!(registry.contains("young"));

        young.terminate().await;
    }

    #[tokio::test]
    async fn test_run_sweeps_and_stops_on_cancel() {
        let registry = Arc::new(SessionRegistry::new());
        let session = spawn_registered(&registry, "s");
        let cancel = CancellationToken::new();

        let monitor = LivenessMonitor::new(Arc::clone(&registry))
            .with_interval(Duration::from_millis(20))
            .with_max_idle(Duration::from_millis(10));
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.contains("s") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("monitor never evicted the idle session");
        assert!(session.is_closed());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor ignored cancellation")
            .unwrap();
    }
}
