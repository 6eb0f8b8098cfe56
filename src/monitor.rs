//! The poll loop: walks every target in order, one detect → dispatch →
//! persist unit at a time, with jittered pauses in between.

use crate::detector::detect;
use crate::dispatch::{dispatch, DispatchReport, ALERT_DELAY};
use crate::error::{CycleError, StoreError};
use crate::follows::{FollowStreamAdapter, UserId};
use crate::notifier::Notifier;
use crate::store::{WatermarkStore, Watermarks};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Timing policy for the loop.
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Random pause between two targets, inclusive bounds.
    pub between_targets: (Duration, Duration),
    /// Pass delay is `poll_interval ± poll_jitter`...
    pub poll_jitter: Duration,
    /// ...but never shorter than this.
    pub min_pass_delay: Duration,
    pub alert_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            between_targets: (Duration::from_secs(5), Duration::from_secs(15)),
            poll_jitter: Duration::from_secs(30),
            min_pass_delay: Duration::from_secs(10),
            alert_delay: ALERT_DELAY,
        }
    }
}

impl Pacing {
    /// No waiting at all. Handy for `once` runs in tests.
    pub fn immediate() -> Self {
        Self {
            between_targets: (Duration::ZERO, Duration::ZERO),
            poll_jitter: Duration::ZERO,
            min_pass_delay: Duration::ZERO,
            alert_delay: Duration::ZERO,
        }
    }

    pub fn target_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        let (low, high) = self.between_targets;
        if high <= low {
            return low;
        }
        Duration::from_secs_f64(rng.gen_range(low.as_secs_f64()..=high.as_secs_f64()))
    }

    pub fn pass_delay<R: Rng>(&self, poll_interval: Duration, rng: &mut R) -> Duration {
        let jitter = self.poll_jitter.as_secs_f64();
        let offset = if jitter > 0.0 {
            rng.gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        let secs = (poll_interval.as_secs_f64() + offset).max(self.min_pass_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// What one target's unit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOutcome {
    pub new_follows: usize,
    pub first_run: bool,
    pub alerts: DispatchReport,
    /// Watermark written this cycle, if it moved.
    pub committed: Option<UserId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub checked: usize,
    pub failed: usize,
    pub new_follows: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
    /// The pass stopped early because shutdown was requested.
    pub interrupted: bool,
}

pub struct Monitor {
    targets: Vec<UserId>,
    poll_interval: Duration,
    adapter: FollowStreamAdapter,
    notifier: Arc<dyn Notifier>,
    store: Box<dyn WatermarkStore>,
    pacing: Pacing,
    rng: StdRng,
}

impl Monitor {
    pub fn new(
        targets: Vec<UserId>,
        poll_interval: Duration,
        adapter: FollowStreamAdapter,
        notifier: Arc<dyn Notifier>,
        store: Box<dyn WatermarkStore>,
    ) -> Self {
        Self {
            targets,
            poll_interval,
            adapter,
            notifier,
            store,
            pacing: Pacing::default(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn store(&self) -> &dyn WatermarkStore {
        self.store.as_ref()
    }

    pub async fn load_state(&mut self) -> Result<Watermarks, StoreError> {
        let state = self.store.load_all().await?;
        info!("Loaded {} watermarks", state.len());
        Ok(state)
    }

    /// Run detect → dispatch → persist for a single target.
    ///
    /// The watermark only moves after dispatch finished, and never when
    /// detection failed.
    pub async fn check_target(&mut self, target: &UserId) -> Result<TargetOutcome, CycleError> {
        let session = self
            .adapter
            .session()
            .await
            .map_err(|source| CycleError::Provider {
                phase: "session",
                source,
            })?;

        let last_seen = self.store.get(target).await?;
        info!(
            target_id = %target,
            "Checking follows (last seen: {})",
            last_seen.as_ref().map(UserId::as_str).unwrap_or("none")
        );

        let mut stream = session.stream(target);
        let result = detect(&mut stream, last_seen.as_ref())
            .await
            .map_err(|source| CycleError::Provider {
                phase: "detect",
                source,
            })?;

        let mut outcome = TargetOutcome {
            new_follows: result.new_follows.len(),
            first_run: result.first_run,
            ..Default::default()
        };

        if result.new_follows.is_empty() {
            debug!(target_id = %target, "No new follows");
        } else {
            info!(target_id = %target, "Found {} new follows", result.new_follows.len());
        }
        if result.boundary_missing() && !result.new_follows.is_empty() {
            warn!(
                target_id = %target,
                "Last seen account no longer in following list; treating the {} most recent as new",
                result.new_follows.len()
            );
        }

        if result.should_alert() {
            let label = session.resolve_target(target).await;
            outcome.alerts = dispatch(
                self.notifier.as_ref(),
                target,
                &label,
                &result.new_follows,
                self.pacing.alert_delay,
            )
            .await;
        } else if result.first_run && result.new_watermark.is_some() {
            info!(target_id = %target, "First run: baseline recorded, skipping initial alerts");
        }

        if let Some(watermark) = result.new_watermark {
            if last_seen.as_ref() != Some(&watermark) {
                if let Err(e) = self.store.set(target, &watermark).await {
                    error!(
                        target_id = %target,
                        phase = "persist",
                        "Could not save watermark {}, alerts may repeat next cycle: {}",
                        watermark,
                        e
                    );
                    return Err(e.into());
                }
                outcome.committed = Some(watermark);
            }
        }

        Ok(outcome)
    }

    /// One pass over all targets in configuration order.
    pub async fn run_pass(&mut self, shutdown: &mut watch::Receiver<bool>) -> PassReport {
        let mut report = PassReport::default();
        let targets = self.targets.clone();

        for (idx, target) in targets.iter().enumerate() {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            report.checked += 1;
            match self.check_target(target).await {
                Ok(outcome) => {
                    report.new_follows += outcome.new_follows;
                    report.alerts_sent += outcome.alerts.sent;
                    report.alerts_failed += outcome.alerts.failed;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(target_id = %target, phase = e.phase(), "Error monitoring target: {}", e);
                }
            }

            if idx + 1 < targets.len() {
                let delay = self.pacing.target_delay(&mut self.rng);
                if !sleep_or_shutdown(delay, shutdown).await {
                    report.interrupted = true;
                    break;
                }
            }
        }

        info!(
            checked = report.checked,
            failed = report.failed,
            new_follows = report.new_follows,
            alerts_sent = report.alerts_sent,
            alerts_failed = report.alerts_failed,
            "Pass complete"
        );
        report
    }

    /// Repeat passes until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting monitor for {} targets. Poll interval: {}s",
            self.targets.len(),
            self.poll_interval.as_secs()
        );

        loop {
            let report = self.run_pass(&mut shutdown).await;
            if report.interrupted || *shutdown.borrow() {
                break;
            }

            let delay = self.pacing.pass_delay(self.poll_interval, &mut self.rng);
            info!("Cycle complete. Sleeping for {:.0}s", delay.as_secs_f64());
            if !sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        info!("Monitor stopped");
    }
}

/// Sleep for `duration` unless shutdown is requested first. Returns `false`
/// when interrupted.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop any more.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::RecordingNotifier;
    use crate::error::NotifierError;
    use crate::follows::stream::testing::{FixedProvider, ScriptedClient};
    use crate::notifier::Alert;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn monitor(
        client: Arc<ScriptedClient>,
        notifier: Arc<RecordingNotifier>,
        store: Box<dyn WatermarkStore>,
        targets: &[&str],
    ) -> Monitor {
        Monitor::new(
            targets.iter().map(|t| UserId::new(*t)).collect(),
            Duration::from_secs(300),
            FollowStreamAdapter::new(Arc::new(FixedProvider(client))),
            notifier,
            store,
        )
        .with_pacing(Pacing::immediate())
    }

    async fn watermark(monitor: &Monitor, target: &str) -> Option<String> {
        monitor
            .store()
            .get(&UserId::new(target))
            .await
            .unwrap()
            .map(|id| id.as_str().to_string())
    }

    #[tokio::test]
    async fn test_first_run_then_incremental_alert() {
        let client = Arc::new(ScriptedClient::new(3));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(
            client.clone(),
            notifier.clone(),
            Box::new(MemoryStore::new()),
            &["100", "200"],
        );
        let (_tx, mut rx) = watch::channel(false);

        client.set_following("100", &["u9", "u8", "u7", "u6", "u5", "u4"]);
        let report = monitor.run_pass(&mut rx).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.alerts_sent, 0);
        assert_eq!(watermark(&monitor, "100").await.as_deref(), Some("u9"));
        // Target 200 follows nobody yet, so it has no baseline.
        assert_eq!(watermark(&monitor, "200").await, None);

        client.set_following("100", &["u10", "u9", "u8"]);
        let report = monitor.run_pass(&mut rx).await;
        assert_eq!(report.new_follows, 1);
        assert_eq!(report.alerts_sent, 1);
        assert_eq!(notifier.descriptions(), vec!["**User u10** (@u10)"]);
        assert_eq!(watermark(&monitor, "100").await.as_deref(), Some("u10"));
    }

    #[tokio::test]
    async fn test_alerts_are_delivered_oldest_first() {
        let client = Arc::new(ScriptedClient::new(2));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut entries = Watermarks::new();
        entries.insert(UserId::new("100"), UserId::new("u1"));
        let mut monitor = monitor(
            client.clone(),
            notifier.clone(),
            Box::new(MemoryStore::with_entries(entries)),
            &["100"],
        );

        client.set_following("100", &["c", "b", "a", "u1"]);
        let outcome = monitor.check_target(&UserId::new("100")).await.unwrap();

        assert_eq!(outcome.alerts.sent, 3);
        assert_eq!(outcome.committed, Some(UserId::new("c")));
        assert_eq!(
            notifier.descriptions(),
            vec!["**User a** (@a)", "**User b** (@b)", "**User c** (@c)"]
        );
    }

    #[tokio::test]
    async fn test_provider_failure_is_isolated() {
        let client = Arc::new(ScriptedClient::new(5));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut entries = Watermarks::new();
        entries.insert(UserId::new("100"), UserId::new("old"));
        entries.insert(UserId::new("200"), UserId::new("u1"));
        let mut monitor = monitor(
            client.clone(),
            notifier.clone(),
            Box::new(MemoryStore::with_entries(entries)),
            &["100", "200"],
        );
        let (_tx, mut rx) = watch::channel(false);

        client.set_following("100", &["new", "old"]);
        client.fail("100");
        client.set_following("200", &["u2", "u1"]);

        let report = monitor.run_pass(&mut rx).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.alerts_sent, 1);
        assert_eq!(watermark(&monitor, "100").await.as_deref(), Some("old"));
        assert_eq!(watermark(&monitor, "200").await.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_nothing_new_writes_nothing() {
        let client = Arc::new(ScriptedClient::new(5));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut entries = Watermarks::new();
        entries.insert(UserId::new("100"), UserId::new("u2"));
        let mut monitor = monitor(
            client.clone(),
            notifier.clone(),
            Box::new(MemoryStore::with_entries(entries)),
            &["100"],
        );

        client.set_following("100", &["u2", "u1"]);
        let outcome = monitor.check_target(&UserId::new("100")).await.unwrap();
        assert_eq!(outcome, TargetOutcome::default());
        assert!(notifier.descriptions().is_empty());
    }

    /// Memory store whose writes can be switched off.
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: bool,
    }

    #[async_trait]
    impl WatermarkStore for FlakyStore {
        async fn load_all(&mut self) -> Result<Watermarks, StoreError> {
            self.inner.load_all().await
        }

        async fn get(&self, target: &UserId) -> Result<Option<UserId>, StoreError> {
            self.inner.get(target).await
        }

        async fn set(&mut self, target: &UserId, id: &UserId) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Io {
                    path: "state.json".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.set(target, id).await
        }
    }

    #[tokio::test]
    async fn test_failed_persist_redelivers_next_cycle() {
        let client = Arc::new(ScriptedClient::new(5));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut entries = Watermarks::new();
        entries.insert(UserId::new("100"), UserId::new("u1"));
        let mut monitor = monitor(
            client.clone(),
            notifier.clone(),
            Box::new(FlakyStore {
                inner: MemoryStore::with_entries(entries),
                fail_writes: true,
            }),
            &["100"],
        );

        client.set_following("100", &["u2", "u1"]);
        let err = monitor.check_target(&UserId::new("100")).await.unwrap_err();
        assert_eq!(err.phase(), "persist");
        assert_eq!(watermark(&monitor, "100").await.as_deref(), Some("u1"));

        // Same delta comes back: duplicate delivery rather than silent loss.
        let err = monitor.check_target(&UserId::new("100")).await.unwrap_err();
        assert_eq!(err.phase(), "persist");
        assert_eq!(notifier.descriptions().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_target() {
        let client = Arc::new(ScriptedClient::new(5));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(
            client.clone(),
            notifier,
            Box::new(MemoryStore::new()),
            &["100", "200"],
        );
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = monitor.run_pass(&mut rx).await;
        assert!(report.interrupted);
        assert_eq!(report.checked, 0);
    }

    /// Requests shutdown as soon as the first alert goes out.
    struct ShutdownOnSend(watch::Sender<bool>);

    #[async_trait]
    impl Notifier for ShutdownOnSend {
        async fn send(&self, _alert: &Alert) -> Result<(), NotifierError> {
            let _ = self.0.send(true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_dispatch_still_persists() {
        let client = Arc::new(ScriptedClient::new(5));
        let (tx, mut rx) = watch::channel(false);
        let mut entries = Watermarks::new();
        entries.insert(UserId::new("100"), UserId::new("u1"));
        entries.insert(UserId::new("200"), UserId::new("v1"));
        let mut monitor = Monitor::new(
            vec![UserId::new("100"), UserId::new("200")],
            Duration::from_secs(300),
            FollowStreamAdapter::new(Arc::new(FixedProvider(client.clone()))),
            Arc::new(ShutdownOnSend(tx)),
            Box::new(MemoryStore::with_entries(entries)),
        )
        .with_pacing(Pacing::immediate());

        client.set_following("100", &["u3", "u2", "u1"]);
        client.set_following("200", &["v2", "v1"]);
        let report = monitor.run_pass(&mut rx).await;

        // Both of target 100's alerts went out and its watermark moved, but
        // target 200 was never started.
        assert!(report.interrupted);
        assert_eq!(report.checked, 1);
        assert_eq!(report.alerts_sent, 2);
        assert_eq!(watermark(&monitor, "100").await.as_deref(), Some("u3"));
        assert_eq!(watermark(&monitor, "200").await.as_deref(), Some("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown_during_sleep() {
        let client = Arc::new(ScriptedClient::new(5));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = Monitor::new(
            vec![UserId::new("100")],
            Duration::from_secs(300),
            FollowStreamAdapter::new(Arc::new(FixedProvider(client))),
            notifier,
            Box::new(MemoryStore::new()),
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            monitor.run(rx).await;
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_pass_delay_is_jittered_and_floored() {
        let pacing = Pacing::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let delay = pacing.pass_delay(Duration::from_secs(300), &mut rng);
            assert!(delay >= Duration::from_secs(270) && delay <= Duration::from_secs(330));

            let delay = pacing.pass_delay(Duration::from_secs(5), &mut rng);
            assert!(delay >= Duration::from_secs(10) && delay <= Duration::from_secs(35));
        }
    }

    #[test]
    fn test_target_delay_bounds() {
        let pacing = Pacing::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let delay = pacing.target_delay(&mut rng);
            assert!(delay >= Duration::from_secs(5) && delay <= Duration::from_secs(15));
        }
        assert_eq!(Pacing::immediate().target_delay(&mut rng), Duration::ZERO);
    }
}
