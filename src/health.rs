use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::runway::RunwayState;
use crate::runway_manager::RunwayManager;
use crate::tracker::TargetAccessibilityTracker;

const MAX_TARGETS_PER_CYCLE: usize = 10;
const MAX_INACCESSIBLE_PROBES: usize = 5;
const MAX_PARTIAL_PROBES: usize = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Background worker that refreshes interface state and re-probes paths that
/// recently failed, feeding results back into the tracker.
pub struct HealthMonitor {
    runway_manager: Arc<RunwayManager>,
    tracker: Arc<TargetAccessibilityTracker>,
    interval: Duration,
    running: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        runway_manager: Arc<RunwayManager>,
        tracker: Arc<TargetAccessibilityTracker>,
        interval_secs: u64,
    ) -> Self {
        Self {
            runway_manager,
            tracker,
            interval: Duration::from_secs(interval_secs),
            running: AtomicBool::new(false),
        }
    }

    pub async fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
        log::info!("Health monitor started (interval: {:?})", self.interval);

        while self.running.load(Ordering::Relaxed) {
            self.health_check_cycle().await;
            self.sleep_interval().await;
        }

        log::info!("Health monitor exited");
    }

    /// The interval is slept in 1-second slices so `stop()` takes effect
    /// within a second.
    async fn sleep_interval(&self) {
        let mut slept = Duration::ZERO;
        while slept < self.interval && self.running.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            slept += Duration::from_secs(1);
        }
    }

    async fn health_check_cycle(&self) {
        self.runway_manager.refresh_interfaces();

        let targets = self.tracker.get_all_targets();
        if targets.is_empty() {
            return;
        }

        for target in targets.into_iter().take(MAX_TARGETS_PER_CYCLE) {
            self.check_target(&target).await;
        }
    }

    /// Re-probes the recently failed paths for one target: up to 5
    /// Inaccessible runways and up to 3 PartiallyAccessible ones. Missing
    /// runways (gone since the last discovery) are skipped silently.
    async fn check_target(&self, target: &str) {
        let metrics = self.tracker.get_target_metrics(target);

        let failed: Vec<String> = metrics
            .iter()
            .filter(|(_, m)| m.state == RunwayState::Inaccessible)
            .map(|(id, _)| id.clone())
            .take(MAX_INACCESSIBLE_PROBES)
            .collect();

        let partial: Vec<String> = metrics
            .iter()
            .filter(|(_, m)| m.state == RunwayState::PartiallyAccessible)
            .map(|(id, _)| id.clone())
            .take(MAX_PARTIAL_PROBES)
            .collect();

        for runway_id in failed.into_iter().chain(partial) {
            let Some(runway) = self.runway_manager.get_runway(&runway_id) else {
                continue;
            };
            let (net_success, user_success, response_time) = self
                .runway_manager
                .test_runway_accessibility(target, &runway, PROBE_TIMEOUT)
                .await;
            self.tracker
                .update(target, &runway_id, net_success, user_success, response_time);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        log::info!("Health monitor stopped");
    }
}
