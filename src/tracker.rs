use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::runway::RunwayState;

/// Accumulated outcome history for one (target, runway) pair.
///
/// Accounting: `total_attempts == network_success_count +
/// partial_success_count + failure_count`. A full success counts in
/// `network_success_count` (and `user_success_count`), a partial outcome in
/// `partial_success_count` only. The `recent_attempts` window records the
/// network-level outcome of each attempt, bounded to the configured window
/// size.
#[derive(Debug, Clone)]
pub struct TargetMetrics {
    pub target: String,
    pub runway_id: String,
    pub state: RunwayState,
    pub network_success_count: u64,
    pub user_success_count: u64,
    pub failure_count: u64,
    pub partial_success_count: u64,
    pub total_attempts: u64,
    pub avg_response_time: f64,
    pub last_success_time: Option<Instant>,
    pub last_failure_time: Option<Instant>,
    pub consecutive_failures: u32,
    pub recovery_count: u64,
    pub success_rate: f64,
    pub recent_attempts: Vec<bool>,
}

impl TargetMetrics {
    pub fn new(target: String, runway_id: String) -> Self {
        Self {
            target,
            runway_id,
            state: RunwayState::Unknown,
            network_success_count: 0,
            user_success_count: 0,
            failure_count: 0,
            partial_success_count: 0,
            total_attempts: 0,
            avg_response_time: 0.0,
            last_success_time: None,
            last_failure_time: None,
            consecutive_failures: 0,
            recovery_count: 0,
            success_rate: 0.0,
            recent_attempts: Vec::new(),
        }
    }

    fn update_success_rate(&mut self) {
        if self.recent_attempts.is_empty() {
            self.success_rate = 0.0;
            return;
        }
        let success_count = self.recent_attempts.iter().filter(|&&x| x).count();
        self.success_rate = success_count as f64 / self.recent_attempts.len() as f64;
    }
}

struct TrackerInner {
    /// target -> runway_id -> metrics
    metrics: HashMap<String, HashMap<String, TargetMetrics>>,
    /// Targets in first-seen order; the health monitor iterates this.
    target_order: Vec<String>,
}

/// Per-(target, runway) outcome accumulator. One lock serializes every
/// mutation and snapshot read; all reads return value copies.
pub struct TargetAccessibilityTracker {
    inner: Mutex<TrackerInner>,
    success_rate_window: usize,
    success_rate_threshold: f64,
}

impl TargetAccessibilityTracker {
    pub fn new(success_rate_window: usize, success_rate_threshold: f64) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                metrics: HashMap::new(),
                target_order: Vec::new(),
            }),
            success_rate_window,
            success_rate_threshold,
        }
    }

    /// Folds one attempt outcome into the pair's metrics.
    ///
    /// Full success (`network && user`) marks the runway Accessible, clears
    /// the failure streak and feeds the response-time EMA. A partial outcome
    /// (`network && !user`) marks it PartiallyAccessible. A network failure
    /// extends the streak; more than 3 consecutive failures mark the runway
    /// Inaccessible. A user-success observed while the pair was Inaccessible
    /// counts as a recovery.
    pub fn update(
        &self,
        target: &str,
        runway_id: &str,
        network_success: bool,
        user_success: bool,
        response_time: Duration,
    ) {
        let mut inner = self.inner.lock();

        if !inner.metrics.contains_key(target) {
            inner.target_order.push(target.to_string());
        }
        let metrics = inner
            .metrics
            .entry(target.to_string())
            .or_default()
            .entry(runway_id.to_string())
            .or_insert_with(|| TargetMetrics::new(target.to_string(), runway_id.to_string()));

        let previous_state = metrics.state;
        metrics.total_attempts += 1;
        let response_time_secs = response_time.as_secs_f64();

        metrics.recent_attempts.push(network_success);
        if metrics.recent_attempts.len() > self.success_rate_window {
            metrics.recent_attempts.remove(0);
        }

        if network_success && user_success {
            metrics.network_success_count += 1;
            metrics.user_success_count += 1;
            metrics.state = RunwayState::Accessible;
            metrics.last_success_time = Some(Instant::now());
            metrics.consecutive_failures = 0;

            if metrics.avg_response_time == 0.0 {
                metrics.avg_response_time = response_time_secs;
            } else {
                metrics.avg_response_time =
                    metrics.avg_response_time * 0.7 + response_time_secs * 0.3;
            }
        } else if network_success && !user_success {
            metrics.partial_success_count += 1;
            metrics.state = RunwayState::PartiallyAccessible;
        } else {
            metrics.failure_count += 1;
            metrics.last_failure_time = Some(Instant::now());
            metrics.consecutive_failures += 1;

            if metrics.consecutive_failures > 3 {
                metrics.state = RunwayState::Inaccessible;
            }
        }

        if previous_state == RunwayState::Inaccessible && user_success {
            metrics.recovery_count += 1;
            metrics.state = RunwayState::Accessible;
            log::info!("Recovery detected: {} via {}", target, runway_id);
        }

        metrics.update_success_rate();
    }

    /// Runway ids currently eligible for `target`: every Accessible runway,
    /// plus PartiallyAccessible ones whose success rate clears the threshold.
    pub fn get_accessible_runways(&self, target: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let Some(target_map) = inner.metrics.get(target) else {
            return Vec::new();
        };

        target_map
            .iter()
            .filter_map(|(runway_id, metrics)| match metrics.state {
                RunwayState::Accessible => Some(runway_id.clone()),
                RunwayState::PartiallyAccessible
                    if metrics.success_rate >= self.success_rate_threshold =>
                {
                    Some(runway_id.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn get_metrics(&self, target: &str, runway_id: &str) -> Option<TargetMetrics> {
        self.inner.lock().metrics.get(target)?.get(runway_id).cloned()
    }

    /// Known targets in first-seen order.
    pub fn get_all_targets(&self) -> Vec<String> {
        self.inner.lock().target_order.clone()
    }

    pub fn get_target_metrics(&self, target: &str) -> HashMap<String, TargetMetrics> {
        self.inner
            .lock()
            .metrics
            .get(target)
            .cloned()
            .unwrap_or_default()
    }
}
