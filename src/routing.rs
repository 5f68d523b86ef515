use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::runway::Runway;
use crate::tracker::TargetAccessibilityTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Latency,
    FirstAccessible,
    RoundRobin,
}

impl RoutingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "latency" => Some(Self::Latency),
            "first_accessible" => Some(Self::FirstAccessible),
            "round_robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// Picks one runway for a target from the tracker's accessible set.
///
/// The mode lock and the round-robin cursor map are separate so that a mode
/// change never contends with request handling.
pub struct RoutingEngine {
    tracker: Arc<TargetAccessibilityTracker>,
    mode: RwLock<RoutingMode>,
    round_robin_index: parking_lot::Mutex<HashMap<String, usize>>,
}

impl RoutingEngine {
    pub fn new(tracker: Arc<TargetAccessibilityTracker>, mode: RoutingMode) -> Self {
        Self {
            tracker,
            mode: RwLock::new(mode),
            round_robin_index: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: RoutingMode) {
        *self.mode.write() = mode;
        log::info!("Routing mode changed to {:?}", mode);
    }

    pub fn mode(&self) -> RoutingMode {
        *self.mode.read()
    }

    /// Selects a runway for `target` out of `runways`, or `None` when the
    /// tracker knows no eligible runway. Candidate order follows the caller's
    /// list order.
    pub fn select_runway(&self, target: &str, runways: &[Runway]) -> Option<Runway> {
        let accessible_ids = self.tracker.get_accessible_runways(target);
        if accessible_ids.is_empty() {
            return None;
        }

        let candidates: Vec<&Runway> = runways
            .iter()
            .filter(|r| accessible_ids.contains(&r.id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        match self.mode() {
            RoutingMode::Latency => self.select_by_latency(target, &candidates),
            RoutingMode::FirstAccessible => Some(candidates[0].clone()),
            RoutingMode::RoundRobin => self.select_round_robin(target, &candidates),
        }
    }

    /// Smallest positive tracked average response time wins; ties keep the
    /// earlier candidate. Falls back to the first candidate when no latency
    /// sample exists yet.
    fn select_by_latency(&self, target: &str, candidates: &[&Runway]) -> Option<Runway> {
        let mut best: Option<(&Runway, f64)> = None;

        for runway in candidates {
            if let Some(metrics) = self.tracker.get_metrics(target, &runway.id) {
                if metrics.avg_response_time > 0.0 {
                    let is_better = best
                        .as_ref()
                        .map(|(_, time)| metrics.avg_response_time < *time)
                        .unwrap_or(true);
                    if is_better {
                        best = Some((runway, metrics.avg_response_time));
                    }
                }
            }
        }

        best.map(|(r, _)| r.clone())
            .or_else(|| candidates.first().map(|r| (*r).clone()))
    }

    fn select_round_robin(&self, target: &str, candidates: &[&Runway]) -> Option<Runway> {
        if candidates.is_empty() {
            return None;
        }

        let mut index_map = self.round_robin_index.lock();
        let index = index_map.entry(target.to_string()).or_insert(0);
        let selected = candidates[*index % candidates.len()].clone();
        *index = (*index + 1) % candidates.len();
        Some(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runway(id: &str) -> Runway {
        Runway::new(id.to_string(), "eth0".to_string(), None, None, None)
    }

    /// Tracker with every listed runway marked Accessible for `target`.
    fn tracker_with(target: &str, runway_rtts: &[(&str, u64)]) -> Arc<TargetAccessibilityTracker> {
        let tracker = Arc::new(TargetAccessibilityTracker::new(10, 0.5));
        for (id, rtt_ms) in runway_rtts {
            tracker.update(target, id, true, true, Duration::from_millis(*rtt_ms));
        }
        tracker
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(RoutingMode::parse("latency"), Some(RoutingMode::Latency));
        assert_eq!(
            RoutingMode::parse("first_accessible"),
            Some(RoutingMode::FirstAccessible)
        );
        assert_eq!(RoutingMode::parse("round_robin"), Some(RoutingMode::RoundRobin));
        assert_eq!(RoutingMode::parse("fastest"), None);
    }

    #[test]
    fn test_empty_runway_list_selects_nothing() {
        let tracker = tracker_with("example.com", &[("r1", 50)]);
        let engine = RoutingEngine::new(tracker, RoutingMode::FirstAccessible);
        assert!(engine.select_runway("example.com", &[]).is_none());
    }

    #[test]
    fn test_no_accessible_runway_selects_nothing() {
        let tracker = Arc::new(TargetAccessibilityTracker::new(10, 0.5));
        let engine = RoutingEngine::new(tracker, RoutingMode::FirstAccessible);
        let runways = vec![runway("r1"), runway("r2")];
        assert!(engine.select_runway("example.com", &runways).is_none());
    }

    #[test]
    fn test_latency_mode_prefers_fastest() {
        let tracker = tracker_with("example.com", &[("r1", 50), ("r2", 20)]);
        let engine = RoutingEngine::new(tracker, RoutingMode::Latency);
        let runways = vec![runway("r1"), runway("r2")];

        let selected = engine.select_runway("example.com", &runways).unwrap();
        assert_eq!(selected.id, "r2");
    }

    #[test]
    fn test_latency_mode_falls_back_to_first_without_samples() {
        // Partial outcomes never feed the EMA, so avg stays 0.
        let tracker = Arc::new(TargetAccessibilityTracker::new(10, 0.5));
        tracker.update("example.com", "r1", true, false, Duration::ZERO);
        tracker.update("example.com", "r2", true, false, Duration::ZERO);
        let engine = RoutingEngine::new(tracker, RoutingMode::Latency);
        let runways = vec![runway("r1"), runway("r2")];

        let selected = engine.select_runway("example.com", &runways).unwrap();
        assert_eq!(selected.id, "r1");
    }

    #[test]
    fn test_first_accessible_is_stable() {
        let tracker = tracker_with("example.com", &[("r1", 50), ("r2", 20)]);
        let engine = RoutingEngine::new(tracker, RoutingMode::FirstAccessible);
        let runways = vec![runway("r1"), runway("r2")];

        let a = engine.select_runway("example.com", &runways).unwrap();
        let b = engine.select_runway("example.com", &runways).unwrap();
        assert_eq!(a.id, "r1");
        assert_eq!(b.id, "r1");
    }

    #[test]
    fn test_round_robin_visits_each_once_per_cycle() {
        let tracker = tracker_with("example.com", &[("r1", 50), ("r2", 20), ("r3", 30)]);
        let engine = RoutingEngine::new(tracker, RoutingMode::RoundRobin);
        let runways = vec![runway("r1"), runway("r2"), runway("r3")];

        let cycle: Vec<String> = (0..3)
            .map(|_| engine.select_runway("example.com", &runways).unwrap().id)
            .collect();
        assert_eq!(cycle, vec!["r1", "r2", "r3"]);

        // Second cycle repeats in the same order.
        let again: Vec<String> = (0..3)
            .map(|_| engine.select_runway("example.com", &runways).unwrap().id)
            .collect();
        assert_eq!(again, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn test_round_robin_cursor_is_per_target() {
        let tracker = Arc::new(TargetAccessibilityTracker::new(10, 0.5));
        tracker.update("a.example", "r1", true, true, Duration::from_millis(10));
        tracker.update("a.example", "r2", true, true, Duration::from_millis(10));
        tracker.update("b.example", "r1", true, true, Duration::from_millis(10));
        tracker.update("b.example", "r2", true, true, Duration::from_millis(10));
        let engine = RoutingEngine::new(tracker, RoutingMode::RoundRobin);
        let runways = vec![runway("r1"), runway("r2")];

        assert_eq!(engine.select_runway("a.example", &runways).unwrap().id, "r1");
        assert_eq!(engine.select_runway("b.example", &runways).unwrap().id, "r1");
        assert_eq!(engine.select_runway("a.example", &runways).unwrap().id, "r2");
        assert_eq!(engine.select_runway("b.example", &runways).unwrap().id, "r2");
    }

    #[test]
    fn test_mode_switch_at_runtime() {
        let tracker = tracker_with("example.com", &[("r1", 50), ("r2", 20)]);
        let engine = RoutingEngine::new(tracker, RoutingMode::FirstAccessible);
        let runways = vec![runway("r1"), runway("r2")];

        assert_eq!(engine.select_runway("example.com", &runways).unwrap().id, "r1");
        engine.set_mode(RoutingMode::Latency);
        assert_eq!(engine.mode(), RoutingMode::Latency);
        assert_eq!(engine.select_runway("example.com", &runways).unwrap().id, "r2");
    }

    #[test]
    fn test_candidate_order_follows_caller() {
        let tracker = tracker_with("example.com", &[("r1", 50), ("r2", 50)]);
        let engine = RoutingEngine::new(tracker, RoutingMode::FirstAccessible);

        let selected = engine
            .select_runway("example.com", &[runway("r2"), runway("r1")])
            .unwrap();
        assert_eq!(selected.id, "r2");
    }
}
