//! Bot-like click timing detection
//!
//! Humans exhibit natural jitter between taps; scripted tapping tends
//! toward unnaturally uniform intervals. This module keeps a bounded ring
//! buffer of inter-click intervals per connection and flags connections
//! whose coefficient of variation (population standard deviation divided by
//! mean) falls below a threshold.
//!
//! Classification is advisory only: it annotates the player record for
//! display but never blocks or discounts counted taps.

use std::collections::{HashMap, VecDeque};

use web_time::SystemTime;

use crate::{constants, watcher::Id};

/// Result of classifying a connection's click timing
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Whether the timing pattern was flagged as bot-like
    pub suspicious: bool,
    /// Human-readable reason when flagged
    pub reason: Option<String>,
    /// The computed coefficient of variation, when enough samples exist
    pub coefficient_of_variation: Option<f64>,
}

impl Classification {
    /// A "nothing to report" classification
    fn clear() -> Self {
        Self {
            suspicious: false,
            reason: None,
            coefficient_of_variation: None,
        }
    }
}

/// Per-connection click timing history
#[derive(Debug, Default)]
struct Timing {
    /// Timestamp of the most recent click
    last_click: Option<SystemTime>,
    /// Ring buffer of inter-click intervals in milliseconds, oldest first
    intervals: VecDeque<f64>,
}

/// Detector of unnaturally regular click timing, keyed by connection id
#[derive(Debug)]
pub struct AnomalyDetector {
    /// Capacity of the per-connection interval ring buffer
    capacity: usize,
    /// Minimum interval count required before classification
    min_samples: usize,
    /// CV threshold below which a connection is flagged
    cv_threshold: f64,
    /// Timing history per connection
    timings: HashMap<Id, Timing>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(
            constants::anomaly::DEFAULT_INTERVAL_CAPACITY,
            constants::anomaly::DEFAULT_MIN_SAMPLES,
            constants::anomaly::DEFAULT_CV_THRESHOLD,
        )
    }
}

impl AnomalyDetector {
    /// Creates a detector with the given buffer capacity, minimum sample
    /// size, and CV threshold
    pub fn new(capacity: usize, min_samples: usize, cv_threshold: f64) -> Self {
        Self {
            capacity,
            min_samples,
            cv_threshold,
            timings: HashMap::new(),
        }
    }

    /// Records a click for a connection
    ///
    /// The interval since the previous click (if any) is appended to the
    /// connection's ring buffer; the oldest interval is evicted once the
    /// buffer is at capacity.
    ///
    /// # Arguments
    ///
    /// * `connection` - The connection the click arrived on
    /// * `now` - The arrival time of the click
    pub fn record_click(&mut self, connection: Id, now: SystemTime) {
        let timing = self.timings.entry(connection).or_default();

        if let Some(last) = timing.last_click
            && let Ok(gap) = now.duration_since(last)
        {
            if timing.intervals.len() >= self.capacity {
                timing.intervals.pop_front();
            }
            timing.intervals.push_back(gap.as_secs_f64() * 1000.0);
        }

        timing.last_click = Some(now);
    }

    /// Classifies a connection's click timing
    ///
    /// Below the minimum sample size the result is always "not suspicious,
    /// insufficient data". A mean interval of zero (degenerate, e.g.
    /// duplicate timestamps) is treated as "cannot classify", not as
    /// suspicious.
    pub fn classify(&self, connection: Id) -> Classification {
        let Some(timing) = self.timings.get(&connection) else {
            return Classification::clear();
        };

        if timing.intervals.len() < self.min_samples {
            return Classification::clear();
        }

        let count = timing.intervals.len() as f64;
        let mean = timing.intervals.iter().sum::<f64>() / count;

        if mean <= f64::EPSILON {
            return Classification::clear();
        }

        let variance = timing
            .intervals
            .iter()
            .map(|interval| {
                let diff = interval - mean;
                diff * diff
            })
            .sum::<f64>()
            / count;
        let cv = variance.sqrt() / mean;

        Classification {
            suspicious: cv < self.cv_threshold,
            reason: (cv < self.cv_threshold).then(|| {
                format!(
                    "unnaturally regular tap intervals (cv {:.1}%)",
                    cv * 100.0
                )
            }),
            coefficient_of_variation: Some(cv),
        }
    }

    /// Purges all state for a connection
    pub fn forget(&mut self, connection: Id) {
        self.timings.remove(&connection);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use web_time::Duration;

    fn feed(detector: &mut AnomalyDetector, id: Id, gaps_ms: &[u64]) {
        let mut now = SystemTime::now();
        detector.record_click(id, now);
        for gap in gaps_ms {
            now += Duration::from_millis(*gap);
            detector.record_click(id, now);
        }
    }

    #[test]
    fn test_insufficient_data_is_never_suspicious() {
        let mut detector = AnomalyDetector::default();
        let id = Id::new();

        // 9 intervals, one short of the minimum
        feed(&mut detector, id, &[100; 9]);

        let result = detector.classify(id);
        assert!(!result.suspicious);
        assert_eq!(result.coefficient_of_variation, None);
    }

    #[test]
    fn test_perfectly_uniform_intervals_are_flagged() {
        let mut detector = AnomalyDetector::default();
        let id = Id::new();

        feed(&mut detector, id, &[100; 10]);

        let result = detector.classify(id);
        assert!(result.suspicious);
        assert!(result.reason.is_some());
        assert!(result.coefficient_of_variation.unwrap() < 1e-9);
    }

    #[test]
    fn test_jittery_intervals_are_not_flagged() {
        let mut detector = AnomalyDetector::default();
        let id = Id::new();

        feed(
            &mut detector,
            id,
            &[60, 210, 95, 310, 140, 85, 260, 120, 330, 70, 190, 105],
        );

        let result = detector.classify(id);
        assert!(!result.suspicious);
        assert!(result.coefficient_of_variation.unwrap() > 0.15);
    }

    #[test]
    fn test_zero_mean_cannot_classify() {
        let mut detector = AnomalyDetector::default();
        let id = Id::new();

        // Duplicate timestamps yield all-zero intervals
        feed(&mut detector, id, &[0; 12]);

        let result = detector.classify(id);
        assert!(!result.suspicious);
        assert_eq!(result.coefficient_of_variation, None);
    }

    #[test]
    fn test_ring_buffer_evicts_old_intervals() {
        let mut detector = AnomalyDetector::new(10, 10, 0.15);
        let id = Id::new();

        // Jittery prefix pushed out by a uniform tail longer than capacity
        feed(&mut detector, id, &[60, 300, 90, 250]);
        feed(&mut detector, id, &[100; 10]);

        let result = detector.classify(id);
        assert!(result.suspicious);
    }

    #[test]
    fn test_unknown_connection_is_clear() {
        let detector = AnomalyDetector::default();
        let result = detector.classify(Id::new());

        assert!(!result.suspicious);
        assert_eq!(result.reason, None);
    }

    #[test]
    fn test_forget_discards_history() {
        let mut detector = AnomalyDetector::default();
        let id = Id::new();

        feed(&mut detector, id, &[100; 20]);
        detector.forget(id);

        assert!(!detector.classify(id).suspicious);
    }
}
