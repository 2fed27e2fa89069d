//! Rolling event-rate baseline per (identity, resource).
//!
//! Events are counted in fixed windows. Once enough windows of history exist,
//! a window whose count exceeds `mean + threshold_sigma × stddev` of the
//! history (and a minimum absolute count) is flagged, once per window.
//!
//! A series idle for longer than its history is forgotten, and the number of
//! tracked keys is capped; past the cap the stalest series makes room.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::config::AnomalyConfig;

/// Upper bound on tracked (identity, resource) pairs.
pub const MAX_SERIES: usize = 16_384;

/// A window that broke from its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    /// Events in the current window.
    pub count: u64,
    /// Baseline mean per window.
    pub mean: f64,
    /// Baseline standard deviation.
    pub stddev: f64,
}

#[derive(Debug, Default)]
struct Series {
    window: i64,
    count: u64,
    history: VecDeque<u64>,
    flagged: bool,
}

/// Per-key windowed counters.
#[derive(Debug)]
pub struct AnomalyDetector {
    window_seconds: i64,
    history: usize,
    min_windows: usize,
    threshold_sigma: f64,
    min_count: u64,
    series: HashMap<(String, String), Series>,
    swept: i64,
}

impl AnomalyDetector {
    /// Detector with the given parameters.
    pub fn new(config: &AnomalyConfig) -> Self {
        Self {
            window_seconds: i64::try_from(config.window_seconds.max(1)).unwrap_or(i64::MAX),
            history: config.history.max(1),
            min_windows: config.min_windows,
            threshold_sigma: config.threshold_sigma,
            min_count: config.min_count,
            series: HashMap::new(),
            swept: i64::MIN,
        }
    }

    /// Number of tracked (identity, resource) pairs.
    pub fn tracked(&self) -> usize {
        self.series.len()
    }

    /// Forget series whose last activity fell out of the history, at most
    /// once per window, then make room under [`MAX_SERIES`].
    fn evict(&mut self, window: i64, key: &(String, String)) {
        if window > self.swept {
            self.swept = window;
            let horizon = i64::try_from(self.history).unwrap_or(i64::MAX);
            self.series
                .retain(|_, series| window.saturating_sub(series.window) <= horizon);
        }
        if self.series.len() >= MAX_SERIES && !self.series.contains_key(key) {
            let stalest = self
                .series
                .iter()
                .min_by_key(|(_, series)| series.window)
                .map(|(k, _)| k.clone());
            if let Some(stalest) = stalest {
                self.series.remove(&stalest);
            }
        }
    }

    /// Count one event at `at`; returns an anomaly the first time the
    /// current window crosses the threshold.
    pub fn observe(&mut self, identity: &str, resource: &str, at: DateTime<Utc>) -> Option<Anomaly> {
        let window = at.timestamp().div_euclid(self.window_seconds);
        let key = (identity.to_owned(), resource.to_owned());
        self.evict(window, &key);
        let series = self.series.entry(key).or_insert_with(|| Series {
                window,
                ..Series::default()
            });

        if window > series.window {
            let elapsed = window.saturating_sub(series.window);
            series.history.push_back(series.count);
            // Quiet windows in between count as zero.
            let quiet = usize::try_from(elapsed.saturating_sub(1))
                .unwrap_or(usize::MAX)
                .min(self.history);
            series.history.extend(std::iter::repeat(0).take(quiet));
            while series.history.len() > self.history {
                series.history.pop_front();
            }
            series.window = window;
            series.count = 0;
            series.flagged = false;
        }

        series.count = series.count.saturating_add(1);
        if series.flagged
            || series.history.len() < self.min_windows
            || series.count < self.min_count
        {
            return None;
        }

        let (mean, stddev) = mean_stddev(&series.history);
        let count = series.count;
        #[allow(clippy::cast_precision_loss)] // per-window event counts fit in f64
        let above = count as f64 > mean + self.threshold_sigma * stddev;
        if above {
            series.flagged = true;
            return Some(Anomaly { count, mean, stddev });
        }
        None
    }
}

#[allow(clippy::cast_precision_loss)] // window counts and history length fit in f64
fn mean_stddev(history: &VecDeque<u64>) -> (f64, f64) {
    if history.is_empty() {
        return (0.0, 0.0);
    }
    let n = history.len() as f64;
    let mean = history.iter().map(|c| *c as f64).sum::<f64>() / n;
    let variance = history
        .iter()
        .map(|c| {
            let d = *c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}
