//! Per-path windowed RSSI statistics.
//!
//! The [`Aggregator`] owns one [`WindowedStat`] per sensor path, each behind
//! its own mutex. The set of paths is fixed at construction: updates for a
//! path that was never registered are logged and ignored, so foreign data
//! can never grow the map.
//!
//! Two threads touch a record: the scanner's delivery path calls
//! [`Aggregator::update`] and the report loop calls
//! [`Aggregator::reset_all`] / [`Aggregator::read`]. Every one of those holds
//! the record's lock for the whole mutation or copy, so a sample landing on a
//! window boundary is counted exactly once, in one of the two windows.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, LookupError};

/// The single statistic published each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Last,
    Mean,
    Min,
    Max,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Last => write!(f, "last"),
            Self::Mean => write!(f, "mean"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last" => Ok(Self::Last),
            "mean" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Running statistics for one sensor path over the current window.
///
/// `count == 0` exactly when no sample has landed since the last reset, in
/// which case `total` is zero and `min`, `max` and `last` are unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowedStat {
    pub count: u64,
    pub total: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<f64>,
}

impl WindowedStat {
    /// `total / count`, or `None` for an empty window.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count as f64)
        }
    }

    /// The statistic selected by `mode`, if the window holds any sample.
    pub fn value(&self, mode: Mode) -> Option<f64> {
        match mode {
            Mode::Last => self.last,
            Mode::Mean => self.mean(),
            Mode::Min => self.min,
            Mode::Max => self.max,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        self.last = Some(value);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Fixed set of per-path windowed statistics.
#[derive(Debug, Default)]
pub struct Aggregator {
    records: HashMap<String, Mutex<WindowedStat>>,
}

impl Aggregator {
    /// Register `paths`, each starting with an empty window. Duplicates share
    /// one record.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = paths
            .into_iter()
            .map(|p| (p.into(), Mutex::new(WindowedStat::default())))
            .collect();
        Self { records }
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    /// Registered paths, in no particular order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Open a fresh window on every named path. Unregistered names are skipped.
    pub fn reset_all<S: AsRef<str>>(&self, paths: &[S]) {
        for path in paths {
            if self.reset(path.as_ref()).is_err() {
                debug!("reset skipped for unregistered path {}", path.as_ref());
            }
        }
    }

    /// Open a fresh window on one path.
    pub fn reset(&self, path: &str) -> Result<(), LookupError> {
        let record = self.record(path)?;
        *record.lock().unwrap_or_else(PoisonError::into_inner) = WindowedStat::default();
        Ok(())
    }

    /// Fold one sample into `path`'s window. Returns `false` (and changes
    /// nothing) when the path is unregistered or the value is not finite.
    pub fn update(&self, path: &str, value: f64) -> bool {
        let Ok(record) = self.record(path) else {
            warn!("unrecognized sensor {path}, dropping sample {value}");
            return false;
        };
        if !value.is_finite() {
            warn!("non-finite sample {value} for {path} dropped");
            return false;
        }
        record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(value);
        true
    }

    /// Snapshot of `path`'s current window.
    pub fn read(&self, path: &str) -> Result<WindowedStat, LookupError> {
        let record = self.record(path)?;
        Ok(*record.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Close `path`'s window: return its contents and open a fresh one under
    /// the same lock, so a concurrent sample lands in exactly one of them.
    pub fn take(&self, path: &str) -> Result<WindowedStat, LookupError> {
        let record = self.record(path)?;
        Ok(std::mem::take(
            &mut *record.lock().unwrap_or_else(PoisonError::into_inner),
        ))
    }

    fn record(&self, path: &str) -> Result<&Mutex<WindowedStat>, LookupError> {
        self.records.get(path).ok_or_else(|| LookupError {
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn assert_consistent(stat: &WindowedStat) {
        if stat.count == 0 {
            assert_eq!(stat.total, 0.0, "empty window with nonzero total: {stat:?}");
            assert!(stat.min.is_none() && stat.max.is_none() && stat.last.is_none());
        } else {
            assert_ne!(stat.total, 0.0, "nonempty window with zero total: {stat:?}");
            assert!(stat.min.is_some() && stat.max.is_some() && stat.last.is_some());
        }
    }

    // -----------------------------------------------------------------------
    // Mode parsing
    // -----------------------------------------------------------------------

    #[test]
    fn mode_parses_known_names() {
        assert_eq!("last".parse::<Mode>().unwrap(), Mode::Last);
        assert_eq!("mean".parse::<Mode>().unwrap(), Mode::Mean);
        assert_eq!("min".parse::<Mode>().unwrap(), Mode::Min);
        assert_eq!("max".parse::<Mode>().unwrap(), Mode::Max);
    }

    #[test]
    fn mode_rejects_unknown_and_is_case_sensitive() {
        assert!(matches!(
            "median".parse::<Mode>(),
            Err(ConfigError::UnknownMode(m)) if m == "median"
        ));
        assert!("MEAN".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_display_roundtrips_through_from_str() {
        for mode in [Mode::Last, Mode::Mean, Mode::Min, Mode::Max] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }

    // -----------------------------------------------------------------------
    // Window statistics
    // -----------------------------------------------------------------------

    #[test]
    fn mean_scenario_three_samples() {
        let agg = Aggregator::new(["lab/door"]);
        for v in [-70.0, -72.0, -68.0] {
            assert!(agg.update("lab/door", v));
        }
        let stat = agg.read("lab/door").unwrap();
        assert_eq!(stat.count, 3);
        assert_eq!(stat.mean(), Some(-70.0));
        assert_eq!(stat.min, Some(-72.0));
        assert_eq!(stat.max, Some(-68.0));
        assert_eq!(stat.last, Some(-68.0));
        assert_eq!(stat.value(Mode::Mean), Some(-70.0));
    }

    #[test]
    fn statistics_match_the_sample_sequence() {
        let samples = [-81.0, -45.0, -63.0, -90.0, -52.0, -77.0];
        let agg = Aggregator::new(["p"]);
        for v in samples {
            agg.update("p", v);
        }
        let stat = agg.read("p").unwrap();
        let sum: f64 = samples.iter().sum();
        assert_eq!(stat.count, samples.len() as u64);
        assert!((stat.mean().unwrap() - sum / samples.len() as f64).abs() < 1e-9);
        assert_eq!(stat.min, Some(-90.0));
        assert_eq!(stat.max, Some(-45.0));
        assert_eq!(stat.last, Some(-77.0));
    }

    #[test]
    fn empty_window_selects_nothing() {
        let stat = WindowedStat::default();
        for mode in [Mode::Last, Mode::Mean, Mode::Min, Mode::Max] {
            assert_eq!(stat.value(mode), None);
        }
        assert!(stat.is_empty());
    }

    #[test]
    fn reset_all_then_read_is_empty() {
        let agg = Aggregator::new(["a", "b"]);
        agg.update("a", -60.0);
        agg.update("b", -61.0);
        agg.reset_all(&["a", "b"]);
        for p in ["a", "b"] {
            let stat = agg.read(p).unwrap();
            assert_eq!(stat, WindowedStat::default());
        }
    }

    #[test]
    fn reset_all_only_touches_named_paths() {
        let agg = Aggregator::new(["a", "b"]);
        agg.update("a", -60.0);
        agg.update("b", -61.0);
        agg.reset_all(&["a", "never-registered"]);
        assert_eq!(agg.read("a").unwrap().count, 0);
        assert_eq!(agg.read("b").unwrap().count, 1);
        assert!(!agg.is_tracked("never-registered"));
    }

    #[test]
    fn update_on_unregistered_path_changes_nothing() {
        let agg = Aggregator::new(["a"]);
        agg.update("a", -50.0);
        let before = agg.read("a").unwrap();
        assert!(!agg.update("ghost", -40.0));
        assert!(!agg.update("ghost", -40.0));
        assert_eq!(agg.read("a").unwrap(), before);
        assert_eq!(agg.len(), 1);
        assert_eq!(
            agg.read("ghost"),
            Err(LookupError {
                path: "ghost".to_string()
            })
        );
    }

    #[test]
    fn non_finite_sample_is_dropped() {
        let agg = Aggregator::new(["a"]);
        assert!(!agg.update("a", f64::NAN));
        assert!(!agg.update("a", f64::INFINITY));
        assert!(agg.read("a").unwrap().is_empty());
    }

    #[test]
    fn duplicate_paths_share_one_record() {
        let agg = Aggregator::new(["x", "x"]);
        assert_eq!(agg.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_updates_are_all_counted() {
        let agg = Arc::new(Aggregator::new(["p"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        agg.update("p", -50.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stat = agg.read("p").unwrap();
        assert_eq!(stat.count, 8000);
        assert_eq!(stat.total, -400_000.0);
    }

    #[test]
    fn take_never_loses_a_sample() {
        let agg = Arc::new(Aggregator::new(["p"]));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..2500 {
                        agg.update("p", -1.0);
                    }
                })
            })
            .collect();

        let mut drained = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            let window = agg.take("p").unwrap();
            assert_consistent(&window);
            drained += window.count;
        }
        for w in writers {
            w.join().unwrap();
        }
        drained += agg.take("p").unwrap().count;
        assert_eq!(drained, 10_000);
        assert!(agg.read("p").unwrap().is_empty());
    }

    #[test]
    fn invariant_holds_under_interleaved_updates_and_resets() {
        let agg = Arc::new(Aggregator::new(["p"]));
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for n in 0..5000 {
                        agg.update("p", -40.0 - f64::from((i * 7 + n) % 50));
                    }
                })
            })
            .collect();

        let resetter = {
            let agg = Arc::clone(&agg);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    agg.reset_all(&["p"]);
                    std::thread::yield_now();
                }
            })
        };

        let reader = {
            let agg = Arc::clone(&agg);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    assert_consistent(&agg.read("p").unwrap());
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        resetter.join().unwrap();
        reader.join().unwrap();
        assert_consistent(&agg.read("p").unwrap());
    }
}
