use crate::models::{Anomaly, AnomalyKind, ArgValue, Category};
use crate::stats::RollingWindow;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

const RATE_WINDOW: usize = 60;
const PARAM_WINDOW: usize = 100;

// Rate spikes flag at a lower bar than argument values; parameters are a
// noisier tell and have to be much further out of range.
const FREQUENCY_Z_THRESHOLD: f64 = 4.0;
const PARAM_Z_THRESHOLD: f64 = 5.0;

// Variance floors: near-flat history otherwise turns tiny wiggles into
// enormous z-scores.
const MIN_RATE_STD: f64 = 0.1;
const MIN_PARAM_STD: f64 = 1.0;

const SEVERITY_Z_SCALE: f64 = 15.0;
const RECENT_CAPACITY: usize = 1000;

const SIZE_KEYS: [&str; 4] = ["size", "length", "count", "len"];

/// Per-category syscall rate tracking for one process. Counts are cheap to
/// record; statistics are settled at most once per wall-clock second.
#[derive(Debug)]
pub struct FrequencyDetector {
    category_rates: HashMap<Category, RollingWindow>,
    pending: HashMap<Category, u64>,
    last_check: Instant,
}

impl FrequencyDetector {
    pub fn new() -> Self {
        Self {
            category_rates: HashMap::new(),
            pending: HashMap::new(),
            last_check: Instant::now(),
        }
    }

    pub fn record(&mut self, category: &Category) {
        *self.pending.entry(category.clone()).or_default() += 1;
    }

    pub fn evaluate(&mut self) -> Vec<Anomaly> {
        self.evaluate_at(Instant::now())
    }

    fn evaluate_at(&mut self, now: Instant) -> Vec<Anomaly> {
        let elapsed = now.saturating_duration_since(self.last_check).as_secs_f64();
        if elapsed < 1.0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (category, count) in self.pending.drain() {
            let window = self
                .category_rates
                .entry(category.clone())
                .or_insert_with(|| RollingWindow::new(RATE_WINDOW));
            let rate = count as f64 / elapsed;

            if window.is_ready() {
                let z = window.z_score(rate);
                if z > FREQUENCY_Z_THRESHOLD && window.standard_deviation() > MIN_RATE_STD {
                    let mut anomaly = Anomaly::new(
                        AnomalyKind::Frequency,
                        (z / SEVERITY_Z_SCALE).min(1.0),
                        format!("abnormal {category} rate: {rate:.1}/s"),
                    );
                    anomaly.details = json!({
                        "rate": rate,
                        "mean": window.mean(),
                        "std": window.standard_deviation(),
                        "z": z,
                    });
                    out.push(anomaly);
                }
            }

            // The triggering rate still enters the window: a sustained
            // elevated episode becomes the new normal instead of escalating
            // forever.
            window.add(rate);
        }

        self.last_check = now;
        out
    }
}

impl Default for FrequencyDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Argument-value tracking for one process: file descriptors plus the
/// recognized size-like keys, each against its own rolling window.
#[derive(Debug, Default)]
pub struct ParameterDetector {
    fd_stats: Option<RollingWindow>,
    size_stats: HashMap<String, RollingWindow>,
}

impl ParameterDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&mut self, syscall_name: &str, args: &BTreeMap<String, ArgValue>) -> Vec<Anomaly> {
        if args.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();

        if let Some(fd) = args.get("fd").and_then(ArgValue::as_i64)
            && fd > 0
        {
            let window = self
                .fd_stats
                .get_or_insert_with(|| RollingWindow::new(PARAM_WINDOW));
            window.add(fd as f64);
            if window.is_ready() {
                let z = window.z_score(fd as f64);
                if z > PARAM_Z_THRESHOLD && window.standard_deviation() > MIN_PARAM_STD {
                    let mut anomaly = Anomaly::new(
                        AnomalyKind::Parameter,
                        (z / SEVERITY_Z_SCALE).min(1.0),
                        format!("fd unusually high: {fd}"),
                    );
                    anomaly.details = json!({ "fd": fd, "z": z });
                    out.push(anomaly);
                }
            }
        }

        for key in SIZE_KEYS {
            let Some(val) = args.get(key).and_then(|v| v.as_f64()) else {
                continue;
            };
            if val <= 0.0 {
                continue;
            }

            let window = self
                .size_stats
                .entry(key.to_string())
                .or_insert_with(|| RollingWindow::new(PARAM_WINDOW));
            if window.is_ready() {
                let z = window.z_score(val);
                if z > PARAM_Z_THRESHOLD && window.standard_deviation() > MIN_PARAM_STD {
                    let mut anomaly = Anomaly::new(
                        AnomalyKind::Parameter,
                        (z / SEVERITY_Z_SCALE).min(1.0),
                        format!("unusual {key} in {syscall_name}: {val}"),
                    );
                    anomaly.details = json!({ "param": key, "value": val, "z": z });
                    out.push(anomaly);
                }
            }
            // Anomalous or not, observed values shape future normal.
            window.add(val);
        }

        out
    }
}

/// Everything the pipeline knows about one monitored pid. Detectors are
/// owned exclusively, so one process's behavior never desensitizes another's.
#[derive(Debug)]
struct ProcessState {
    frequency: FrequencyDetector,
    parameter: ParameterDetector,
    started_at: Instant,
    syscall_count: u64,
}

impl ProcessState {
    fn new() -> Self {
        Self {
            frequency: FrequencyDetector::new(),
            parameter: ParameterDetector::new(),
            started_at: Instant::now(),
            syscall_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub uptime_secs: f64,
    pub total_syscalls: u64,
}

type BufferedCall = (String, Category, BTreeMap<String, ArgValue>);

/// Orchestrates per-pid detectors over buffered syscall observations.
/// Ingestion is O(1); all statistics run in the periodic batch pass.
#[derive(Debug)]
pub struct AnomalyDetector {
    processes: HashMap<i32, ProcessState>,
    event_buffer: HashMap<i32, Vec<BufferedCall>>,
    recent: VecDeque<Anomaly>,
    pending_attach: HashMap<i32, Vec<Anomaly>>,
    sensitivity: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
            event_buffer: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            pending_attach: HashMap::new(),
            sensitivity: 1.0,
        }
    }

    /// Buffers one observation for the next batch pass. No analysis happens
    /// here.
    pub fn ingest(
        &mut self,
        pid: i32,
        name: String,
        category: Category,
        args: BTreeMap<String, ArgValue>,
    ) {
        self.event_buffer
            .entry(pid)
            .or_default()
            .push((name, category, args));
    }

    /// Replays every buffered observation through the owning pid's detectors
    /// and drains all buffers. Sensitivity is applied exactly once, here —
    /// detectors emit unscaled severities.
    pub fn run_batch(&mut self) -> Vec<Anomaly> {
        self.pending_attach.clear();
        let mut out = Vec::new();

        let drained: Vec<(i32, Vec<BufferedCall>)> = self.event_buffer.drain().collect();
        for (pid, events) in drained {
            if events.is_empty() {
                continue;
            }

            let state = self.processes.entry(pid).or_insert_with(ProcessState::new);
            let mut findings = Vec::new();
            for (name, category, args) in &events {
                state.syscall_count += 1;
                state.frequency.record(category);
                findings.extend(state.parameter.evaluate(name, args));
            }
            findings.extend(state.frequency.evaluate());

            for anomaly in &mut findings {
                anomaly.pid = pid;
            }
            out.extend(findings);
        }

        for anomaly in &mut out {
            anomaly.severity = (anomaly.severity * self.sensitivity).min(1.0);
        }
        for anomaly in &out {
            if self.recent.len() == RECENT_CAPACITY {
                let _ = self.recent.pop_front();
            }
            self.recent.push_back(anomaly.clone());
            self.pending_attach
                .entry(anomaly.pid)
                .or_default()
                .push(anomaly.clone());
        }

        out
    }

    /// Hands over the findings the most recent batch pass produced for one
    /// pid, so the capture path can attach them to an outgoing event. Each
    /// finding is handed over at most once.
    pub fn take_findings_for(&mut self, pid: i32) -> Vec<Anomaly> {
        self.pending_attach.remove(&pid).unwrap_or_default()
    }

    pub fn set_sensitivity(&mut self, level: f64) {
        self.sensitivity = level.clamp(0.1, 3.0);
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// Drops all state for a pid. The next ingest for the same pid starts
    /// cold — statistics never survive a terminated tracee.
    pub fn forget(&mut self, pid: i32) {
        let _ = self.processes.remove(&pid);
        let _ = self.event_buffer.remove(&pid);
        let _ = self.pending_attach.remove(&pid);
    }

    /// Most-recent-first, at most `limit` entries.
    pub fn recent_anomalies(&self, limit: usize) -> Vec<Anomaly> {
        self.recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    /// Observations buffered for a pid since the last batch pass.
    pub fn pending_len(&self, pid: i32) -> usize {
        self.event_buffer.get(&pid).map_or(0, Vec::len)
    }

    pub fn process_stats(&self, pid: i32) -> Option<ProcessStats> {
        let state = self.processes.get(&pid)?;
        Some(ProcessStats {
            uptime_secs: state.started_at.elapsed().as_secs_f64(),
            total_syscalls: state.syscall_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(pairs: &[(&str, i64)]) -> BTreeMap<String, ArgValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ArgValue::Int(*v)))
            .collect()
    }

    fn file_category() -> Category {
        Category::new("file_io")
    }

    /// Drives `count` one-second evaluation rounds, each observing the given
    /// per-second rate for one category.
    fn seed_rates(detector: &mut FrequencyDetector, category: &Category, rates: &[f64]) {
        let mut now = detector.last_check;
        for rate in rates {
            for _ in 0..(*rate as u64) {
                detector.record(category);
            }
            now += Duration::from_secs(1);
            let findings = detector.evaluate_at(now);
            assert!(
                findings.is_empty(),
                "seeding rounds must not produce findings"
            );
        }
    }

    #[test]
    fn frequency_evaluate_is_rate_limited_to_one_second() {
        let mut detector = FrequencyDetector::new();
        let category = file_category();
        detector.record(&category);
        let now = detector.last_check + Duration::from_millis(400);
        assert!(detector.evaluate_at(now).is_empty());
        // Pending counts survive a skipped round.
        assert_eq!(detector.pending.get(&category), Some(&1));
    }

    #[test]
    fn frequency_clears_pending_after_each_full_round() {
        let mut detector = FrequencyDetector::new();
        let category = file_category();
        for _ in 0..5 {
            detector.record(&category);
        }
        let now = detector.last_check + Duration::from_secs(2);
        let _ = detector.evaluate_at(now);
        assert!(detector.pending.is_empty());
        assert_eq!(detector.last_check, now);
    }

    #[test]
    fn flat_rate_history_never_triggers() {
        // Scenario A: 40 rounds at exactly 10/s, then 10/s again. The window
        // is ready but perfectly flat, so z is 0 and nothing fires.
        let mut detector = FrequencyDetector::new();
        let category = file_category();
        seed_rates(&mut detector, &category, &vec![10.0; 40]);

        for _ in 0..10 {
            detector.record(&category);
        }
        let now = detector.last_check + Duration::from_secs(1);
        let findings = detector.evaluate_at(now);
        assert!(findings.is_empty());
    }

    #[test]
    fn rate_spike_against_noisy_history_fires_with_expected_severity() {
        // Scenario B: history of 9/10/11 per second, then a burst of 80/s.
        let mut detector = FrequencyDetector::new();
        let category = file_category();
        let rates: Vec<f64> = (0..40).map(|i| [9.0, 10.0, 11.0][i % 3]).collect();
        seed_rates(&mut detector, &category, &rates);

        for _ in 0..80 {
            detector.record(&category);
        }
        let now = detector.last_check + Duration::from_secs(1);
        let findings = detector.evaluate_at(now);
        assert_eq!(findings.len(), 1);

        let anomaly = &findings[0];
        assert_eq!(anomaly.kind, AnomalyKind::Frequency);
        let z = anomaly.details["z"].as_f64().expect("details.z");
        assert!(z > 4.0, "z was {z}");
        assert!((anomaly.severity - (z / 15.0).min(1.0)).abs() < 1e-9);
        assert!(anomaly.description.contains("file_io"));
    }

    #[test]
    fn spike_rate_still_enters_the_window() {
        let mut detector = FrequencyDetector::new();
        let category = file_category();
        let rates: Vec<f64> = (0..40).map(|i| [9.0, 10.0, 11.0][i % 3]).collect();
        seed_rates(&mut detector, &category, &rates);
        let mean_before = detector.category_rates[&category].mean();

        for _ in 0..80 {
            detector.record(&category);
        }
        let now = detector.last_check + Duration::from_secs(1);
        let _ = detector.evaluate_at(now);
        let mean_after = detector.category_rates[&category].mean();
        assert!(mean_after > mean_before);
    }

    #[test]
    fn parameter_fd_outlier_fires_after_uniform_history() {
        // Scenario C: 100 fds spread over [1, 50], then fd 500000.
        let mut detector = ParameterDetector::new();
        for i in 0..100_i64 {
            let findings = detector.evaluate("read", &args(&[("fd", i % 50 + 1)]));
            assert!(findings.is_empty());
        }

        let findings = detector.evaluate("read", &args(&[("fd", 500_000)]));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, AnomalyKind::Parameter);
        assert!(findings[0].description.contains("500000"));
        assert_eq!(findings[0].details["fd"], json!(500_000));
    }

    #[test]
    fn parameter_ignores_absent_and_non_positive_values() {
        let mut detector = ParameterDetector::new();
        assert!(detector.evaluate("close", &BTreeMap::new()).is_empty());
        assert!(detector.evaluate("read", &args(&[("fd", -1)])).is_empty());
        assert!(detector.evaluate("read", &args(&[("count", 0)])).is_empty());
        assert!(detector.fd_stats.is_none());
        assert!(detector.size_stats.is_empty());
    }

    #[test]
    fn parameter_size_keys_are_tracked_independently() {
        let mut detector = ParameterDetector::new();
        for i in 0..40_i64 {
            let _ = detector.evaluate("write", &args(&[("count", i % 20 + 10)]));
            let _ = detector.evaluate("mmap", &args(&[("length", 4096)]));
        }
        // `count` is noisy enough to judge against; `length` is flat so its
        // z stays 0 and it can never fire on itself.
        let spike = detector.evaluate("write", &args(&[("count", 100_000)]));
        assert_eq!(spike.len(), 1);
        assert_eq!(spike[0].details["param"], json!("count"));

        let flat = detector.evaluate("mmap", &args(&[("length", 4096)]));
        assert!(flat.is_empty());
    }

    #[test]
    fn sensitivity_is_clamped() {
        let mut detector = AnomalyDetector::new();
        detector.set_sensitivity(0.0);
        assert_eq!(detector.sensitivity(), 0.1);
        detector.set_sensitivity(10.0);
        assert_eq!(detector.sensitivity(), 3.0);
        detector.set_sensitivity(1.5);
        assert_eq!(detector.sensitivity(), 1.5);
    }

    #[test]
    fn ingest_buffers_without_creating_process_state() {
        let mut detector = AnomalyDetector::new();
        detector.ingest(7, "read".to_string(), file_category(), args(&[("fd", 3)]));
        assert!(detector.process_stats(7).is_none());
        let _ = detector.run_batch();
        assert!(detector.process_stats(7).is_some());
    }

    #[test]
    fn run_batch_drains_buffers_and_is_idempotent() {
        let mut detector = AnomalyDetector::new();
        for i in 0..100_i64 {
            detector.ingest(7, "read".to_string(), file_category(), args(&[("fd", i % 50 + 1)]));
        }
        detector.ingest(7, "read".to_string(), file_category(), args(&[("fd", 500_000)]));

        let first = detector.run_batch();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].pid, 7);
        let ring_len = detector.recent_count();

        let second = detector.run_batch();
        assert!(second.is_empty(), "drained buffers must yield nothing");
        assert_eq!(detector.recent_count(), ring_len, "no duplicate ring entries");
    }

    #[test]
    fn batch_findings_are_tagged_scaled_and_attachable_once() {
        let mut detector = AnomalyDetector::new();
        detector.set_sensitivity(0.5);
        for i in 0..100_i64 {
            detector.ingest(9, "read".to_string(), file_category(), args(&[("fd", i % 50 + 1)]));
        }
        let _ = detector.run_batch();
        detector.ingest(9, "read".to_string(), file_category(), args(&[("fd", 500_000)]));
        let findings = detector.run_batch();
        assert_eq!(findings.len(), 1);
        let z = findings[0].details["z"].as_f64().expect("details.z");
        let expected = ((z / 15.0).min(1.0) * 0.5).min(1.0);
        assert!((findings[0].severity - expected).abs() < 1e-9);

        let attached = detector.take_findings_for(9);
        assert_eq!(attached.len(), 1);
        assert!(detector.take_findings_for(9).is_empty());
    }

    #[test]
    fn frequency_findings_from_batch_carry_the_pid() {
        let mut detector = AnomalyDetector::new();
        detector.ingest(11, "read".to_string(), file_category(), BTreeMap::new());
        let _ = detector.run_batch();

        // Seed the pid's rate window directly, then age the rate limiter so
        // the next batch settles a full round.
        let state = detector.processes.get_mut(&11).expect("state exists");
        let window = state
            .frequency
            .category_rates
            .entry(file_category())
            .or_insert_with(|| RollingWindow::new(RATE_WINDOW));
        for i in 0..40 {
            window.add([9.0, 10.0, 11.0][i % 3]);
        }
        state.frequency.last_check -= Duration::from_secs(1);

        for _ in 0..80 {
            detector.ingest(11, "read".to_string(), file_category(), BTreeMap::new());
        }
        let findings = detector.run_batch();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pid, 11);
        assert_eq!(findings[0].kind, AnomalyKind::Frequency);
    }

    #[test]
    fn forget_resets_statistics_to_cold() {
        let mut detector = AnomalyDetector::new();
        for i in 0..100_i64 {
            detector.ingest(5, "read".to_string(), file_category(), args(&[("fd", i % 50 + 1)]));
        }
        let _ = detector.run_batch();

        detector.forget(5);
        assert!(detector.process_stats(5).is_none());

        // The exact value that would have fired against the old history is
        // invisible to the fresh, not-ready window.
        detector.ingest(5, "read".to_string(), file_category(), args(&[("fd", 500_000)]));
        let findings = detector.run_batch();
        assert!(findings.is_empty());
        let stats = detector.process_stats(5).expect("fresh state");
        assert_eq!(stats.total_syscalls, 1);
    }

    #[test]
    fn recent_ring_is_bounded_and_most_recent_first() {
        let mut detector = AnomalyDetector::new();
        for i in 0..1100_i64 {
            let mut anomaly = Anomaly::new(AnomalyKind::Parameter, 0.5, format!("finding {i}"));
            anomaly.pid = i as i32;
            if detector.recent.len() == RECENT_CAPACITY {
                let _ = detector.recent.pop_front();
            }
            detector.recent.push_back(anomaly);
        }
        assert_eq!(detector.recent_count(), RECENT_CAPACITY);

        let latest = detector.recent_anomalies(10);
        assert_eq!(latest.len(), 10);
        assert_eq!(latest[0].description, "finding 1099");
        assert_eq!(latest[9].description, "finding 1090");
    }

    #[test]
    fn ring_survives_forgetting_the_process() {
        let mut detector = AnomalyDetector::new();
        for i in 0..100_i64 {
            detector.ingest(3, "read".to_string(), file_category(), args(&[("fd", i % 50 + 1)]));
        }
        let _ = detector.run_batch();
        detector.ingest(3, "read".to_string(), file_category(), args(&[("fd", 500_000)]));
        let _ = detector.run_batch();
        assert_eq!(detector.recent_count(), 1);

        detector.forget(3);
        assert_eq!(detector.recent_count(), 1);
    }
}
