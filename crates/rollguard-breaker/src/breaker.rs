//! Keyed circuit breaker persisted through a [`KvStore`].

use std::sync::Arc;
use std::time::Duration;

use rollguard_core::BreakerConfig;
use rollguard_state::{KvStore, StateError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// How many times a read-modify-write is retried when another caller
/// wins the compare-and-swap.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// State of a circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are refused until the open window elapses.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// The record persisted under `circuit/<key>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at_ms: Option<u64>,
    /// When the current half-open trial was admitted.
    pub trial_started_at_ms: Option<u64>,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold().max(1),
            open_duration: config.open_duration(),
        }
    }
}

/// Point-in-time view of a circuit, with the open → half-open
/// transition applied lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at_ms: Option<u64>,
}

/// A failure-counting gate in front of one dependency.
///
/// Cheap to clone; clones share the store and therefore the circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    key: String,
    store_key: String,
    settings: BreakerSettings,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(key: &str, settings: BreakerSettings, store: Arc<dyn KvStore>) -> Self {
        Self::with_clock(key, settings, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        key: &str,
        settings: BreakerSettings,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: key.to_string(),
            store_key: format!("circuit/{key}"),
            settings,
            store,
            clock,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    /// Whether the guarded call may proceed.
    ///
    /// In half-open state only one trial is admitted; a trial that never
    /// reports back is replaced after another `open_duration`.
    pub fn allow(&self) -> bool {
        let window = self.window_millis();
        self.transition("allow", true, |record, now| match record.state {
            CircuitState::Closed => (None, true),
            CircuitState::Open => {
                let opened_at = record.last_failure_at_ms.unwrap_or(0);
                if now.saturating_sub(opened_at) >= window {
                    let next = CircuitRecord {
                        state: CircuitState::HalfOpen,
                        trial_started_at_ms: Some(now),
                        ..record.clone()
                    };
                    (Some(next), true)
                } else {
                    (None, false)
                }
            }
            CircuitState::HalfOpen => {
                let started = record.trial_started_at_ms.unwrap_or(0);
                if now.saturating_sub(started) >= window {
                    let next = CircuitRecord {
                        trial_started_at_ms: Some(now),
                        ..record.clone()
                    };
                    (Some(next), true)
                } else {
                    (None, false)
                }
            }
        })
    }

    /// Report that the guarded call succeeded.
    pub fn record_success(&self) {
        self.transition("record_success", (), |record, _now| match record.state {
            CircuitState::Closed if record.failure_count == 0 => (None, ()),
            CircuitState::Closed | CircuitState::HalfOpen => (Some(CircuitRecord::default()), ()),
            // A straggler from before the circuit opened; the window stands.
            CircuitState::Open => (None, ()),
        })
    }

    /// Report that the guarded call failed.
    pub fn record_failure(&self) {
        let threshold = self.settings.failure_threshold;
        self.transition("record_failure", (), |record, now| {
            let failure_count = record.failure_count.saturating_add(1);
            let next = match record.state {
                CircuitState::Closed if failure_count >= threshold => CircuitRecord {
                    state: CircuitState::Open,
                    failure_count,
                    last_failure_at_ms: Some(now),
                    trial_started_at_ms: None,
                },
                CircuitState::Closed | CircuitState::Open => CircuitRecord {
                    failure_count,
                    ..record.clone()
                },
                CircuitState::HalfOpen => CircuitRecord {
                    state: CircuitState::Open,
                    failure_count,
                    last_failure_at_ms: Some(now),
                    trial_started_at_ms: None,
                },
            };
            (Some(next), ())
        })
    }

    /// Current state without mutating the circuit.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let record = match self.load() {
            Ok((_, record)) => record,
            Err(e) => {
                warn!(circuit = %self.key, error = %e, "circuit state unreadable");
                CircuitRecord::default()
            }
        };
        let now = self.clock.now_millis();
        let state = match record.state {
            CircuitState::Open
                if now.saturating_sub(record.last_failure_at_ms.unwrap_or(0))
                    >= self.window_millis() =>
            {
                CircuitState::HalfOpen
            }
            state => state,
        };
        CircuitSnapshot {
            key: self.key.clone(),
            state,
            failure_count: record.failure_count,
            last_failure_at_ms: record.last_failure_at_ms,
        }
    }

    /// Forget all recorded failures. Returns true if a record existed.
    pub fn reset(&self) -> bool {
        match self.store.delete(&self.store_key) {
            Ok(existed) => {
                info!(circuit = %self.key, "circuit reset");
                existed
            }
            Err(e) => {
                warn!(circuit = %self.key, error = %e, "failed to reset circuit");
                false
            }
        }
    }

    fn window_millis(&self) -> u64 {
        self.settings.open_duration.as_millis() as u64
    }

    fn load(&self) -> Result<(Option<Vec<u8>>, CircuitRecord), StateError> {
        let raw = match self.store.get(&self.store_key) {
            // Unreadable envelopes are replaced by a closed record.
            Err(StateError::Corrupt(_)) => {
                warn!(circuit = %self.key, "discarding unreadable circuit entry");
                let fresh = CircuitRecord::default();
                let encoded = serde_json::to_vec(&fresh).map_err(|e| StateError::Write(e.to_string()))?;
                self.store.put(&self.store_key, &encoded, None)?;
                return Ok((Some(encoded), fresh));
            }
            other => other?,
        };
        let record = match raw.as_deref() {
            Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
                warn!(circuit = %self.key, error = %e, "discarding corrupt circuit record");
                CircuitRecord::default()
            }),
            None => CircuitRecord::default(),
        };
        Ok((raw, record))
    }

    /// Read-modify-write the circuit record with compare-and-swap.
    ///
    /// `step` returns the replacement record (or `None` to leave it) and
    /// the value to hand back to the caller. Store faults and exhausted
    /// retries yield `fail_open`.
    fn transition<T: Copy>(
        &self,
        op: &'static str,
        fail_open: T,
        step: impl Fn(&CircuitRecord, u64) -> (Option<CircuitRecord>, T),
    ) -> T {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (raw, current) = match self.load() {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(circuit = %self.key, op, error = %e, "circuit store read failed, failing open");
                    return fail_open;
                }
            };

            let (next, out) = step(&current, self.clock.now_millis());
            let Some(next) = next else {
                return out;
            };
            if next == current {
                return out;
            }

            let encoded = match serde_json::to_vec(&next) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(circuit = %self.key, op, error = %e, "circuit record not serializable");
                    return fail_open;
                }
            };

            match self
                .store
                .compare_and_swap(&self.store_key, raw.as_deref(), Some((encoded.as_slice(), None)))
            {
                Ok(true) => {
                    self.log_transition(&current, &next);
                    return out;
                }
                Ok(false) => {
                    debug!(circuit = %self.key, op, attempt, "circuit update raced, retrying");
                }
                Err(e) => {
                    warn!(circuit = %self.key, op, error = %e, "circuit store write failed, failing open");
                    return fail_open;
                }
            }
        }

        warn!(circuit = %self.key, op, attempts = MAX_CAS_ATTEMPTS, "circuit update contention, failing open");
        fail_open
    }

    fn log_transition(&self, from: &CircuitRecord, to: &CircuitRecord) {
        if from.state == to.state {
            return;
        }
        match to.state {
            CircuitState::Open => warn!(
                circuit = %self.key,
                failures = to.failure_count,
                from = %from.state,
                "circuit opened"
            ),
            CircuitState::HalfOpen => debug!(circuit = %self.key, "circuit half-open, admitting trial"),
            CircuitState::Closed => info!(circuit = %self.key, "circuit closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    use rollguard_state::{MemoryStore, StateResult};

    const WINDOW: Duration = Duration::from_secs(30);

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            open_duration: WINDOW,
        }
    }

    fn breaker(store: &MemoryStore, clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock("feature-flags", settings(), Arc::new(store.clone()), clock.clone())
    }

    fn setup() -> (MemoryStore, Arc<ManualClock>, CircuitBreaker) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(&store, &clock);
        (store, clock, cb)
    }

    #[test]
    fn starts_closed() {
        let (_, _, cb) = setup();
        assert!(cb.allow());
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn stays_closed_under_threshold() {
        let (_, _, cb) = setup();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[test]
    fn opens_at_threshold() {
        let (_, _, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(!cb.allow());
        assert_eq!(cb.snapshot().state, CircuitState::Open);
        assert!(cb.snapshot().last_failure_at_ms.is_some());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let (_, _, cb) = setup();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let (_, clock, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(WINDOW - Duration::from_millis(1));
        assert!(!cb.allow());

        clock.advance(Duration::from_millis(1));
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
        assert!(cb.allow());
        assert!(!cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn half_open_success_closes() {
        let (_, clock, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(WINDOW);
        assert!(cb.allow());
        cb.record_success();

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        for _ in 0..5 {
            assert!(cb.allow());
        }
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let (_, clock, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(WINDOW);
        assert!(cb.allow());

        clock.advance(Duration::from_secs(5));
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Open);

        // Window counts from the trial failure, not the original opening.
        clock.advance(WINDOW - Duration::from_secs(1));
        assert!(!cb.allow());
        clock.advance(Duration::from_secs(1));
        assert!(cb.allow());
    }

    #[test]
    fn abandoned_trial_is_replaced_after_window() {
        let (_, clock, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(WINDOW);
        assert!(cb.allow());
        // The trial caller never reports back.
        clock.advance(WINDOW);
        assert!(cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn failure_while_open_does_not_extend_window() {
        let (_, clock, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        let opened_at = cb.snapshot().last_failure_at_ms;
        clock.advance(Duration::from_secs(10));
        cb.record_failure();
        assert_eq!(cb.snapshot().last_failure_at_ms, opened_at);
        assert_eq!(cb.snapshot().failure_count, 4);
    }

    #[test]
    fn state_is_shared_through_the_store() {
        let (store, clock, first) = setup();
        for _ in 0..3 {
            first.record_failure();
        }
        // A second instance, e.g. after a daemon restart, sees the open circuit.
        let second = breaker(&store, &clock);
        assert!(!second.allow());
    }

    #[test]
    fn reset_closes_circuit() {
        let (_, _, cb) = setup();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.reset());
        assert!(cb.allow());
        assert!(!cb.reset());
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let settings = BreakerSettings {
            failure_threshold: 10_000,
            open_duration: WINDOW,
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = CircuitBreaker::with_clock("dep", settings, Arc::new(store.clone()), clock.clone());
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let cb = CircuitBreaker::with_clock("dep", settings, Arc::new(store), clock);
        assert_eq!(cb.snapshot().failure_count, 200);
    }

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &str) -> StateResult<Option<Vec<u8>>> {
            Err(StateError::Read("disk on fire".to_string()))
        }
        fn put(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> StateResult<()> {
            Err(StateError::Write("disk on fire".to_string()))
        }
        fn delete(&self, _key: &str) -> StateResult<bool> {
            Err(StateError::Write("disk on fire".to_string()))
        }
        fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&[u8]>,
            _new: Option<(&[u8], Option<Duration>)>,
        ) -> StateResult<bool> {
            Err(StateError::Write("disk on fire".to_string()))
        }
    }

    #[test]
    fn broken_store_fails_open() {
        let cb = CircuitBreaker::new("dep", settings(), Arc::new(BrokenStore));
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(cb.allow());
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn corrupt_record_is_overwritten() {
        let (store, _, cb) = setup();
        store.put("circuit/feature-flags", b"{not json", None).unwrap();
        cb.record_failure();
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    /// Memory store whose entry reads as a truncated envelope until it is
    /// overwritten.
    struct TruncatedStore {
        inner: MemoryStore,
        truncated: AtomicBool,
    }

    impl TruncatedStore {
        fn check(&self, key: &str) -> StateResult<()> {
            if self.truncated.load(Ordering::SeqCst) {
                return Err(StateError::Corrupt(key.to_string()));
            }
            Ok(())
        }
    }

    impl KvStore for TruncatedStore {
        fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
            self.check(key)?;
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
            self.truncated.store(false, Ordering::SeqCst);
            self.inner.put(key, value, ttl)
        }
        fn delete(&self, key: &str) -> StateResult<bool> {
            self.check(key)?;
            self.inner.delete(key)
        }
        fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            new: Option<(&[u8], Option<Duration>)>,
        ) -> StateResult<bool> {
            self.check(key)?;
            self.inner.compare_and_swap(key, expected, new)
        }
    }

    #[test]
    fn truncated_entry_is_replaced_and_circuit_still_opens() {
        let store = TruncatedStore {
            inner: MemoryStore::new(),
            truncated: AtomicBool::new(true),
        };
        let cb = CircuitBreaker::new("feature-flags", settings(), Arc::new(store));
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.snapshot().state, CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn settings_from_config() {
        let config = BreakerConfig {
            failure_threshold: Some(2),
            open_duration: Some("5s".to_string()),
        };
        let s = BreakerSettings::from(&config);
        assert_eq!(s.failure_threshold, 2);
        assert_eq!(s.open_duration, Duration::from_secs(5));
    }
}
