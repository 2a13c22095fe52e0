//! Circuit breaker with rolling-window failure-density tracking.
//!
//! State machine per command name: Closed → Open when the rolling window
//! holds at least `min_request_volume` events and the error rate
//! (failures + timeouts over total) reaches the threshold; Open → HalfOpen
//! after the sleep window; a single half-open probe decides between Closed
//! (probe success, window reset) and Open (probe failure, sleep window
//! restarts). Forced-open / forced-closed overrides always win.
//!
//! Counters are lock-free: per-bucket atomics stamped with a bucket epoch.
//! A bucket whose stamp has fallen out of the window is ignored by readers
//! and recycled in place by the next writer, so the window slides without
//! timers or locks.

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{CommandEvent, EventSink, NullSink};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Breaker state visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning. Window length = `bucket_count * bucket duration`, where
/// bucket duration = `rolling_window / bucket_count`.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    pub enabled: bool,
    /// Error rate (percent) at or above which the breaker trips.
    pub error_threshold_pct: u8,
    /// Length of the rolling statistics window.
    pub rolling_window: Duration,
    /// Number of buckets the window is divided into.
    pub bucket_count: usize,
    /// Minimum events in the window before the rate is meaningful.
    pub min_request_volume: u64,
    /// How long an open breaker sleeps before admitting a probe.
    pub sleep_window: Duration,
    /// Override: reject everything regardless of statistics.
    pub forced_open: bool,
    /// Override: admit everything regardless of statistics.
    pub forced_closed: bool,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold_pct: 50,
            rolling_window: Duration::from_millis(10_000),
            bucket_count: 10,
            min_request_volume: 20,
            sleep_window: Duration::from_millis(5_000),
            forced_open: false,
            forced_closed: false,
        }
    }
}

/// Snapshot of the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowMetrics {
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub short_circuited: u64,
    pub rejected: u64,
}

impl WindowMetrics {
    /// Events that participate in the error rate.
    pub fn total(&self) -> u64 {
        self.success + self.failure + self.timeout
    }

    /// Failures + timeouts over total, in `[0.0, 1.0]`.
    pub fn error_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.failure + self.timeout) as f64 / total as f64
    }

    /// Rolling count the health-check surface reports on.
    pub fn failure_count(&self) -> u64 {
        self.failure + self.timeout
    }
}

// Stamp 0 means the bucket has never been written (or was reset).
struct Bucket {
    stamp: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    timeout: AtomicU64,
    short_circuited: AtomicU64,
    rejected: AtomicU64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            stamp: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn zero(&self) {
        self.success.store(0, Ordering::Release);
        self.failure.store(0, Ordering::Release);
        self.timeout.store(0, Ordering::Release);
        self.short_circuited.store(0, Ordering::Release);
        self.rejected.store(0, Ordering::Release);
    }
}

struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_millis: u64,
}

#[derive(Clone, Copy)]
enum Counter {
    Success,
    Failure,
    Timeout,
    ShortCircuited,
    Rejected,
}

impl RollingWindow {
    fn new(window: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_millis = (window.as_millis() as u64 / bucket_count as u64).max(1);
        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            bucket_millis,
        }
    }

    fn current_stamp(&self, now_millis: u64) -> u64 {
        now_millis / self.bucket_millis + 1
    }

    fn record(&self, now_millis: u64, counter: Counter) {
        let stamp = self.current_stamp(now_millis);
        let bucket = &self.buckets[(stamp % self.buckets.len() as u64) as usize];

        let seen = bucket.stamp.load(Ordering::Acquire);
        if seen != stamp
            && bucket
                .stamp
                .compare_exchange(seen, stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // This writer won the recycle; concurrent increments between the
            // swap and the zeroing smear into the fresh bucket, which the
            // window tolerates.
            bucket.zero();
        }

        let cell = match counter {
            Counter::Success => &bucket.success,
            Counter::Failure => &bucket.failure,
            Counter::Timeout => &bucket.timeout,
            Counter::ShortCircuited => &bucket.short_circuited,
            Counter::Rejected => &bucket.rejected,
        };
        cell.fetch_add(1, Ordering::AcqRel);
    }

    fn snapshot(&self, now_millis: u64) -> WindowMetrics {
        let newest = self.current_stamp(now_millis);
        let oldest = newest.saturating_sub(self.buckets.len() as u64 - 1);
        let mut metrics = WindowMetrics::default();
        for bucket in &self.buckets {
            let stamp = bucket.stamp.load(Ordering::Acquire);
            if stamp < oldest || stamp > newest || stamp == 0 {
                continue;
            }
            metrics.success += bucket.success.load(Ordering::Acquire);
            metrics.failure += bucket.failure.load(Ordering::Acquire);
            metrics.timeout += bucket.timeout.load(Ordering::Acquire);
            metrics.short_circuited += bucket.short_circuited.load(Ordering::Acquire);
            metrics.rejected += bucket.rejected.load(Ordering::Acquire);
        }
        metrics
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.stamp.store(0, Ordering::Release);
            bucket.zero();
        }
    }
}

/// Denial returned by [`CircuitBreaker::allow`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShortCircuit {
    pub error_rate: f64,
    pub open_for: Duration,
}

/// Per-command circuit breaker. Shared behind `Arc`; all methods take
/// `&self`.
pub struct CircuitBreaker {
    command: String,
    policy: BreakerPolicy,
    window: RollingWindow,
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    forced_open: AtomicBool,
    forced_closed: AtomicBool,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("command", &self.command)
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(command: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self::with_parts(command, policy, Arc::new(MonotonicClock::default()), Arc::new(NullSink))
    }

    /// Construct with an injected clock and event sink.
    pub fn with_parts(
        command: impl Into<String>,
        policy: BreakerPolicy,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let window = RollingWindow::new(policy.rolling_window, policy.bucket_count);
        Self {
            command: command.into(),
            forced_open: AtomicBool::new(policy.forced_open),
            forced_closed: AtomicBool::new(policy.forced_closed),
            policy,
            window,
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_millis: AtomicU64::new(0),
            clock,
            sink,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Rolling-window snapshot.
    pub fn metrics(&self) -> WindowMetrics {
        self.window.snapshot(self.clock.now_millis())
    }

    /// Force the breaker open (reject everything) until cleared.
    pub fn force_open(&self, forced: bool) {
        self.forced_open.store(forced, Ordering::Release);
    }

    /// Force the breaker closed (admit everything) until cleared.
    pub fn force_closed(&self, forced: bool) {
        self.forced_closed.store(forced, Ordering::Release);
    }

    /// Reset to Closed and drop all window statistics.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.window.reset();
    }

    /// Gate a submission. A denial records a short-circuit event in the
    /// window. The denial this call returns is visible to the very next
    /// submission after the metrics that caused it were recorded.
    pub fn allow(&self) -> Result<(), ShortCircuit> {
        if self.forced_open.load(Ordering::Acquire) {
            return Err(self.deny());
        }
        if self.forced_closed.load(Ordering::Acquire) || !self.policy.enabled {
            return Ok(());
        }

        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_CLOSED => {
                    let metrics = self.metrics();
                    if metrics.total() >= self.policy.min_request_volume
                        && metrics.error_rate() * 100.0
                            >= f64::from(self.policy.error_threshold_pct)
                    {
                        if self
                            .state
                            .compare_exchange(
                                STATE_CLOSED,
                                STATE_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.opened_at_millis
                                .store(self.clock.now_millis(), Ordering::Release);
                            tracing::warn!(
                                command = %self.command,
                                error_rate = metrics.error_rate(),
                                total = metrics.total(),
                                "circuit breaker opened"
                            );
                            self.sink.emit(CommandEvent::CircuitOpened {
                                command: self.command.clone(),
                                total: metrics.total(),
                            });
                        }
                        continue;
                    }
                    return Ok(());
                }
                STATE_OPEN => {
                    let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.policy.sleep_window.as_millis() as u64 {
                        return Err(self.deny());
                    }
                    // Sleep window elapsed; exactly one caller wins the probe.
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!(command = %self.command, "circuit breaker half-open");
                            self.sink.emit(CommandEvent::CircuitHalfOpen {
                                command: self.command.clone(),
                            });
                            return Ok(());
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // A probe is already in flight; everyone else waits out
                    // its verdict.
                    return Err(self.deny());
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self) {
        self.window.record(self.clock.now_millis(), Counter::Success);
        if self
            .state
            .compare_exchange(
                STATE_HALF_OPEN,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.opened_at_millis.store(0, Ordering::Release);
            self.window.reset();
            tracing::info!(command = %self.command, "circuit breaker closed");
            self.sink.emit(CommandEvent::CircuitClosed { command: self.command.clone() });
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self) {
        self.window.record(self.clock.now_millis(), Counter::Failure);
        self.reopen_if_probing();
    }

    /// Record an attempt that exceeded its latency budget.
    pub fn record_timeout(&self) {
        self.window.record(self.clock.now_millis(), Counter::Timeout);
        self.reopen_if_probing();
    }

    /// Record a bulkhead rejection. Tracked in the window but outside the
    /// error rate.
    pub fn record_rejected(&self) {
        self.window.record(self.clock.now_millis(), Counter::Rejected);
    }

    fn reopen_if_probing(&self) {
        if self
            .state
            .compare_exchange(
                STATE_HALF_OPEN,
                STATE_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            tracing::warn!(command = %self.command, "circuit breaker probe failed, reopened");
            self.sink.emit(CommandEvent::CircuitOpened {
                command: self.command.clone(),
                total: self.metrics().total(),
            });
        }
    }

    fn deny(&self) -> ShortCircuit {
        let now = self.clock.now_millis();
        self.window.record(now, Counter::ShortCircuited);
        let opened_at = self.opened_at_millis.load(Ordering::Acquire);
        ShortCircuit {
            error_rate: self.metrics().error_rate(),
            open_for: Duration::from_millis(now.saturating_sub(opened_at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            min_request_volume: 4,
            error_threshold_pct: 50,
            sleep_window: Duration::from_millis(5_000),
            rolling_window: Duration::from_millis(10_000),
            bucket_count: 10,
            ..BreakerPolicy::default()
        }
    }

    fn breaker_with_clock(policy: BreakerPolicy) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_parts(
            "test-command",
            policy,
            Arc::new(clock.clone()),
            Arc::new(NullSink),
        );
        (breaker, clock)
    }

    #[test]
    fn starts_closed_and_allows() {
        let (breaker, _clock) = breaker_with_clock(policy());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn stays_closed_below_min_volume() {
        let (breaker, _clock) = breaker_with_clock(policy());
        for _ in 0..3 {
            assert!(breaker.allow().is_ok());
            breaker.record_failure();
        }
        // 100% errors but only 3 events; volume gate holds it closed.
        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn trips_open_at_threshold_over_min_volume() {
        let (breaker, _clock) = breaker_with_clock(policy());
        for _ in 0..2 {
            breaker.record_success();
        }
        for _ in 0..2 {
            breaker.record_failure();
        }
        // 4 events at 50% error rate: the next submission is denied.
        let denial = breaker.allow().unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(denial.error_rate >= 0.5);
    }

    #[test]
    fn timeouts_count_toward_error_rate() {
        let (breaker, _clock) = breaker_with_clock(policy());
        breaker.record_success();
        breaker.record_success();
        breaker.record_timeout();
        breaker.record_timeout();
        assert!(breaker.allow().is_err());
    }

    #[test]
    fn rejections_do_not_count_toward_error_rate() {
        let (breaker, _clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_success();
        }
        for _ in 0..10 {
            breaker.record_rejected();
        }
        assert!(breaker.allow().is_ok());
        let metrics = breaker.metrics();
        assert_eq!(metrics.rejected, 10);
        assert_eq!(metrics.error_rate(), 0.0);
    }

    #[test]
    fn open_breaker_denies_until_sleep_window() {
        let (breaker, clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.allow().is_err());

        clock.advance(4_999);
        assert!(breaker.allow().is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn sleep_window_elapsed_admits_single_probe() {
        let (breaker, clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.allow().is_err());

        clock.advance(5_000);
        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Concurrent submissions are denied while the probe is in flight.
        assert!(breaker.allow().is_err());
        assert!(breaker.allow().is_err());
    }

    #[test]
    fn probe_success_closes_and_resets_window() {
        let (breaker, clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        let _ = breaker.allow();
        clock.advance(5_000);
        assert!(breaker.allow().is_ok());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        // The stale failures are gone, so the breaker stays closed.
        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.metrics().failure, 0);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_sleep() {
        let (breaker, clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        let _ = breaker.allow();
        clock.advance(5_000);
        assert!(breaker.allow().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(4_999);
        assert!(breaker.allow().is_err());
        clock.advance(1);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn stale_buckets_fall_out_of_the_window() {
        let (breaker, clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.metrics().failure, 4);

        // Slide past the whole window; the failures expire.
        clock.advance(10_001);
        assert_eq!(breaker.metrics().failure, 0);
        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn forced_open_wins_over_healthy_stats() {
        let (breaker, _clock) = breaker_with_clock(policy());
        breaker.record_success();
        breaker.force_open(true);
        assert!(breaker.allow().is_err());

        breaker.force_open(false);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn forced_closed_wins_over_tripped_stats() {
        let (breaker, _clock) = breaker_with_clock(policy());
        for _ in 0..8 {
            breaker.record_failure();
        }
        breaker.force_closed(true);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let (breaker, _clock) =
            breaker_with_clock(BreakerPolicy { enabled: false, ..policy() });
        for _ in 0..100 {
            breaker.record_failure();
        }
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn denials_record_short_circuit_events() {
        let (breaker, _clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        let _ = breaker.allow();
        let _ = breaker.allow();
        assert!(breaker.metrics().short_circuited >= 2);
    }

    #[test]
    fn reset_returns_to_closed_with_clean_window() {
        let (breaker, _clock) = breaker_with_clock(policy());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.allow().is_err());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics(), WindowMetrics::default());
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn transition_events_reach_the_sink() {
        let sink = Arc::new(crate::telemetry::MemorySink::new());
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_parts(
            "evented",
            policy(),
            Arc::new(clock.clone()),
            sink.clone(),
        );

        for _ in 0..4 {
            breaker.record_failure();
        }
        let _ = breaker.allow();
        clock.advance(5_000);
        let _ = breaker.allow();
        breaker.record_success();

        assert_eq!(sink.count(|e| matches!(e, CommandEvent::CircuitOpened { .. })), 1);
        assert_eq!(sink.count(|e| matches!(e, CommandEvent::CircuitHalfOpen { .. })), 1);
        assert_eq!(sink.count(|e| matches!(e, CommandEvent::CircuitClosed { .. })), 1);
    }
}
