use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchMetricsSnapshot {
    pub tps: f32,
    pub messages_per_second: f32,
    pub notifications_per_second: f32,
    pub mean_dispatch_us: f32,
    pub dropped_backlog_ms: u64,
}

/// Last published dispatcher metrics, readable from any thread.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    snapshot: Arc<RwLock<DispatchMetricsSnapshot>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(DispatchMetricsSnapshot::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        match self.snapshot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, snapshot: DispatchMetricsSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = snapshot;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    ticks: u32,
    messages: u32,
    notifications: u64,
    dispatches: u32,
    dispatch_time_sum: Duration,
    dropped_backlog: Duration,
}

impl MetricsAccumulator {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval_start: Instant::now(),
            interval,
            ticks: 0,
            messages: 0,
            notifications: 0,
            dispatches: 0,
            dispatch_time_sum: Duration::ZERO,
            dropped_backlog: Duration::ZERO,
        }
    }

    pub(crate) fn record_tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
    }

    pub(crate) fn record_message(&mut self) {
        self.messages = self.messages.saturating_add(1);
    }

    pub(crate) fn record_notifications(&mut self, count: u64) {
        self.notifications = self.notifications.saturating_add(count);
    }

    pub(crate) fn record_dispatch(&mut self, elapsed: Duration) {
        self.dispatches = self.dispatches.saturating_add(1);
        self.dispatch_time_sum = self.dispatch_time_sum.saturating_add(elapsed);
    }

    pub(crate) fn record_dropped_backlog(&mut self, dropped: Duration) {
        self.dropped_backlog = self.dropped_backlog.saturating_add(dropped);
    }

    pub(crate) fn maybe_snapshot(&mut self, now: Instant) -> Option<DispatchMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let mean_dispatch_us = if self.dispatches == 0 {
            0.0
        } else {
            (self.dispatch_time_sum.as_secs_f32() / self.dispatches as f32) * 1_000_000.0
        };

        let snapshot = DispatchMetricsSnapshot {
            tps: self.ticks as f32 / elapsed_seconds,
            messages_per_second: self.messages as f32 / elapsed_seconds,
            notifications_per_second: self.notifications as f32 / elapsed_seconds,
            mean_dispatch_us,
            dropped_backlog_ms: self.dropped_backlog.as_millis() as u64,
        };

        self.interval_start = now;
        self.ticks = 0;
        self.messages = 0;
        self.notifications = 0;
        self.dispatches = 0;
        self.dispatch_time_sum = Duration::ZERO;
        self.dropped_backlog = Duration::ZERO;

        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::thread;

    use super::*;

    fn poison_lock(lock: &RwLock<DispatchMetricsSnapshot>) {
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = lock.write().expect("write guard");
                    panic!("poison metrics lock");
                })
                .join();
        });
    }

    #[test]
    fn snapshot_computes_rates_over_the_interval() {
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(2));
        let base = Instant::now();

        for _ in 0..200 {
            accumulator.record_tick();
        }
        for _ in 0..10 {
            accumulator.record_message();
        }
        accumulator.record_notifications(40);
        accumulator.record_dispatch(Duration::from_micros(30));
        accumulator.record_dispatch(Duration::from_micros(50));

        let snapshot = accumulator
            .maybe_snapshot(base + Duration::from_secs(2))
            .expect("snapshot should be emitted");

        assert!((snapshot.tps - 100.0).abs() < 1.0);
        assert!((snapshot.messages_per_second - 5.0).abs() < 0.1);
        assert!((snapshot.notifications_per_second - 20.0).abs() < 0.5);
        assert!((snapshot.mean_dispatch_us - 40.0).abs() < 0.5);
    }

    #[test]
    fn snapshot_not_emitted_before_interval() {
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1));
        let base = Instant::now();
        accumulator.record_tick();

        assert!(accumulator
            .maybe_snapshot(base + Duration::from_millis(500))
            .is_none());
    }

    #[test]
    fn handle_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        assert_eq!(handle.snapshot(), DispatchMetricsSnapshot::default());

        let expected = DispatchMetricsSnapshot {
            tps: 100.0,
            messages_per_second: 12.0,
            notifications_per_second: 30.0,
            mean_dispatch_us: 8.0,
            dropped_backlog_ms: 0,
        };
        handle.publish(expected);
        assert_eq!(handle.snapshot(), expected);
    }
}
