use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// One-shot timers keyed by due time. A timer fires on the first check at or after its due
/// time and is removed when it fires.
#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    next_id: u64,
    pending: BTreeMap<(u64, TimerId), T>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.pending
            .insert((now_ms.saturating_add(delay_ms), id), payload);
        id
    }

    /// Removes and returns every timer due at `now_ms`, earliest first; ties keep scheduling
    /// order.
    pub fn drain_due(&mut self, now_ms: u64) -> Vec<(TimerId, T)> {
        let later = self.pending.split_off(&(now_ms.saturating_add(1), TimerId(0)));
        let due = std::mem::replace(&mut self.pending, later);
        due.into_iter().map(|((_, id), payload)| (id, payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
