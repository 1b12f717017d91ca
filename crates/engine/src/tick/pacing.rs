use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    pub ticks_to_run: u32,
    pub remaining: Duration,
    pub dropped_backlog: Duration,
}

/// Turns wall-clock time owed to the simulation into whole base ticks, running at most
/// `max_ticks` per wake-up. Backlog beyond the cap is dropped rather than replayed.
pub fn plan_base_ticks(mut owed: Duration, base: Duration, max_ticks: u32) -> TickPlan {
    let mut ticks_to_run = 0u32;
    if base.is_zero() {
        return TickPlan {
            ticks_to_run,
            remaining: Duration::ZERO,
            dropped_backlog: owed,
        };
    }

    while owed >= base && ticks_to_run < max_ticks {
        owed = owed.saturating_sub(base);
        ticks_to_run = ticks_to_run.saturating_add(1);
    }

    if owed >= base {
        TickPlan {
            ticks_to_run,
            remaining: Duration::ZERO,
            dropped_backlog: owed,
        }
    } else {
        TickPlan {
            ticks_to_run,
            remaining: owed,
            dropped_backlog: Duration::ZERO,
        }
    }
}
