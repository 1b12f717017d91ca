mod cadence;
mod pacing;
mod supervisor;
mod timers;

pub use cadence::{FiredPeriod, PeriodId, TickCadence, TickError, STANDARD_PERIODS_MS};
pub use pacing::{plan_base_ticks, TickPlan};
pub use supervisor::{LoopExit, LoopState, Supervisor, SupervisorError};
pub use timers::{TimerId, TimerQueue};
