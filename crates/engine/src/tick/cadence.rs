use thiserror::Error;

/// Periods every dispatcher registers on top of the base tick.
pub const STANDARD_PERIODS_MS: [u64; 10] = [
    50,
    100,
    200,
    1_000,
    5_000,
    10_000,
    60_000,
    3_600_000,
    86_400_000,
    604_800_000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TickError {
    #[error("base tick must be positive")]
    ZeroBase,
    #[error("period {period_ms}ms is not a positive multiple of the {base_ms}ms base tick")]
    PeriodNotMultiple { period_ms: u64, base_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredPeriod {
    pub id: PeriodId,
    pub period_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct RegisteredPeriod {
    period_ms: u64,
    stride: u64,
}

/// Monotonic base-tick counter that derives every registered period from it. A period of
/// `k` ms fires on exactly the ticks where `counter % (k / base) == 0`.
#[derive(Debug, Clone)]
pub struct TickCadence {
    base_ms: u64,
    counter: u64,
    periods: Vec<RegisteredPeriod>,
}

impl TickCadence {
    pub fn new(base_ms: u64) -> Result<Self, TickError> {
        if base_ms == 0 {
            return Err(TickError::ZeroBase);
        }
        Ok(Self {
            base_ms,
            counter: 0,
            periods: Vec::new(),
        })
    }

    pub fn register(&mut self, period_ms: u64) -> Result<PeriodId, TickError> {
        if period_ms == 0 || period_ms % self.base_ms != 0 {
            return Err(TickError::PeriodNotMultiple {
                period_ms,
                base_ms: self.base_ms,
            });
        }
        let id = PeriodId(self.periods.len());
        self.periods.push(RegisteredPeriod {
            period_ms,
            stride: period_ms / self.base_ms,
        });
        Ok(id)
    }

    pub fn base_ms(&self) -> u64 {
        self.base_ms
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Logical time covered by the ticks taken so far.
    pub fn elapsed_ms(&self) -> u64 {
        self.counter.saturating_mul(self.base_ms)
    }

    pub fn period_ms(&self, id: PeriodId) -> Option<u64> {
        self.periods.get(id.0).map(|period| period.period_ms)
    }

    /// Takes one base tick and returns the periods due on it, in registration order.
    pub fn advance(&mut self) -> Vec<FiredPeriod> {
        self.counter = self.counter.wrapping_add(1);
        self.periods
            .iter()
            .enumerate()
            .filter(|(_, period)| self.counter % period.stride == 0)
            .map(|(index, period)| FiredPeriod {
                id: PeriodId(index),
                period_ms: period.period_ms,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn non_multiple_periods_are_rejected() {
        assert_eq!(TickCadence::new(0).err(), Some(TickError::ZeroBase));
        let mut cadence = TickCadence::new(20).expect("cadence");
        assert_eq!(
            cadence.register(50),
            Err(TickError::PeriodNotMultiple {
                period_ms: 50,
                base_ms: 20
            })
        );
        assert!(cadence.register(0).is_err());
        assert!(cadence.register(100).is_ok());
    }

    #[test]
    fn standard_periods_fire_on_exact_multiples_over_ten_thousand_ticks() {
        let mut cadence = TickCadence::new(10).expect("cadence");
        let ids: Vec<PeriodId> = STANDARD_PERIODS_MS
            .iter()
            .map(|period| cadence.register(*period).expect("register"))
            .collect();

        let mut fired: HashMap<PeriodId, Vec<u64>> = HashMap::new();
        for _ in 0..10_000 {
            for period in cadence.advance() {
                fired.entry(period.id).or_default().push(cadence.counter());
            }
        }

        for (id, period_ms) in ids.iter().zip(STANDARD_PERIODS_MS) {
            let stride = period_ms / 10;
            let expected: Vec<u64> = (1..=10_000).filter(|tick| tick % stride == 0).collect();
            let actual = fired.remove(id).unwrap_or_default();
            assert_eq!(actual, expected, "period {period_ms}ms");
        }
        assert_eq!(cadence.elapsed_ms(), 100_000);
    }

    #[test]
    fn fired_periods_keep_registration_order() {
        let mut cadence = TickCadence::new(50).expect("cadence");
        let slow = cadence.register(200).expect("slow");
        let fast = cadence.register(100).expect("fast");
        cadence.advance();
        let fired = cadence.advance();
        assert_eq!(fired.iter().map(|p| p.id).collect::<Vec<_>>(), vec![fast]);
        cadence.advance();
        let fired = cadence.advance();
        assert_eq!(
            fired.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![slow, fast]
        );
        assert_eq!(cadence.period_ms(slow), Some(200));
    }
}
