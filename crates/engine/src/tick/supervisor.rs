use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::dispatch::DispatchFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Restarting,
}

/// Why one run of the dispatch loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Drained,
    ProducersClosed,
    Faulted(DispatchFault),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("dispatch loop faulted {restarts} times within {window_ms}ms; last fault: {last_fault}")]
    FaultStorm {
        restarts: usize,
        window_ms: u64,
        last_fault: DispatchFault,
    },
}

/// Restarts the dispatch loop after a contained fault. More than `max_restarts` restarts inside
/// the sliding window is treated as unrecoverable: the supervisor waits out the grace delay and
/// gives up.
#[derive(Debug)]
pub struct Supervisor {
    state: LoopState,
    restarts: VecDeque<Instant>,
    max_restarts: usize,
    window: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            state: LoopState::Stopped,
            restarts: VecDeque::new(),
            max_restarts: config.max_restarts as usize,
            window: Duration::from_millis(config.window_ms),
            grace: Duration::from_millis(config.grace_ms),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Records a restart at `at` and reports whether the window now holds a fault storm.
    pub fn record_restart(&mut self, at: Instant) -> bool {
        while let Some(oldest) = self.restarts.front() {
            if at.saturating_duration_since(*oldest) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(at);
        self.restarts.len() > self.max_restarts
    }

    pub fn run<F>(&mut self, mut run_loop: F) -> Result<LoopExit, SupervisorError>
    where
        F: FnMut() -> LoopExit,
    {
        loop {
            self.state = LoopState::Running;
            match run_loop() {
                LoopExit::Faulted(fault) => {
                    self.state = LoopState::Restarting;
                    warn!(
                        actor = ?fault.actor.map(|player| player.0),
                        reason = %fault.reason,
                        "dispatch_loop_restarting"
                    );
                    if self.record_restart(Instant::now()) {
                        error!(
                            restarts = self.restarts.len(),
                            window_ms = self.window.as_millis() as u64,
                            grace_ms = self.grace.as_millis() as u64,
                            "dispatch_fault_storm"
                        );
                        thread::sleep(self.grace);
                        self.state = LoopState::Stopped;
                        return Err(SupervisorError::FaultStorm {
                            restarts: self.restarts.len(),
                            window_ms: self.window.as_millis() as u64,
                            last_fault: fault,
                        });
                    }
                }
                exit => {
                    self.state = LoopState::Stopped;
                    info!(exit = ?exit, "dispatch_loop_stopped");
                    return Ok(exit);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::PlayerId;

    fn bounded(max_restarts: u32) -> Supervisor {
        Supervisor::new(&SupervisorConfig {
            max_restarts,
            window_ms: 1_000,
            grace_ms: 0,
        })
    }

    fn fault() -> DispatchFault {
        DispatchFault {
            actor: Some(PlayerId(7)),
            reason: "boom".to_string(),
        }
    }

    #[test]
    fn restarts_outside_the_window_are_forgotten() {
        let mut supervisor = bounded(10);
        let start = Instant::now();
        for i in 0..10 {
            assert!(!supervisor.record_restart(start + Duration::from_millis(i * 50)));
        }
        assert!(supervisor.record_restart(start + Duration::from_millis(600)));

        let mut supervisor = bounded(10);
        for i in 0..30 {
            assert!(!supervisor.record_restart(start + Duration::from_millis(i * 200)));
        }
    }

    #[test]
    fn isolated_faults_are_restarted_until_the_loop_exits_cleanly() {
        let mut supervisor = bounded(10);
        let mut runs = 0;
        let exit = supervisor
            .run(|| {
                runs += 1;
                if runs < 4 {
                    LoopExit::Faulted(fault())
                } else {
                    LoopExit::Drained
                }
            })
            .expect("clean exit");
        assert_eq!(exit, LoopExit::Drained);
        assert_eq!(runs, 4);
        assert_eq!(supervisor.state(), LoopState::Stopped);
    }

    #[test]
    fn a_fault_storm_stops_the_supervisor() {
        let mut supervisor = bounded(10);
        let mut runs = 0;
        let result = supervisor.run(|| {
            runs += 1;
            LoopExit::Faulted(fault())
        });
        assert!(matches!(
            result,
            Err(SupervisorError::FaultStorm { restarts: 11, .. })
        ));
        assert_eq!(runs, 11);
        assert_eq!(supervisor.state(), LoopState::Stopped);
    }
}
