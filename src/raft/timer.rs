use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Generates a random election timeout uniformly over `[2/3 * base, base]`
pub fn random_election_timeout(base_ms: u64) -> Duration {
    let min_ms = base_ms * 2 / 3;
    let max_ms = base_ms.max(min_ms);
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

#[derive(Debug)]
struct TimerState {
    armed: bool,
    deadline: Instant,
    last_reset: Instant,
}

/// Election timer shared by the engine and its timer task.
///
/// Disarmed while the node is Passive, Candidate or leading; every reset
/// draws a new random timeout.
#[derive(Debug)]
pub struct ElectionTimer {
    base_ms: u64,
    state: Mutex<TimerState>,
    changed: Notify,
}

impl ElectionTimer {
    pub fn new(base_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            base_ms,
            state: Mutex::new(TimerState {
                armed: false,
                deadline: now,
                last_reset: now,
            }),
            changed: Notify::new(),
        }
    }

    /// Arm the timer (if needed) and push the deadline out.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock().expect("timer mutex poisoned");
            let now = Instant::now();
            state.armed = true;
            state.last_reset = now;
            state.deadline = now + random_election_timeout(self.base_ms);
        }
        self.changed.notify_one();
    }

    pub fn disable(&self) {
        self.state.lock().expect("timer mutex poisoned").armed = false;
        self.changed.notify_one();
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().expect("timer mutex poisoned").armed
    }

    /// Time since the last reset, i.e. since the last sign of a live leader.
    pub fn since_last_reset(&self) -> Duration {
        self.state
            .lock()
            .expect("timer mutex poisoned")
            .last_reset
            .elapsed()
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    /// Drive the timer until `cancel` fires, calling `on_timeout` each time
    /// an armed deadline passes without a reset. The timer disarms itself
    /// before calling back.
    pub async fn run<F: Fn()>(&self, cancel: CancellationToken, on_timeout: F) {
        loop {
            let (armed, deadline) = {
                let state = self.state.lock().expect("timer mutex poisoned");
                (state.armed, state.deadline)
            };

            if !armed {
                tokio::select! {
                    _ = self.changed.notified() => continue,
                    _ = cancel.cancelled() => return,
                }
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let fire = {
                        let mut state = self.state.lock().expect("timer mutex poisoned");
                        if state.armed && state.deadline <= Instant::now() {
                            state.armed = false;
                            true
                        } else {
                            false
                        }
                    };
                    if fire {
                        on_timeout();
                    }
                }
                _ = self.changed.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}
