//! Idle shutdown for helper processes

use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct WatchdogState {
    paused: bool,
    deadline: Instant,
}

/// Fires once the helper has been idle for `timeout`. Paused while an
/// action runs; resuming restarts the full timeout.
pub struct IdleWatchdog {
    timeout: Duration,
    state: watch::Sender<WatchdogState>,
}

impl IdleWatchdog {
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(WatchdogState {
            paused: false,
            deadline: Instant::now() + timeout,
        });
        Self { timeout, state }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pause(&self) {
        self.state.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        let deadline = Instant::now() + self.timeout;
        self.state.send_modify(|s| {
            s.paused = false;
            s.deadline = deadline;
        });
    }

    /// Push the deadline out without changing the paused state
    pub fn kick(&self) {
        let deadline = Instant::now() + self.timeout;
        self.state.send_modify(|s| s.deadline = deadline);
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    /// Resolves when the deadline passes while not paused
    pub async fn expired(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.paused {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
            tokio::select! {
                _ = sleep_until(state.deadline) => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
