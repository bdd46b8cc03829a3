//! Waitable events on top of a mutex + condition variable

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// A successful wait consumes the signal.
    Auto,
    /// Stays signaled once set.
    Manual,
}

#[derive(Debug, Default)]
struct State {
    signaled: bool,
    broadcast: bool,
}

/// Event with optional auto-reset. `broadcast` latches: every current and
/// future waiter returns immediately, which is how idle workers are released
/// at shutdown.
#[derive(Debug)]
pub struct Event {
    mode: ResetMode,
    state: Mutex<State>,
    cond: Condvar,
}

impl Event {
    pub fn new(mode: ResetMode) -> Self {
        Self {
            mode,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    pub fn auto_reset() -> Self {
        Self::new(ResetMode::Auto)
    }

    pub fn manual_reset() -> Self {
        Self::new(ResetMode::Manual)
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        match self.mode {
            ResetMode::Auto => {
                self.cond.notify_one();
            }
            ResetMode::Manual => {
                self.cond.notify_all();
            }
        }
    }

    pub fn broadcast(&self) {
        let mut state = self.state.lock();
        state.broadcast = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        let state = self.state.lock();
        state.signaled || state.broadcast
    }

    /// Returns true when signaled, false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.broadcast {
                return true;
            }
            if state.signaled {
                if self.mode == ResetMode::Auto {
                    state.signaled = false;
                }
                return true;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.broadcast || self.take_signal(&mut state);
            }
        }
    }

    fn take_signal(&self, state: &mut State) -> bool {
        let signaled = state.signaled;
        if signaled && self.mode == ResetMode::Auto {
            state.signaled = false;
        }
        signaled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn times_out_when_never_set() {
        let event = Event::auto_reset();
        let start = Instant::now();
        assert!(!event.wait(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn auto_reset_consumes_signal() {
        let event = Event::auto_reset();
        event.set();
        assert!(event.wait(Duration::from_millis(10)));
        assert!(!event.wait(Duration::from_millis(10)));
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let event = Event::manual_reset();
        event.set();
        assert!(event.wait(Duration::from_millis(10)));
        assert!(event.wait(Duration::from_millis(10)));
        assert!(event.is_set());
    }

    #[test]
    fn broadcast_releases_every_waiter() {
        let event = Arc::new(Event::auto_reset());
        let released = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                let released = released.clone();
                thread::spawn(move || {
                    if event.wait(Duration::from_secs(5)) {
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        event.broadcast();
        waiters.into_iter().for_each(|w| w.join().unwrap());
        assert_eq!(released.load(Ordering::SeqCst), 4);
        assert!(event.wait(Duration::from_millis(1)));
    }

    #[test]
    fn set_wakes_a_blocked_waiter() {
        let event = Arc::new(Event::auto_reset());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(waiter.join().unwrap());
    }
}
