//! Cross-thread hand-off between the event loop and the test driver.
//!
//! A [`Signal`] is a mutex-guarded value paired with a condition variable and
//! a generation counter. The event-loop thread mutates the value through
//! [`Signal::update`], which bumps the generation and wakes every waiter; the
//! driver thread blocks in one of the `wait_*` methods until a predicate over
//! the value holds. Predicates are re-evaluated after every wake, so spurious
//! wake-ups are harmless.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Something a bounded wait can make progress on between slices.
///
/// Waits on HTTP streams can only complete if the test's own client keeps
/// running (for example to send HTTP/2 WINDOW_UPDATE frames). Such waits take
/// a `PeerLoop` and call [`run_nonblocking`](PeerLoop::run_nonblocking)
/// between short condition-variable waits. No lock is held while it runs.
pub trait PeerLoop {
    /// Process whatever work is ready without blocking.
    fn run_nonblocking(&mut self);
}

impl<F: FnMut()> PeerLoop for F {
    fn run_nonblocking(&mut self) {
        self()
    }
}

/// A peer that needs no pumping.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPeer;

impl PeerLoop for NoPeer {
    fn run_nonblocking(&mut self) {}
}

#[derive(Debug, Default)]
struct Versioned<T> {
    value: T,
    generation: u64,
}

/// Mutex + condition variable guarded state cell.
#[derive(Debug, Default)]
pub struct Signal<T> {
    state: Mutex<Versioned<T>>,
    cond: Condvar,
}

impl<T> Signal<T> {
    /// Create a signal holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(Versioned {
                value,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Mutate the value and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state.value);
        state.generation = state.generation.wrapping_add(1);
        drop(state);
        self.cond.notify_all();
        result
    }

    /// Read the value under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock().value)
    }

    /// Number of updates so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Block until `ready` returns `Some`.
    ///
    /// `ready` runs under the lock and may consume from the value (a queue
    /// pop, for instance); that does not count as an update.
    pub fn wait_until<R>(&self, mut ready: impl FnMut(&mut T) -> Option<R>) -> R {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = ready(&mut state.value) {
                return result;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Like [`wait_until`](Self::wait_until), but waits at most `slice` at a
    /// time and pumps `peer` between slices with the lock released.
    pub fn wait_until_pumping<R, P>(
        &self,
        mut ready: impl FnMut(&mut T) -> Option<R>,
        slice: Duration,
        peer: &mut P,
    ) -> R
    where
        P: PeerLoop + ?Sized,
    {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(result) = ready(&mut state.value) {
                    return result;
                }
                self.cond.wait_for(&mut state, slice);
                if let Some(result) = ready(&mut state.value) {
                    return result;
                }
            }
            peer.run_nonblocking();
        }
    }

    /// Wait for exactly one update, unless `settled` already holds, then
    /// inspect the value.
    pub fn wait_for_event<R>(
        &self,
        settled: impl Fn(&T) -> bool,
        inspect: impl FnOnce(&T) -> R,
    ) -> R {
        let mut state = self.state.lock();
        if !settled(&state.value) {
            let start = state.generation;
            while state.generation == start {
                self.cond.wait(&mut state);
            }
        }
        inspect(&state.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn update_wakes_waiter() {
        let signal = Arc::new(Signal::new(0u32));
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait_until(|v| (*v >= 3).then_some(*v)))
        };
        for _ in 0..3 {
            signal.update(|v| *v += 1);
        }
        assert_eq!(waiter.join().unwrap(), 3);
        assert_eq!(signal.generation(), 3);
    }

    #[test]
    fn pumping_wait_runs_peer_until_ready() {
        let signal = Signal::new(false);
        let mut pumps = 0;
        let mut peer = || {
            pumps += 1;
            if pumps == 4 {
                signal.update(|v| *v = true);
            }
        };
        signal.wait_until_pumping(|v| v.then_some(()), Duration::from_millis(1), &mut peer);
        assert_eq!(pumps, 4);
    }

    #[test]
    fn wait_for_event_returns_at_once_when_settled() {
        let signal = Signal::new(true);
        assert!(signal.wait_for_event(|v| *v, |v| *v));
    }

    #[test]
    fn wait_for_event_sees_first_update_only() {
        let signal = Arc::new(Signal::new(0u32));
        let observer = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait_for_event(|_| false, |v| *v))
        };
        while !observer.is_finished() {
            signal.update(|v| *v += 1);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(observer.join().unwrap() >= 1);
    }

    #[test]
    fn no_peer_is_a_noop() {
        let signal = Signal::new(1);
        let value = signal.wait_until_pumping(|v| Some(*v), Duration::from_millis(1), &mut NoPeer);
        assert_eq!(value, 1);
    }
}
