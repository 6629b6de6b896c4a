//! FIFO hand-off queue between the event loop and the driver thread.

use std::collections::VecDeque;
use std::time::Duration;

use crate::sync::{PeerLoop, Signal};

/// Queue of accepted-but-unclaimed items.
///
/// The event loop pushes, driver threads pop. Each item is popped by exactly
/// one caller, in push order.
#[derive(Debug, Default)]
pub struct RendezvousQueue<T> {
    items: Signal<VecDeque<T>>,
}

impl<T> RendezvousQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Signal::new(VecDeque::new()),
        }
    }

    /// Append an item and wake waiters.
    pub fn push(&self, item: T) {
        self.items.update(|items| items.push_back(item));
    }

    /// Block until an item is available and pop it.
    ///
    /// Blocks forever on a queue that never fills; hung tests are the test
    /// harness timeout's job.
    pub fn wait_and_pop(&self) -> T {
        self.items.wait_until(VecDeque::pop_front)
    }

    /// Pop the next item, pumping `peer` every `slice` while waiting.
    pub fn wait_and_pop_pumping<P>(&self, peer: &mut P, slice: Duration) -> T
    where
        P: PeerLoop + ?Sized,
    {
        self.items.wait_until_pumping(VecDeque::pop_front, slice, peer)
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.items.update(VecDeque::pop_front)
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read(VecDeque::len)
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pops_in_push_order() {
        let queue = RendezvousQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.wait_and_pop(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn each_item_is_claimed_once() {
        let queue = Arc::new(RendezvousQueue::new());
        let claimers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.wait_and_pop())
            })
            .collect();
        for i in 0..4 {
            queue.push(i);
        }
        let mut claimed: Vec<i32> = claimers.into_iter().map(|h| h.join().unwrap()).collect();
        claimed.sort_unstable();
        assert_eq!(claimed, vec![0, 1, 2, 3]);
    }

    #[test]
    fn pumping_pop_drives_the_producer() {
        let queue = RendezvousQueue::new();
        let mut produced = false;
        let mut peer = || {
            if !produced {
                queue.push("ready");
                produced = true;
            }
        };
        let item = queue.wait_and_pop_pumping(&mut peer, Duration::from_millis(1));
        assert_eq!(item, "ready");
    }
}
