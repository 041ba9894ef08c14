//! Time-windowed replay channel
//!
//! Publishes items to any number of subscribers and keeps the items of the
//! last `window` so a subscriber joining late sees them first, then switches
//! to live delivery without a gap or a duplicate.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct ReplaySubject<T> {
    window: Duration,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    buffer: VecDeque<(Instant, T)>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> ReplaySubject<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Deliver to live subscribers and remember for late ones
    pub fn publish(&self, item: T) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::prune(&mut inner.buffer, now, self.window);
        inner.buffer.push_back((now, item.clone()));
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(item.clone()).is_ok());
    }

    /// Deliver to live subscribers only; late subscribers never see it
    pub fn notify(&self, item: T) {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(item.clone()).is_ok());
    }

    /// Subscribe; the receiver first yields the items still in the window
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        Self::prune(&mut inner.buffer, Instant::now(), self.window);
        for (_, item) in inner.buffer.iter() {
            let _ = tx.send(item.clone());
        }
        inner.subscribers.push(tx);
        rx
    }

    /// Items currently inside the replay window
    pub fn buffered(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::prune(&mut inner.buffer, Instant::now(), self.window);
        inner.buffer.len()
    }

    fn prune(buffer: &mut VecDeque<(Instant, T)>, now: Instant, window: Duration) {
        while let Some((at, _)) = buffer.front() {
            if now.duration_since(*at) > window {
                buffer.pop_front();
            } else {
                break;
            }
        }
    }
}
