// Fixed-capacity frame queue shared by the pipeline stages
//
// Items travel as `Some(item)`; a `None` is the end-of-stream sentinel that
// each consumer observes exactly once.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};

/// Error type for channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel disconnected")]
    Disconnected,

    #[error("No consumer left to make room")]
    Abandoned,
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Bounded multi-producer multi-consumer queue with an explicit sentinel
pub struct BoundedChannel<T> {
    sender: Sender<Option<T>>,
    receiver: Receiver<Option<T>>,
    capacity: usize,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver, capacity }
    }

    /// Push, waiting for space if the channel is full
    pub fn push_blocking(&self, item: T) -> Result<()> {
        self.sender
            .send(Some(item))
            .map_err(|_| ChannelError::Disconnected)
    }

    /// Push without waiting. Returns `false` if the channel is full; the
    /// caller owns the accounting for the rejected item.
    pub fn try_push(&self, item: T) -> bool {
        match self.sender.try_send(Some(item)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Push, waiting for space only while `consumers_alive` holds. It is
    /// checked every `poll` while the channel stays full.
    pub fn push_while(&self, item: T, poll: Duration, consumers_alive: impl Fn() -> bool) -> Result<()> {
        self.send_while(Some(item), poll, consumers_alive)
    }

    /// Enqueue one end-of-stream sentinel (blocking)
    pub fn push_sentinel(&self) -> Result<()> {
        self.sender.send(None).map_err(|_| ChannelError::Disconnected)
    }

    /// Sentinel counterpart of [`push_while`](Self::push_while)
    pub fn push_sentinel_while(&self, poll: Duration, consumers_alive: impl Fn() -> bool) -> Result<()> {
        self.send_while(None, poll, consumers_alive)
    }

    fn send_while(&self, mut item: Option<T>, poll: Duration, consumers_alive: impl Fn() -> bool) -> Result<()> {
        loop {
            match self.sender.send_timeout(item, poll) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Disconnected(_)) => return Err(ChannelError::Disconnected),
                Err(SendTimeoutError::Timeout(back)) => {
                    if !consumers_alive() {
                        return Err(ChannelError::Abandoned);
                    }
                    item = back;
                }
            }
        }
    }

    /// Wait for the next item. `None` means the sentinel was consumed.
    pub fn pop_blocking(&self) -> Option<T> {
        self.receiver.recv().ok().flatten()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level as a 0-100 percentage
    pub fn occupancy_percent(&self) -> u8 {
        ((self.len() * 100) / self.capacity).min(100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_push_rejects_when_full() {
        let channel = BoundedChannel::new(3);
        let mut dropped = 0;
        for i in 0..10 {
            if !channel.try_push(i) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 7);
        assert_eq!(channel.len(), 3);
        assert_eq!(channel.occupancy_percent(), 100);
    }

    #[test]
    fn pop_returns_items_in_order_then_none_at_sentinel() {
        let channel = BoundedChannel::new(8);
        channel.push_blocking(1).unwrap();
        channel.push_blocking(2).unwrap();
        channel.push_sentinel().unwrap();
        assert_eq!(channel.pop_blocking(), Some(1));
        assert_eq!(channel.pop_blocking(), Some(2));
        assert_eq!(channel.pop_blocking(), None);
    }

    #[test]
    fn push_blocking_waits_for_space() {
        let channel = BoundedChannel::new(1);
        channel.push_blocking(0u32).unwrap();

        let consumer = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let first = consumer.pop_blocking();
            let second = consumer.pop_blocking();
            (first, second)
        });

        // Blocks until the consumer frees the slot
        channel.push_blocking(1).unwrap();
        assert_eq!(handle.join().unwrap(), (Some(0), Some(1)));
    }

    #[test]
    fn push_while_gives_up_without_consumers() {
        let channel = BoundedChannel::new(1);
        channel.push_blocking(0u32).unwrap();

        let result = channel.push_while(1, Duration::from_millis(5), || false);
        assert!(matches!(result, Err(ChannelError::Abandoned)));
        assert!(matches!(
            channel.push_sentinel_while(Duration::from_millis(5), || false),
            Err(ChannelError::Abandoned)
        ));
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let channel: BoundedChannel<u8> = BoundedChannel::new(0);
        assert_eq!(channel.capacity(), 1);
        assert!(channel.try_push(1));
        assert!(!channel.try_push(2));
    }
}
