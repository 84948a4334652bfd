//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Bounded drop-oldest FIFO for publishes awaiting the broker."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::collections::VecDeque;

use crate::codec::OutboundMessage;

/// FIFO of unpublished messages. When full, the oldest entry is evicted.
#[derive(Debug)]
pub struct OutboundBuffer {
    queue: VecDeque<OutboundMessage>,
    capacity: usize,
    dropped: u64,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a message, returning the evicted oldest entry on overflow.
    pub fn push(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        let evicted = if self.queue.len() >= self.capacity {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(message);
        evicted
    }

    /// Return messages to the head of the queue, keeping their order.
    ///
    /// Overflow still evicts from the head, so when the buffer is full the
    /// oldest requeued messages are the ones lost.
    pub fn requeue<I>(&mut self, messages: I) -> Vec<OutboundMessage>
    where
        I: IntoIterator<Item = OutboundMessage>,
        I::IntoIter: DoubleEndedIterator,
    {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
        let mut evicted = Vec::new();
        while self.queue.len() > self.capacity {
            if let Some(message) = self.queue.pop_front() {
                self.dropped += 1;
                evicted.push(message);
            }
        }
        evicted
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total messages evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(seq: u32) -> OutboundMessage {
        OutboundMessage {
            topic: "app/devices/dev/up".into(),
            payload: seq.to_be_bytes().to_vec(),
            device_id: "dev".into(),
            seq,
        }
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let mut buffer = OutboundBuffer::new(3);
        for seq in 1..=3 {
            assert!(buffer.push(message(seq)).is_none());
        }
        let evicted = buffer.push(message(4)).expect("oldest evicted");
        assert_eq!(evicted.seq, 1);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.len(), 3);
        let remaining: Vec<u32> = std::iter::from_fn(|| buffer.pop()).map(|m| m.seq).collect();
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[test]
    fn requeue_preserves_order_at_the_head() {
        let mut buffer = OutboundBuffer::new(4);
        buffer.push(message(3));
        let evicted = buffer.requeue(vec![message(1), message(2)]);
        assert!(evicted.is_empty());
        let order: Vec<u32> = std::iter::from_fn(|| buffer.pop()).map(|m| m.seq).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn requeue_overflow_counts_drops() {
        let mut buffer = OutboundBuffer::new(2);
        buffer.push(message(3));
        buffer.push(message(4));
        let evicted = buffer.requeue(vec![message(2)]);
        assert_eq!(evicted.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2]);
        assert_eq!(buffer.dropped(), 1);
    }
}
