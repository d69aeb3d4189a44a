use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    bytes: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

/// Bounded queue of bytes waiting to be written to the down channel.
///
/// The queue has a single consumer, the [`Session`](crate::Session) that owns it, and any number of
/// [`InputBridge`] producer handles. Producers never block: bytes that do not fit are dropped.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Arc<Mutex<Inner>>,
}

impl OutboundQueue {
    /// Creates a queue that holds at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bytes: VecDeque::with_capacity(capacity),
                capacity,
                dropped: 0,
            })),
        }
    }

    /// Returns a producer handle for this queue.
    pub fn bridge(&self) -> InputBridge {
        InputBridge {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().bytes.is_empty()
    }

    /// Maximum number of bytes the queue holds.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Total number of bytes producers could not queue because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Removes and returns everything queued.
    pub fn take(&self) -> Vec<u8> {
        self.inner.lock().bytes.drain(..).collect()
    }

    /// Discards everything queued and returns how many bytes were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.bytes.len();
        inner.bytes.clear();
        count
    }
}

/// Producer handle of an [`OutboundQueue`].
///
/// Handles can be cloned and sent to other threads, e.g. a thread reading from stdin.
#[derive(Debug, Clone)]
pub struct InputBridge {
    inner: Arc<Mutex<Inner>>,
}

impl InputBridge {
    /// Queues as much of `bytes` as fits and returns the number of bytes queued. The rest is
    /// dropped.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock();

        let free = inner.capacity.saturating_sub(inner.bytes.len());
        let accepted = bytes.len().min(free);

        inner.bytes.extend(&bytes[..accepted]);

        let dropped = bytes.len() - accepted;
        if dropped > 0 {
            inner.dropped += dropped as u64;
            tracing::debug!("Outbound queue full, dropped {} bytes", dropped);
        }

        accepted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bytes_come_out_in_order() {
        let queue = OutboundQueue::new(16);
        let bridge = queue.bridge();

        bridge.push(b"abc");
        bridge.push(b"def");

        assert_eq!(queue.len(), 6);
        assert_eq!(queue.take(), b"abcdef".to_vec());
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_is_dropped_not_blocked() {
        let queue = OutboundQueue::new(4);
        let bridge = queue.bridge();

        assert_eq!(bridge.push(b"abc"), 3);
        assert_eq!(bridge.push(b"defg"), 1);
        assert_eq!(bridge.push(b"h"), 0);

        assert_eq!(queue.take(), b"abcd".to_vec());
        assert_eq!(queue.dropped(), 4);
    }

    #[test]
    fn clear_reports_discarded_bytes() {
        let queue = OutboundQueue::new(8);
        queue.bridge().push(b"hello");

        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    fn bridge_works_across_threads() {
        let queue = OutboundQueue::new(64);
        let bridge = queue.bridge();

        std::thread::spawn(move || {
            for chunk in [b"one ".as_slice(), b"two"] {
                bridge.push(chunk);
            }
        })
        .join()
        .unwrap();

        assert_eq!(queue.take(), b"one two".to_vec());
    }
}
