//! Bounded FIFO ring buffer.
//!
//! Every rolling window in the monitor (raw records, rate history, ADC
//! samples, messages) is a [`RingBuffer`]: a fixed-capacity queue where a
//! push at capacity evicts the oldest entry. Eviction is by age only;
//! reading an entry never refreshes it.

use std::collections::VecDeque;
use std::collections::vec_deque;

/// A fixed-capacity FIFO that evicts its oldest entry on overflow.
///
/// # Examples
///
/// ```rust
/// use pixmon::ring::RingBuffer;
///
/// let mut ring = RingBuffer::new(2);
/// ring.push(1);
/// ring.push(2);
/// assert_eq!(ring.push(3), Some(1));
/// assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// Number of entries evicted since creation or the last clear.
    evicted: u64,
}

impl<T> RingBuffer<T> {
    /// Creates an empty ring holding at most `capacity` entries.
    ///
    /// Storage grows on demand up to `capacity`; a large ring that never
    /// fills does not pay for its full size.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Appends an entry, returning the evicted oldest entry if the ring was
    /// full. A zero-capacity ring evicts the pushed entry itself.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.capacity == 0 {
            self.evicted += 1;
            return Some(value);
        }

        let evicted = if self.items.len() == self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(value);
        evicted
    }

    /// Removes every entry and resets the eviction count.
    pub fn clear(&mut self) {
        self.items.clear();
        self.evicted = 0;
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the ring holds no entries.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns whether the ring has evicted at least one entry.
    pub fn has_wrapped(&self) -> bool {
        self.evicted > 0
    }

    /// Number of entries evicted since creation or the last clear.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// The oldest entry.
    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    /// The newest entry.
    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    /// Iterates over at most `count` entries, newest first.
    pub fn newest_first(&self, count: usize) -> impl Iterator<Item = &T> {
        self.items.iter().rev().take(count)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copies the contents, oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T> Extend<T> for RingBuffer<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
