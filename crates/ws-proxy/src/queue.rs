use std::collections::VecDeque;

/// FIFO buffer of messages held while a direction is locked.
///
/// Unbounded: growth is limited only by process memory.
#[derive(Debug)]
pub struct MessageQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Remove every queued item, oldest first. The queue is empty once the
    /// returned iterator is dropped.
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.items.drain(..)
    }
}
