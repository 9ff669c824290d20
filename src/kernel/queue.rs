//! Priority-ordered thread lists
//!
//! Backs the ready list, the all-threads list and the wait lists of the
//! blocking primitives. Ordered insertion keeps higher effective priorities
//! first; among equal priorities the earlier insertion stays first.

use super::thread::Thread;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct ThreadQueue {
    threads: VecDeque<Arc<Thread>>,
}

impl ThreadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert after every thread whose priority is at least as high
    pub fn insert_ordered(&mut self, thread: Arc<Thread>) {
        let priority = thread.priority();
        let position = self
            .threads
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.threads.len());
        self.threads.insert(position, thread);
    }

    pub fn push_back(&mut self, thread: Arc<Thread>) {
        self.threads.push_back(thread);
    }

    pub fn pop_front(&mut self) -> Option<Arc<Thread>> {
        self.threads.pop_front()
    }

    /// Remove the first thread with the highest current priority.
    ///
    /// Unlike [`pop_front`](Self::pop_front) this is correct even when
    /// priorities changed after insertion.
    pub fn pop_highest(&mut self) -> Option<Arc<Thread>> {
        let mut best: Option<(usize, u8)> = None;
        for (index, thread) in self.threads.iter().enumerate() {
            let priority = thread.priority();
            if best.is_none_or(|(_, top)| priority > top) {
                best = Some((index, priority));
            }
        }
        best.and_then(|(index, _)| self.threads.remove(index))
    }

    pub fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        match self.threads.iter().position(|queued| Arc::ptr_eq(queued, thread)) {
            Some(index) => {
                self.threads.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, thread: &Arc<Thread>) -> bool {
        self.threads.iter().any(|queued| Arc::ptr_eq(queued, thread))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Thread>> + '_ {
        self.threads.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.threads.iter()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::thread::tests::detached_thread;
    use proptest::prelude::*;

    fn ids(queue: &ThreadQueue) -> Vec<u64> {
        queue.iter().map(|thread| thread.id().0).collect()
    }

    #[test]
    fn test_ordered_insert_is_stable() {
        let mut queue = ThreadQueue::new();
        queue.insert_ordered(detached_thread(1, 5));
        queue.insert_ordered(detached_thread(2, 9));
        queue.insert_ordered(detached_thread(3, 5));
        queue.insert_ordered(detached_thread(4, 9));
        queue.insert_ordered(detached_thread(5, 0));
        assert_eq!(ids(&queue), vec![2, 4, 1, 3, 5]);
    }

    #[test]
    fn test_pop_highest_sees_raised_priority() {
        let mut queue = ThreadQueue::new();
        let low = detached_thread(1, 3);
        queue.insert_ordered(detached_thread(2, 7));
        queue.insert_ordered(low.clone());
        low.set_priority(9);
        assert_eq!(queue.pop_highest().unwrap().id().0, 1);
        assert_eq!(queue.pop_highest().unwrap().id().0, 2);
        assert!(queue.pop_highest().is_none());
    }

    #[test]
    fn test_pop_highest_prefers_earliest_on_tie() {
        let mut queue = ThreadQueue::new();
        queue.push_back(detached_thread(1, 4));
        queue.push_back(detached_thread(2, 4));
        assert_eq!(queue.pop_highest().unwrap().id().0, 1);
    }

    #[test]
    fn test_remove_and_contains() {
        let mut queue = ThreadQueue::new();
        let a = detached_thread(1, 4);
        let b = detached_thread(2, 4);
        queue.push_back(a.clone());
        assert!(queue.contains(&a));
        assert!(!queue.remove(&b));
        assert!(queue.remove(&a));
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn ordered_insert_sorts_descending_and_keeps_fifo_ties(
            priorities in proptest::collection::vec(0u8..=31, 0..40)
        ) {
            let mut queue = ThreadQueue::new();
            for (id, priority) in priorities.iter().enumerate() {
                queue.insert_ordered(detached_thread(id as u64, *priority));
            }

            let mut expected: Vec<(u8, u64)> = priorities
                .iter()
                .enumerate()
                .map(|(id, priority)| (*priority, id as u64))
                .collect();
            // stable sort: ties keep insertion order
            expected.sort_by(|a, b| b.0.cmp(&a.0));

            let actual: Vec<(u8, u64)> = queue
                .iter()
                .map(|thread| (thread.priority(), thread.id().0))
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
