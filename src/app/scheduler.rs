use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Shared queue a fixed set of device workers pull from. Each item keeps the position it was
/// queued at so results can be put back in order.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<(usize, T)>>,
}

impl<T> WorkQueue<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().enumerate().collect()),
        }
    }

    // Pops are atomic, so a lock poisoned by a panicking worker still holds a valid queue.
    fn lock_items(&self) -> MutexGuard<'_, VecDeque<(usize, T)>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn take_next(&self) -> Option<(usize, T)> {
        self.lock_items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn items_come_out_in_queue_order_with_positions() {
        let queue = WorkQueue::new(vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.take_next(), Some((0, "a")));
        assert_eq!(queue.take_next(), Some((1, "b")));
        assert_eq!(queue.take_next(), Some((2, "c")));
        assert_eq!(queue.take_next(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_workers_take_each_item_once() {
        let queue = Arc::new(WorkQueue::new((0..200).collect::<Vec<u32>>()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some((position, item)) = queue.take_next() {
                        assert_eq!(position as u32, item);
                        taken.push(item);
                    }
                    taken
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for item in handle.join().expect("join") {
                assert!(seen.insert(item), "item {item} handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn queue_survives_a_panicking_holder() {
        let queue = Arc::new(WorkQueue::new(vec![1, 2]));
        let worker = Arc::clone(&queue);
        let result = thread::spawn(move || {
            let _guard = worker.lock_items();
            panic!("worker blew up");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(queue.take_next(), Some((0, 1)));
        assert_eq!(queue.len(), 1);
    }
}
