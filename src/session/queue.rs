//! History download queue
//!
//! FIFO of remote file identifiers with a single in-flight slot. The ring
//! cannot interleave reads, so a file is only started once the previous one
//! has completed or failed.

use std::collections::{HashMap, HashSet, VecDeque};

/// What happened to a file whose read failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back at the tail; `attempt` reads have failed so far
    Requeued { id: String, attempt: u32 },
    /// Retries exhausted
    Dropped { id: String },
}

#[derive(Debug, Default)]
pub struct DownloadQueue {
    pending: VecDeque<String>,
    current: Option<String>,
    failures: HashMap<String, u32>,
    /// Ids that exhausted their retries; skipped until the queue is cleared
    dropped: HashSet<String>,
    completed: usize,
    total: usize,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append ids not already queued, in flight or dropped. Returns how many
    /// were added. Enqueuing into a drained queue starts a new batch.
    pub fn enqueue<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.is_idle() {
            self.completed = 0;
            self.total = 0;
        }
        let mut added = 0;
        for id in ids {
            let id = id.into();
            if self.contains(&id) || self.dropped.contains(&id) {
                continue;
            }
            self.pending.push_back(id);
            added += 1;
        }
        self.total += added;
        added
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current.as_deref() == Some(id) || self.pending.iter().any(|p| p == id)
    }

    /// Move the head into the in-flight slot. `None` while a read is in
    /// flight or when nothing is left.
    pub fn start_next(&mut self) -> Option<&str> {
        if self.current.is_some() {
            return None;
        }
        self.current = self.pending.pop_front();
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn complete_current(&mut self) -> Option<String> {
        let id = self.current.take()?;
        self.failures.remove(&id);
        self.completed += 1;
        Some(id)
    }

    /// Record a failed read of the in-flight file. It is retried at most
    /// `max_retries` times after the first attempt.
    pub fn fail_current(&mut self, max_retries: u32) -> Option<FailOutcome> {
        let id = self.current.take()?;
        let attempt = {
            let count = self.failures.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if attempt > max_retries {
            self.failures.remove(&id);
            self.dropped.insert(id.clone());
            // A dropped file no longer counts towards the batch
            self.total = self.total.saturating_sub(1);
            return Some(FailOutcome::Dropped { id });
        }
        self.pending.push_back(id.clone());
        Some(FailOutcome::Requeued { id, attempt })
    }

    /// Forget everything, including batch progress
    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
        self.failures.clear();
        self.dropped.clear();
        self.completed = 0;
        self.total = 0;
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `(completed, total)` of the current batch
    pub fn progress(&self) -> (usize, usize) {
        (self.completed, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_with_single_slot() {
        let mut queue = DownloadQueue::new();
        assert_eq!(queue.enqueue(["F1", "F2"]), 2);
        assert_eq!(queue.enqueue(["F1", "F3"]), 1);

        assert_eq!(queue.start_next(), Some("F1"));
        assert_eq!(queue.start_next(), None);
        assert_eq!(queue.enqueue(["F1"]), 0);

        assert_eq!(queue.complete_current().as_deref(), Some("F1"));
        assert_eq!(queue.start_next(), Some("F2"));
        assert_eq!(queue.progress(), (1, 3));
    }

    #[test]
    fn test_in_flight_plus_pending_never_exceeds_outstanding() {
        let mut queue = DownloadQueue::new();
        queue.enqueue(["A", "B", "C"]);
        for step in 0..12 {
            if queue.current().is_none() {
                queue.start_next();
            }
            let (completed, total) = queue.progress();
            let in_flight = usize::from(queue.current().is_some());
            assert!(queue.pending_len() + in_flight <= total - completed);
            if step % 2 == 0 {
                queue.fail_current(2);
            } else {
                queue.complete_current();
            }
        }
        assert!(queue.is_idle());
    }

    #[test]
    fn test_retry_cap_drops_after_third_failure() {
        let mut queue = DownloadQueue::new();
        queue.enqueue(["F1", "F2"]);

        queue.start_next();
        assert_eq!(
            queue.fail_current(2),
            Some(FailOutcome::Requeued {
                id: "F1".into(),
                attempt: 1
            })
        );
        assert_eq!(queue.start_next(), Some("F2"));
        queue.complete_current();

        assert_eq!(queue.start_next(), Some("F1"));
        queue.fail_current(2);
        assert_eq!(queue.start_next(), Some("F1"));
        assert_eq!(
            queue.fail_current(2),
            Some(FailOutcome::Dropped { id: "F1".into() })
        );
        assert_eq!(queue.start_next(), None);
        assert!(queue.is_idle());
        assert_eq!(queue.progress(), (1, 1));

        assert_eq!(queue.enqueue(["F1"]), 0);
        assert_eq!(queue.start_next(), None);
    }

    #[test]
    fn test_clear_forgets_dropped_files() {
        let mut queue = DownloadQueue::new();
        queue.enqueue(["F1"]);
        for _ in 0..3 {
            queue.start_next();
            queue.fail_current(2);
        }
        assert_eq!(queue.enqueue(["F1"]), 0);

        queue.clear();
        assert_eq!(queue.enqueue(["F1"]), 1);
    }

    #[test]
    fn test_new_batch_resets_progress() {
        let mut queue = DownloadQueue::new();
        queue.enqueue(["F1"]);
        queue.start_next();
        queue.complete_current();
        assert_eq!(queue.progress(), (1, 1));

        queue.enqueue(["F2"]);
        assert_eq!(queue.progress(), (0, 1));

        queue.clear();
        assert_eq!(queue.progress(), (0, 0));
        assert_eq!(queue.current(), None);
    }
}
