//! Timer ownership for the session controller
//!
//! Every timer the controller starts goes through a [`Scheduler`]: one
//! pending timer per kind, fired timers delivered as `(kind, token)` on a
//! channel the controller selects on. A timer that was replaced or cancelled
//! may still have its message in flight; [`Scheduler::take_fired`] rejects
//! those by token.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type Fired<K> = (K, u64);

pub struct Scheduler<K> {
    tx: mpsc::UnboundedSender<Fired<K>>,
    next_token: u64,
    pending: HashMap<K, (u64, AbortHandle)>,
}

impl<K> Scheduler<K>
where
    K: Copy + Eq + Hash + Send + 'static,
{
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fired<K>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tx,
            next_token: 0,
            pending: HashMap::new(),
        };
        (scheduler, rx)
    }

    /// Start (or restart) the timer of `kind`
    pub fn schedule(&mut self, kind: K, after: Duration) {
        self.cancel(kind);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((kind, token));
        });
        self.pending.insert(kind, (token, task.abort_handle()));
    }

    pub fn cancel(&mut self, kind: K) -> bool {
        match self.pending.remove(&kind) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer matching `filter`
    pub fn cancel_where(&mut self, filter: impl Fn(&K) -> bool) {
        let kinds: Vec<K> = self.pending.keys().filter(|k| filter(k)).copied().collect();
        for kind in kinds {
            self.cancel(kind);
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, kind: K) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Accept a fired timer if it is still the current one for its kind
    pub fn take_fired(&mut self, kind: K, token: u64) -> bool {
        match self.pending.get(&kind) {
            Some((current, _)) if *current == token => {
                self.pending.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.pending.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        A,
        B,
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (mut scheduler, mut fired) = Scheduler::new();
        scheduler.schedule(Kind::A, Duration::from_secs(4));
        assert!(scheduler.is_pending(Kind::A));

        let (kind, token) = fired.recv().await.unwrap();
        assert_eq!(kind, Kind::A);
        assert!(scheduler.take_fired(kind, token));
        assert!(!scheduler.is_pending(Kind::A));
        assert!(!scheduler.take_fired(kind, token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_makes_old_token_stale() {
        let (mut scheduler, mut fired) = Scheduler::new();
        scheduler.schedule(Kind::A, Duration::from_secs(1));
        let first = scheduler.pending[&Kind::A].0;
        scheduler.schedule(Kind::A, Duration::from_secs(2));

        assert!(!scheduler.take_fired(Kind::A, first));
        let (kind, token) = fired.recv().await.unwrap();
        assert_ne!(token, first);
        assert!(scheduler.take_fired(kind, token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_where_leaves_others() {
        let (mut scheduler, mut fired) = Scheduler::new();
        scheduler.schedule(Kind::A, Duration::from_secs(1));
        scheduler.schedule(Kind::B, Duration::from_secs(2));
        scheduler.cancel_where(|k| *k == Kind::A);

        assert!(!scheduler.is_pending(Kind::A));
        let (kind, token) = fired.recv().await.unwrap();
        assert_eq!(kind, Kind::B);
        assert!(scheduler.take_fired(kind, token));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(fired.try_recv().is_err());
    }
}
