use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::debug;

use crate::sources::TrackRef;

/// Per-session FIFO of pending tracks.
///
/// The queue is internally synchronized so a caller may park in
/// [`TrackQueue::pop_front_blocking`] without holding the session lock.
#[derive(Debug, Default)]
pub struct TrackQueue {
    items: Mutex<VecDeque<TrackRef>>,
    available: Notify,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a track and returns its 1-based position.
    pub fn push_back(&self, track: TrackRef) -> usize {
        let len = {
            let mut items = self.items.lock();
            items.push_back(track);
            items.len()
        };
        self.available.notify_one();
        debug!("➕ Track queued at position {}", len);
        len
    }

    /// Inserts a track ahead of everything already queued.
    pub fn push_front(&self, track: TrackRef) {
        self.items.lock().push_front(track);
        self.available.notify_one();
        debug!("⏫ Track pushed to the front of the queue");
    }

    pub fn try_pop_front(&self) -> Option<TrackRef> {
        self.items.lock().pop_front()
    }

    /// Waits until an item is available and removes it.
    ///
    /// Each insertion releases at most one waiter; waiters beyond the number
    /// of insertions stay parked.
    pub async fn pop_front_blocking(&self) -> TrackRef {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so an insertion between the check and
            // the await is not missed.
            notified.as_mut().enable();

            if let Some(track) = self.try_pop_front() {
                return track;
            }

            notified.await;
        }
    }

    pub fn peek_all(&self) -> Vec<TrackRef> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Drops every pending track, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let cleared = items.len();
        items.clear();
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn track(id: &str) -> TrackRef {
        TrackRef::new(format!("https://youtu.be/{id}"), id, format!("/tmp/{id}.wav"))
    }

    fn ids(tracks: &[TrackRef]) -> Vec<&str> {
        tracks.iter().map(|t| t.file_id()).collect()
    }

    #[test]
    fn push_back_is_fifo() {
        let queue = TrackQueue::new();
        queue.push_back(track("a"));
        queue.push_back(track("b"));
        queue.push_back(track("c"));

        assert_eq!(ids(&queue.peek_all()), vec!["a", "b", "c"]);
        assert_eq!(queue.try_pop_front().map(|t| t.file_id().to_string()), Some("a".into()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn push_front_jumps_the_line() {
        let queue = TrackQueue::new();
        queue.push_back(track("a"));
        queue.push_front(track("b"));
        queue.push_front(track("c"));

        assert_eq!(ids(&queue.peek_all()), vec!["c", "b", "a"]);
    }

    #[test]
    fn clear_empties_and_reports_count() {
        let queue = TrackQueue::new();
        queue.push_back(track("a"));
        queue.push_back(track("b"));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop_front(), None);
    }

    #[tokio::test]
    async fn blocking_pop_returns_existing_item_immediately() {
        let queue = TrackQueue::new();
        queue.push_back(track("a"));

        let popped = tokio::time::timeout(Duration::from_millis(100), queue.pop_front_blocking())
            .await
            .expect("item was already available");
        assert_eq!(popped.file_id(), "a");
    }

    #[tokio::test]
    async fn blocking_pop_waits_for_insertion() {
        let queue = Arc::new(TrackQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_front_blocking().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        queue.push_back(track("late"));
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke up")
            .expect("waiter did not panic");
        assert_eq!(popped.file_id(), "late");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn one_insertion_wakes_one_of_many_waiters() {
        let queue = Arc::new(TrackQueue::new());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop_front_blocking().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push_back(track("only"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let finished = waiters.iter().filter(|w| w.is_finished()).count();
        assert_eq!(finished, 1);

        queue.push_back(track("second"));
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("every waiter is eventually served")
                .expect("waiter did not panic");
        }
        assert!(queue.is_empty());
    }
}
