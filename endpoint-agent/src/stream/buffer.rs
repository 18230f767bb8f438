//! Outgoing record buffers
//!
//! - [`TierQueue`]: bounded FIFO with an overflow margin, many producers and
//!   one async consumer (primary and secondary tiers)
//! - [`InFlight`]: present/past double buffer of records handed to the
//!   socket but not yet known to be delivered

use crate::docs::Doc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Bounded FIFO that refuses records once within `margin` of `capacity`
#[derive(Debug)]
pub struct TierQueue {
    items: Mutex<VecDeque<Doc>>,
    ready: Notify,
    capacity: usize,
    margin: usize,
    rejected: AtomicU64,
}

impl TierQueue {
    pub fn new(capacity: usize, margin: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            capacity,
            margin,
            rejected: AtomicU64::new(0),
        }
    }

    /// Length above which pushes are refused
    pub fn limit(&self) -> usize {
        self.capacity.saturating_sub(self.margin)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Number of pushes refused so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Enqueue, handing the record back when the queue is too full
    pub fn try_push(&self, doc: Doc) -> Result<(), Doc> {
        {
            let mut items = self.items.lock();
            if items.len() > self.limit() {
                drop(items);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(doc);
            }
            items.push_back(doc);
        }
        self.ready.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Doc> {
        self.items.lock().pop_front()
    }

    /// Wait for the next record; cancel safe
    pub async fn recv(&self) -> Doc {
        loop {
            if let Some(doc) = self.try_pop() {
                return doc;
            }
            self.ready.notified().await;
        }
    }
}

/// Present/past generations of records already written to the socket
#[derive(Debug)]
pub struct InFlight {
    present: Vec<Doc>,
    past: Vec<Doc>,
    swapped_at: Instant,
    capacity: usize,
    margin: usize,
    swap_interval: Duration,
}

impl InFlight {
    pub fn new(capacity: usize, margin: usize, swap_interval: Duration) -> Self {
        Self {
            present: Vec::with_capacity(capacity),
            past: Vec::new(),
            swapped_at: Instant::now(),
            capacity,
            margin,
            swap_interval,
        }
    }

    pub fn record(&mut self, doc: Doc) -> &Doc {
        self.record_at(doc, Instant::now())
    }

    /// Track a record, rotating generations when present is full or stale
    pub fn record_at(&mut self, doc: Doc, now: Instant) -> &Doc {
        let full = self.present.len() > self.capacity.saturating_sub(self.margin);
        let stale = now.saturating_duration_since(self.swapped_at) > self.swap_interval;
        if full || stale {
            self.swap(now);
        }

        self.present.push(doc);
        &self.present[self.present.len() - 1]
    }

    /// Past is discarded, present becomes past
    fn swap(&mut self, now: Instant) {
        self.swapped_at = now;
        self.past = std::mem::replace(&mut self.present, Vec::with_capacity(self.capacity));
    }

    pub fn len(&self) -> usize {
        self.present.len() + self.past.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every tracked record, oldest first, leaving both buffers empty
    pub fn drain(&mut self) -> Vec<Doc> {
        let mut docs = std::mem::take(&mut self.past);
        docs.append(&mut self.present);
        self.present = Vec::with_capacity(self.capacity);
        self.swapped_at = Instant::now();
        docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::LoadDoc;

    fn doc(n: u32) -> Doc {
        Doc::Load(LoadDoc {
            load1: n as f64,
            ..Default::default()
        })
    }

    fn value(doc: &Doc) -> u32 {
        match doc {
            Doc::Load(d) => d.load1 as u32,
            _ => panic!("unexpected doc"),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = TierQueue::new(20, 5);
        for n in 0..10 {
            queue.try_push(doc(n)).unwrap();
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).map(|d| value(&d)).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_refuses_within_margin() {
        let queue = TierQueue::new(10, 3);
        // Accepts while len <= capacity - margin
        for n in 0..8 {
            assert!(queue.try_push(doc(n)).is_ok());
        }
        let refused = queue.try_push(doc(99)).unwrap_err();
        assert_eq!(value(&refused), 99);
        assert_eq!(queue.len(), 8);
        assert_eq!(queue.rejected(), 1);

        queue.try_pop();
        assert!(queue.try_push(doc(8)).is_ok());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = std::sync::Arc::new(TierQueue::new(10, 1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;
        queue.try_push(doc(7)).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value(&received), 7);
    }

    #[test]
    fn test_in_flight_swaps_when_full() {
        let mut in_flight = InFlight::new(6, 2, Duration::from_secs(180));
        let now = Instant::now();
        for n in 0..5 {
            in_flight.record_at(doc(n), now);
        }
        // Present holds 5 > 6 - 2, next record rotates it into past
        in_flight.record_at(doc(5), now);
        assert_eq!(in_flight.present.len(), 1);
        assert_eq!(in_flight.past.len(), 5);

        for n in 6..10 {
            in_flight.record_at(doc(n), now);
        }
        // Second rotation discards the oldest generation
        in_flight.record_at(doc(10), now);
        assert_eq!(in_flight.len(), 6);
        let order: Vec<u32> = in_flight.drain().iter().map(value).collect();
        assert_eq!(order, (5..11).collect::<Vec<_>>());
    }

    #[test]
    fn test_in_flight_swaps_on_interval() {
        let start = Instant::now();
        let mut in_flight = InFlight::new(100, 10, Duration::from_secs(60));
        in_flight.record_at(doc(0), start);
        in_flight.record_at(doc(1), start + Duration::from_secs(61));
        assert_eq!(in_flight.past.len(), 1);
        assert_eq!(in_flight.present.len(), 1);
    }

    #[test]
    fn test_drain_returns_oldest_first() {
        let mut in_flight = InFlight::new(4, 1, Duration::from_secs(180));
        let now = Instant::now();
        for n in 0..6 {
            in_flight.record_at(doc(n), now);
        }
        let order: Vec<u32> = in_flight.drain().iter().map(value).collect();
        assert_eq!(order, (0..6).collect::<Vec<_>>());
        assert!(in_flight.is_empty());
    }
}
