use super::request::Request;
use core::time::Duration;
use mtrelay_core::Address;
use std::collections::VecDeque;
use tokio::time::Instant;

/// A request that could not be queued because the queue is at capacity.
#[derive(Debug)]
pub struct QueueFull(pub Request);

/// Bounded FIFO of requests waiting for a worker.
///
/// Every entry carries a deadline of `received_at + ttl`. Expired entries are
/// never dispatched: [`pop_live`](Self::pop_live) skips them and
/// [`purge_expired`](Self::purge_expired) removes them on every tick.
#[derive(Debug)]
pub struct RequestQueue {
    name: &'static str,
    entries: VecDeque<(Request, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl RequestQueue {
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            ttl,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a request at the back.
    ///
    /// # Errors
    ///
    /// Hands the request back inside [`QueueFull`] when the queue already
    /// holds `capacity` entries.
    pub fn push(&mut self, request: Request) -> Result<(), QueueFull> {
        if self.entries.len() >= self.capacity {
            return Err(QueueFull(request));
        }
        let deadline = request.received_at() + self.ttl;
        self.entries.push_back((request, deadline));
        Ok(())
    }

    /// Puts a request back at the front, keeping its original deadline.
    pub fn push_front(&mut self, request: Request) {
        let deadline = request.received_at() + self.ttl;
        self.entries.push_front((request, deadline));
    }

    /// Pops the oldest live request. Expired entries met on the way are moved
    /// into `expired`.
    pub fn pop_live(&mut self, now: Instant, expired: &mut Vec<Request>) -> Option<Request> {
        while let Some((request, deadline)) = self.entries.pop_front() {
            if deadline <= now {
                expired.push(request);
                continue;
            }
            return Some(request);
        }
        None
    }

    /// Removes every expired entry, oldest first.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Request> {
        let mut expired = Vec::new();
        self.entries.retain(|(request, deadline)| {
            if *deadline <= now {
                expired.push(request.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Forgets every request from `client`. Returns how many were dropped.
    pub fn remove_client(&mut self, client: &Address) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(request, _)| request.client() != client);
        before - self.entries.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Request> + '_ {
        self.entries.drain(..).map(|(request, _)| request)
    }
}
