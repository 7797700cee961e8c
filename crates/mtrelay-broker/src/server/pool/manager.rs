//! Worker pool: the broker's view of every connected worker.
//!
//! This module defines the [`WorkerPool`] struct, which tracks workers in two
//! disjoint collections:
//!
//! - `ready`: idle workers in the order they became idle. Work is handed out
//!   FIFO from the front, so the least recently used worker is picked first
//!   and the pool acts as a round-robin across idle workers.
//! - `waiting`: workers holding exactly one in-flight request, keyed by
//!   address.
//!
//! The pool also designates one worker as the *publisher*: the sole recipient
//! of subscription commands, so that per-terminal subscription state lives on
//! a single backend.
//!
//! The pool is owned by the router loop and is never shared, so it needs no
//! synchronization. Every method takes the current instant explicitly, which
//! keeps liveness decisions deterministic under test.

use super::worker::Worker;
use crate::server::{
    outbound::Outbound,
    routing::request::Request,
    telemetry::{increment_abandoned_replies, increment_workers_evicted, record_ready_workers},
};
use bytes::Bytes;
use core::time::Duration;
use mtrelay_core::{Address, Error, types::EXPIRED_DETAIL, wire::Reply};
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

/// What to do with an affine request whose target worker is gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AffinityMiss {
    /// Report [`Error::NoWorkerAvailable`] so the request waits (queued) for
    /// the next publisher.
    #[default]
    Wait,
    /// Hand the request to any ready worker instead.
    Substitute,
}

/// A dispatch that found no eligible worker. The request is handed back so
/// the caller can queue it.
#[derive(Debug)]
pub struct NoWorkerAvailable(pub Request);

impl From<NoWorkerAvailable> for Error {
    fn from(_: NoWorkerAvailable) -> Self {
        Self::NoWorkerAvailable
    }
}

pub struct WorkerPool {
    ready: VecDeque<Worker>,
    waiting: HashMap<Address, Worker>,
    publisher: Option<Address>,
    liveness: Duration,
    affinity_miss: AffinityMiss,
}

impl WorkerPool {
    /// Creates an empty pool. `liveness` is the window a worker may stay
    /// silent (heartbeat interval times liveness multiplier) and also the reply
    /// deadline armed on every dispatch.
    pub fn new(liveness: Duration, affinity_miss: AffinityMiss) -> Self {
        Self {
            ready: VecDeque::new(),
            waiting: HashMap::new(),
            publisher: None,
            liveness,
            affinity_miss,
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_ready(&self, address: &Address) -> bool {
        self.ready.iter().any(|w| w.address() == address)
    }

    pub fn is_waiting(&self, address: &Address) -> bool {
        self.waiting.contains_key(address)
    }

    pub fn is_tracked(&self, address: &Address) -> bool {
        self.is_waiting(address) || self.is_ready(address)
    }

    /// The designated publisher, if it is still tracked by the pool.
    ///
    /// The role moves to another tracked worker as soon as the publisher is
    /// removed or evicted.
    pub fn publisher(&self) -> Option<&Address> {
        self.publisher.as_ref().filter(|a| self.is_tracked(a))
    }

    /// Designates `address` as publisher unless a live publisher exists.
    /// Returns `true` when `address` is the publisher afterwards.
    pub fn elect_publisher(&mut self, address: &Address) -> bool {
        if self.publisher().is_none() && self.is_tracked(address) {
            tracing::info!("Worker {address} designated as subscription publisher");
            self.publisher = Some(address.clone());
        }
        self.publisher.as_ref() == Some(address)
    }

    /// Inserts or refreshes a worker in `ready`, moving it to the back.
    ///
    /// A worker that announces readiness while still holding a request has
    /// abandoned it; that request is returned so the caller can fail it.
    pub fn ready(&mut self, address: Address, now: Instant) -> Option<Request> {
        let abandoned = self
            .waiting
            .remove(&address)
            .and_then(|mut w| w.take_pending());

        if let Some(pos) = self.ready.iter().position(|w| *w.address() == address) {
            self.ready.remove(pos);
        }
        self.ready
            .push_back(Worker::new(address, now + self.liveness));
        record_ready_workers(self.ready.len());
        abandoned
    }

    /// Refreshes the expiry of an idle worker after a heartbeat.
    ///
    /// Busy workers keep the reply deadline armed at dispatch. Returns `false`
    /// for unknown addresses.
    pub fn heartbeat(&mut self, address: &Address, now: Instant) -> bool {
        if let Some(worker) = self.ready.iter_mut().find(|w| w.address() == address) {
            worker.refresh(now + self.liveness);
            return true;
        }
        self.waiting.contains_key(address)
    }

    /// Pops the least recently readied live worker.
    ///
    /// Workers whose expiry elapsed are discarded along the way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoWorkerAvailable`] once the ready queue is exhausted.
    pub fn next(&mut self, now: Instant) -> Result<Worker, Error> {
        while let Some(worker) = self.ready.pop_front() {
            if worker.is_expired(now) {
                self.evict(&worker, "heartbeat expired", now);
                continue;
            }
            record_ready_workers(self.ready.len());
            return Ok(worker);
        }
        record_ready_workers(0);
        Err(Error::NoWorkerAvailable)
    }

    /// Evicts `address` from both collections.
    ///
    /// The removed record is returned, marked expired, with its in-flight
    /// request (if any) still attached so the caller can fail it.
    pub fn remove(&mut self, address: &Address, now: Instant) -> Option<Worker> {
        let mut removed = self.waiting.remove(address);
        if let Some(pos) = self.ready.iter().position(|w| w.address() == address) {
            let worker = self.ready.remove(pos);
            removed = removed.or(worker);
            record_ready_workers(self.ready.len());
        }

        self.release_publisher(address, now);

        removed.map(|mut w| {
            w.expire(now);
            w
        })
    }

    /// Hands `request` to a worker and forwards its frame.
    ///
    /// With a `target`, that worker is used if it is idle. If the target is
    /// busy the request cannot be served yet. If the target is gone, an
    /// `affinitize`d request follows the [`AffinityMiss`] policy while a plain
    /// one falls back to [`next`](Self::next).
    ///
    /// The chosen worker moves from `ready` to `waiting` with its reply
    /// deadline armed.
    ///
    /// # Errors
    ///
    /// Returns the request inside [`NoWorkerAvailable`] when no eligible
    /// worker exists.
    pub fn dispatch(
        &mut self,
        request: Request,
        target: Option<&Address>,
        affinitize: bool,
        now: Instant,
        out: &mut impl Outbound,
    ) -> Result<Address, NoWorkerAvailable> {
        let worker = match target {
            Some(address) if self.waiting.contains_key(address) => {
                return Err(NoWorkerAvailable(request));
            }
            Some(address) => match self.take_ready(address, now) {
                Some(worker) => Ok(worker),
                None if affinitize && self.affinity_miss == AffinityMiss::Wait => {
                    return Err(NoWorkerAvailable(request));
                }
                None => self.next(now),
            },
            None => self.next(now),
        };

        let Ok(mut worker) = worker else {
            return Err(NoWorkerAvailable(request));
        };

        let address = worker.address().clone();
        worker.refresh(now + self.liveness);
        out.to_worker(&address, request.frame().clone());
        tracing::debug!("Dispatched {} to worker {address}", request.label());
        worker.assign(request);
        self.waiting.insert(address.clone(), worker);
        Ok(address)
    }

    /// Routes a worker reply back to the client that is waiting on it and
    /// recycles the worker into `ready`.
    ///
    /// A reply from a worker that is not waiting (already timed out, removed,
    /// or never dispatched to) is abandoned: logged and dropped. Returns
    /// whether the reply was delivered.
    pub fn match_reply(
        &mut self,
        address: &Address,
        frame: Bytes,
        now: Instant,
        out: &mut impl Outbound,
    ) -> bool {
        let Some(mut worker) = self.waiting.remove(address) else {
            tracing::warn!("Abandoned reply from untracked worker {address}");
            increment_abandoned_replies();
            return false;
        };

        let delivered = match worker.take_pending() {
            Some(request) => {
                out.to_client(request.client(), frame);
                true
            }
            None => {
                tracing::warn!("Worker {address} replied with nothing in flight");
                increment_abandoned_replies();
                false
            }
        };

        worker.refresh(now + self.liveness);
        self.ready.push_back(worker);
        record_ready_workers(self.ready.len());
        delivered
    }

    /// Drops every waiting worker whose reply deadline elapsed and answers
    /// its stalled client with `KO|Expired`. Expired workers are not
    /// re-readied. Returns the number of workers purged.
    pub fn purge_expired(&mut self, now: Instant, out: &mut impl Outbound) -> usize {
        let expired: Vec<Address> = self
            .waiting
            .iter()
            .filter(|(_, w)| w.is_expired(now))
            .map(|(a, _)| a.clone())
            .collect();

        for address in &expired {
            let Some(mut worker) = self.waiting.remove(address) else {
                continue;
            };
            self.evict(&worker, "reply timed out", now);
            if let Some(request) = worker.take_pending() {
                out.to_client(request.client(), Reply::ko(EXPIRED_DETAIL).encode());
            }
        }
        expired.len()
    }

    /// Sends a heartbeat to every idle worker.
    pub fn ping_ready(&self, frame: &Bytes, out: &mut impl Outbound) {
        for worker in &self.ready {
            out.to_worker(worker.address(), frame.clone());
        }
    }

    /// Removes every in-flight request, e.g. to fail them at shutdown.
    pub fn drain_pending(&mut self) -> Vec<Request> {
        self.waiting
            .values_mut()
            .filter_map(Worker::take_pending)
            .collect()
    }

    fn take_ready(&mut self, address: &Address, now: Instant) -> Option<Worker> {
        let pos = self.ready.iter().position(|w| w.address() == address)?;
        let worker = self.ready.remove(pos)?;
        record_ready_workers(self.ready.len());
        if worker.is_expired(now) {
            self.evict(&worker, "heartbeat expired", now);
            return None;
        }
        Some(worker)
    }

    fn evict(&mut self, worker: &Worker, reason: &str, now: Instant) {
        tracing::warn!("Evicting worker {} ({reason})", worker.address());
        increment_workers_evicted();
        self.release_publisher(worker.address(), now);
    }

    /// Hands the publisher role on when `address`, already out of both
    /// collections, held it. The least recently used live idle worker takes
    /// over, else any busy one; with no workers left the next `READY` elects.
    fn release_publisher(&mut self, address: &Address, now: Instant) {
        if self.publisher.as_ref() != Some(address) {
            return;
        }
        self.publisher = self
            .ready
            .iter()
            .find(|w| !w.is_expired(now))
            .or_else(|| self.waiting.values().next())
            .map(|w| w.address().clone());
        match &self.publisher {
            Some(next) => tracing::warn!("Publisher worker {address} gone, {next} takes over"),
            None => tracing::warn!("Publisher worker {address} gone, awaiting re-election"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::outbound::Recorder;

    const LIVENESS: Duration = Duration::from_secs(10);

    fn addr(name: &'static str, conn: u64) -> Address {
        Address::new(name, conn)
    }

    fn request(client: u64, frame: &'static str, now: Instant) -> Request {
        Request::new(addr("Client", client), Bytes::from_static(frame.as_bytes()), now)
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(LIVENESS, AffinityMiss::Wait)
    }

    fn assert_disjoint(pool: &WorkerPool) {
        for worker in &pool.ready {
            assert!(!pool.waiting.contains_key(worker.address()));
        }
    }

    #[test]
    fn next_is_fifo_over_ready_order() {
        let now = Instant::now();
        let mut pool = pool();
        pool.ready(addr("a", 1), now);
        pool.ready(addr("b", 2), now);
        pool.ready(addr("c", 3), now);
        // Re-readying moves a worker to the back.
        pool.ready(addr("a", 1), now);

        assert_eq!(pool.next(now).unwrap().address(), &addr("b", 2));
        assert_eq!(pool.next(now).unwrap().address(), &addr("c", 3));
        assert_eq!(pool.next(now).unwrap().address(), &addr("a", 1));
        assert_eq!(pool.next(now).unwrap_err(), Error::NoWorkerAvailable);
    }

    #[test]
    fn next_discards_expired_workers() {
        let now = Instant::now();
        let mut pool = pool();
        pool.ready(addr("stale", 1), now);
        pool.ready(addr("fresh", 2), now + Duration::from_secs(5));

        let later = now + LIVENESS + Duration::from_secs(1);
        assert_eq!(pool.next(later).unwrap().address(), &addr("fresh", 2));
        assert!(!pool.is_tracked(&addr("stale", 1)));
    }

    #[test]
    fn heartbeat_keeps_idle_worker_alive() {
        let now = Instant::now();
        let mut pool = pool();
        pool.ready(addr("a", 1), now);

        let almost = now + LIVENESS - Duration::from_secs(1);
        assert!(pool.heartbeat(&addr("a", 1), almost));
        assert!(!pool.heartbeat(&addr("ghost", 9), almost));

        let later = now + LIVENESS + Duration::from_secs(1);
        assert!(pool.next(later).is_ok());
    }

    #[test]
    fn at_most_one_request_in_flight_per_worker() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("a", 1), now);

        let first = pool.dispatch(request(1, "TIME;1;", now), None, false, now, &mut out);
        assert_eq!(first.unwrap(), addr("a", 1));
        assert_disjoint(&pool);

        let second = pool.dispatch(request(2, "TIME;2;", now), None, false, now, &mut out);
        assert!(second.is_err());
        // Explicitly targeting the busy worker does not double-book it either.
        let third = pool.dispatch(
            request(3, "TIME;3;", now),
            Some(&addr("a", 1)),
            false,
            now,
            &mut out,
        );
        assert!(third.is_err());

        assert_eq!(out.workers.len(), 1);
        assert_eq!(pool.waiting_len(), 1);
        assert_eq!(pool.ready_len(), 0);
    }

    #[test]
    fn reply_goes_back_to_waiting_client_and_recycles_worker() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("a", 1), now);
        pool.dispatch(request(7, "TIME;x;", now), None, false, now, &mut out)
            .unwrap();

        let delivered = pool.match_reply(&addr("a", 1), Bytes::from_static(b"OK;x;42"), now, &mut out);

        assert!(delivered);
        assert_eq!(out.clients, vec![(addr("Client", 7), Bytes::from_static(b"OK;x;42"))]);
        assert!(pool.is_ready(&addr("a", 1)));
        assert!(!pool.is_waiting(&addr("a", 1)));
    }

    #[test]
    fn reply_from_untracked_worker_is_abandoned() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("a", 1), now);

        assert!(!pool.match_reply(&addr("a", 1), Bytes::from_static(b"OK;;"), now, &mut out));
        assert!(!pool.match_reply(&addr("ghost", 2), Bytes::from_static(b"OK;;"), now, &mut out));
        assert!(out.clients.is_empty());
    }

    #[test]
    fn purge_answers_stalled_client_and_drops_worker() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("a", 1), now);
        pool.ready(addr("b", 2), now);
        pool.dispatch(request(1, "TIME;1;", now), None, false, now, &mut out)
            .unwrap();

        assert_eq!(pool.purge_expired(now + Duration::from_secs(1), &mut out), 0);

        let later = now + LIVENESS;
        assert_eq!(pool.purge_expired(later, &mut out), 1);
        assert_eq!(out.clients, vec![(addr("Client", 1), Bytes::from_static(b"KO|Expired"))]);
        assert!(!pool.is_tracked(&addr("a", 1)));

        // A late reply from the purged worker is not delivered a second time.
        assert!(!pool.match_reply(&addr("a", 1), Bytes::from_static(b"OK;1;late"), later, &mut out));
        assert_eq!(out.clients.len(), 1);
        // And the request was never re-sent to the other worker.
        assert_eq!(out.workers.len(), 1);
    }

    #[test]
    fn affinity_targets_the_publisher_only() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("pub", 1), now);
        pool.ready(addr("other", 2), now);
        assert!(pool.elect_publisher(&addr("pub", 1)));
        assert!(!pool.elect_publisher(&addr("other", 2)));

        let publisher = pool.publisher().cloned().unwrap();
        let chosen = pool
            .dispatch(request(1, "SUB_BARS;1;", now), Some(&publisher), true, now, &mut out)
            .unwrap();
        assert_eq!(chosen, publisher);

        // Publisher busy: the next affine request must wait rather than go to
        // the idle worker.
        let busy = pool.dispatch(request(2, "SUB_BARS;2;", now), Some(&publisher), true, now, &mut out);
        assert!(busy.is_err());
        assert!(pool.is_ready(&addr("other", 2)));
    }

    #[test]
    fn affinity_miss_policy_applies_when_target_is_gone() {
        let now = Instant::now();
        let gone = addr("gone", 9);

        let mut waiting = WorkerPool::new(LIVENESS, AffinityMiss::Wait);
        let mut out = Recorder::default();
        waiting.ready(addr("a", 1), now);
        assert!(
            waiting
                .dispatch(request(1, "SUB_X;1;", now), Some(&gone), true, now, &mut out)
                .is_err()
        );

        let mut substitute = WorkerPool::new(LIVENESS, AffinityMiss::Substitute);
        substitute.ready(addr("a", 1), now);
        assert_eq!(
            substitute
                .dispatch(request(1, "SUB_X;1;", now), Some(&gone), true, now, &mut out)
                .unwrap(),
            addr("a", 1)
        );
    }

    #[test]
    fn publisher_is_re_elected_after_removal() {
        let now = Instant::now();
        let mut pool = pool();
        pool.ready(addr("first", 1), now);
        assert!(pool.elect_publisher(&addr("first", 1)));

        let removed = pool.remove(&addr("first", 1), now).unwrap();
        assert!(removed.is_expired(now));
        assert!(pool.publisher().is_none());

        pool.ready(addr("second", 2), now);
        assert!(pool.elect_publisher(&addr("second", 2)));
        assert_eq!(pool.publisher(), Some(&addr("second", 2)));
    }

    #[test]
    fn publisher_role_passes_to_an_idle_worker() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("first", 1), now);
        pool.ready(addr("second", 2), now);
        pool.ready(addr("third", 3), now);
        assert!(pool.elect_publisher(&addr("first", 1)));

        pool.remove(&addr("first", 1), now);
        assert_eq!(pool.publisher(), Some(&addr("second", 2)));

        // An evicted publisher hands over the same way, skipping idle workers
        // that are themselves past their deadline.
        pool.heartbeat(&addr("third", 3), now + Duration::from_secs(5));
        pool.dispatch(request(1, "SUB_X;1;", now), Some(&addr("second", 2)), true, now, &mut out)
            .unwrap();
        assert_eq!(pool.purge_expired(now + LIVENESS, &mut out), 1);
        assert_eq!(pool.publisher(), Some(&addr("third", 3)));
    }

    #[test]
    fn purge_evicts_publisher_once() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("only", 1), now);
        assert!(pool.elect_publisher(&addr("only", 1)));
        pool.dispatch(request(1, "SUB_X;1;", now), Some(&addr("only", 1)), true, now, &mut out)
            .unwrap();

        assert_eq!(pool.purge_expired(now + LIVENESS, &mut out), 1);
        assert!(pool.publisher().is_none());
        assert!(!pool.is_tracked(&addr("only", 1)));
        assert_eq!(out.clients, vec![(addr("Client", 1), Bytes::from_static(b"KO|Expired"))]);
    }

    #[test]
    fn ready_while_waiting_returns_abandoned_request() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("a", 1), now);
        pool.dispatch(request(5, "TIME;5;", now), None, false, now, &mut out)
            .unwrap();

        let abandoned = pool.ready(addr("a", 1), now).unwrap();
        assert_eq!(abandoned.client(), &addr("Client", 5));
        assert!(pool.is_ready(&addr("a", 1)));
        assert_disjoint(&pool);
    }

    #[test]
    fn remove_returns_in_flight_request() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("a", 1), now);
        pool.dispatch(request(3, "TIME;3;", now), None, false, now, &mut out)
            .unwrap();

        let mut removed = pool.remove(&addr("a", 1), now).unwrap();
        assert!(removed.take_pending().is_some());
        assert!(pool.remove(&addr("a", 1), now).is_none());
    }

    #[test]
    fn ping_reaches_only_idle_workers() {
        let now = Instant::now();
        let mut pool = pool();
        let mut out = Recorder::default();
        pool.ready(addr("idle", 1), now);
        pool.ready(addr("busy", 2), now);
        pool.dispatch(request(1, "TIME;1;", now), Some(&addr("busy", 2)), false, now, &mut out)
            .unwrap();
        out.workers.clear();

        pool.ping_ready(&Bytes::from_static(b"PING"), &mut out);
        assert_eq!(out.workers, vec![(addr("idle", 1), Bytes::from_static(b"PING"))]);
    }
}
