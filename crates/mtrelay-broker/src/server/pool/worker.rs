use crate::server::routing::request::Request;
use mtrelay_core::Address;
use tokio::time::Instant;

/// Broker-side record of one connected worker.
///
/// A worker is owned by exactly one [`WorkerPool`](super::manager::WorkerPool)
/// and lives in either its ready queue or its waiting map, never both.
///
/// - `expiry` is the instant after which the worker is presumed dead. It is
///   pushed forward whenever the worker proves it is alive (a `READY`, a
///   heartbeat while idle, a reply) and re-armed as the reply deadline when a
///   request is dispatched to it.
/// - `pending` holds the single request the worker is executing, if any.
#[derive(Debug)]
pub struct Worker {
    address: Address,
    expiry: Instant,
    pending: Option<Request>,
}

impl Worker {
    pub const fn new(address: Address, expiry: Instant) -> Self {
        Self {
            address,
            expiry,
            pending: None,
        }
    }

    pub const fn address(&self) -> &Address {
        &self.address
    }

    pub const fn expiry(&self) -> Instant {
        self.expiry
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry <= now
    }

    pub fn refresh(&mut self, expiry: Instant) {
        self.expiry = expiry;
    }

    /// Marks the worker dead so any later scan discards it.
    pub fn expire(&mut self, now: Instant) {
        self.expiry = now;
    }

    pub const fn pending(&self) -> Option<&Request> {
        self.pending.as_ref()
    }

    /// Records the in-flight request.
    ///
    /// # Panics
    ///
    /// Debug builds panic if a request is already in flight.
    pub fn assign(&mut self, request: Request) {
        debug_assert!(
            self.pending.is_none(),
            "worker {} already has a request in flight",
            self.address
        );
        self.pending = Some(request);
    }

    pub fn take_pending(&mut self) -> Option<Request> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use core::time::Duration;

    #[test]
    fn expiry_is_inclusive() {
        let now = Instant::now();
        let mut worker = Worker::new(Address::new("w", 1), now + Duration::from_secs(1));
        assert!(!worker.is_expired(now));
        assert!(worker.is_expired(now + Duration::from_secs(1)));

        worker.expire(now);
        assert!(worker.is_expired(now));
    }

    #[test]
    fn pending_slot_round_trip() {
        let now = Instant::now();
        let mut worker = Worker::new(Address::new("w", 1), now);
        let request = Request::new(Address::new("Client-0", 2), Bytes::from_static(b"TIME;id;"), now);

        worker.assign(request);
        assert_eq!(worker.pending().map(Request::action), Some(&b"TIME"[..]));
        assert!(worker.take_pending().is_some());
        assert!(worker.pending().is_none());
    }
}
