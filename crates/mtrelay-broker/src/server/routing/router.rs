//! The broker's request router.
//!
//! [`Router`] is the single owner of the [`WorkerPool`] and both request
//! queues. It is a plain state machine: every transport event is fed in with
//! the current instant and an [`Outbound`] to write to, which keeps it
//! deterministic under test. [`run_router`] is the async loop that drives it
//! from the client and worker endpoints plus a heartbeat ticker.

use super::{
    queue::{QueueFull, RequestQueue},
    request::{Classifier, Request, RequestClass},
};
use crate::server::{
    config::BrokerConfig,
    outbound::{Links, Outbound},
    pool::manager::{NoWorkerAvailable, WorkerPool},
    service::connection::LinkEvent,
    telemetry::{
        increment_dispatched, increment_expired, increment_queue_rejections, increment_queued,
        increment_requests, record_queue_wait,
    },
};
use bytes::Bytes;
use core::{fmt, time::Duration};
use mtrelay_core::{
    Address,
    types::{EXPIRED_DETAIL, NO_WORKER_DETAIL, SHUTDOWN_DETAIL},
    wire::{Reply, WorkerSignal},
};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;

/// Which router endpoint a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Worker,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Worker => "worker",
        })
    }
}

pub struct Router {
    pool: WorkerPool,
    ordinary: RequestQueue,
    subscriptions: RequestQueue,
    classifier: Classifier,
    ping: Bytes,
}

impl Router {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            pool: WorkerPool::new(config.liveness_window(), config.affinity_miss),
            ordinary: RequestQueue::new("ordinary", config.queue_capacity, config.request_ttl),
            subscriptions: RequestQueue::new(
                "subscription",
                config.queue_capacity,
                config.request_ttl,
            ),
            classifier: Classifier::new(&config.subscribe_prefixes),
            ping: WorkerSignal::Ping.frame().unwrap_or_default(),
        }
    }

    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Lengths of the ordinary and subscription queues.
    pub fn queued(&self) -> (usize, usize) {
        (self.ordinary.len(), self.subscriptions.len())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(worker = %worker)))]
    pub fn on_worker_message(
        &mut self,
        worker: &Address,
        frame: Bytes,
        now: Instant,
        out: &mut impl Outbound,
    ) {
        match WorkerSignal::classify(&frame) {
            WorkerSignal::Ready => {
                if let Some(stalled) = self.pool.ready(worker.clone(), now) {
                    tracing::warn!(
                        "Worker {worker} re-announced READY while serving {}",
                        stalled.label()
                    );
                    out.to_client(stalled.client(), Reply::ko(EXPIRED_DETAIL).encode());
                } else {
                    tracing::debug!("Worker {worker} ready");
                }
                self.pool.elect_publisher(worker);
                self.drain_onto(worker, now, out);
            }
            WorkerSignal::Ping => {
                if !self.pool.heartbeat(worker, now) {
                    tracing::debug!("Heartbeat from unregistered worker {worker}");
                }
            }
            WorkerSignal::Close => {
                tracing::info!("Worker {worker} closed");
                self.drop_worker(worker, now, out);
            }
            WorkerSignal::Reply => {
                if self.pool.match_reply(worker, frame, now, out) {
                    self.drain_onto(worker, now, out);
                }
            }
        }
    }

    /// A worker connection went away without `CLOSE`.
    pub fn on_worker_disconnected(&mut self, worker: &Address, now: Instant, out: &mut impl Outbound) {
        if self.pool.is_tracked(worker) {
            tracing::warn!("Worker {worker} disconnected without CLOSE");
            self.drop_worker(worker, now, out);
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(client = %client)))]
    pub fn on_client_message(
        &mut self,
        client: &Address,
        frame: Bytes,
        now: Instant,
        out: &mut impl Outbound,
    ) {
        increment_requests();
        let request = Request::new(client.clone(), frame, now);
        let publisher = self.pool.publisher().cloned();
        let class = self.classifier.classify(&request, publisher.is_some());

        let dispatched = match class {
            RequestClass::Subscription => {
                self.pool
                    .dispatch(request, publisher.as_ref(), true, now, out)
            }
            RequestClass::Ordinary => self.pool.dispatch(request, None, false, now, out),
        };

        let request = match dispatched {
            Ok(_) => {
                increment_dispatched();
                return;
            }
            Err(NoWorkerAvailable(request)) => request,
        };

        let queue = match class {
            RequestClass::Subscription => &mut self.subscriptions,
            RequestClass::Ordinary => &mut self.ordinary,
        };
        match queue.push(request) {
            Ok(()) => {
                increment_queued();
                tracing::debug!("No worker available, {} queue at {}", queue.name(), queue.len());
            }
            Err(QueueFull(request)) => {
                increment_queue_rejections();
                tracing::warn!(
                    "{} queue full, rejecting {} from {client}",
                    queue.name(),
                    request.label()
                );
                out.to_client(client, Reply::ko(NO_WORKER_DETAIL).encode());
            }
        }
    }

    /// Forgets queued requests from a client that went away. Its in-flight
    /// request, if any, still runs; the reply is dropped on delivery.
    pub fn on_client_disconnected(&mut self, client: &Address) {
        let dropped = self.ordinary.remove_client(client) + self.subscriptions.remove_client(client);
        if dropped > 0 {
            tracing::debug!("Dropped {dropped} queued requests from departed client {client}");
        }
    }

    /// Heartbeat tick: fail stalled dispatches and stale queue entries, then
    /// ping every idle worker.
    pub fn on_tick(&mut self, now: Instant, out: &mut impl Outbound) {
        let timed_out = self.pool.purge_expired(now, out);
        increment_expired(timed_out);

        for queue in [&mut self.ordinary, &mut self.subscriptions] {
            let expired = queue.purge_expired(now);
            if expired.is_empty() {
                continue;
            }
            tracing::warn!("{} queued requests expired in {} queue", expired.len(), queue.name());
            increment_expired(expired.len());
            for request in expired {
                out.to_client(request.client(), Reply::ko(EXPIRED_DETAIL).encode());
            }
        }

        self.serve_publisher(now, out);
        self.pool.ping_ready(&self.ping, out);
    }

    /// Answers every queued and in-flight request with a shutdown `KO`.
    pub fn shutdown(&mut self, out: &mut impl Outbound) {
        let frame = Reply::ko(SHUTDOWN_DETAIL).encode();
        let pending = self
            .ordinary
            .drain()
            .chain(self.subscriptions.drain())
            .chain(self.pool.drain_pending());
        let mut count = 0usize;
        for request in pending {
            out.to_client(request.client(), frame.clone());
            count += 1;
        }
        if count > 0 {
            tracing::info!("Failed {count} pending requests on shutdown");
        }
    }

    fn drop_worker(&mut self, worker: &Address, now: Instant, out: &mut impl Outbound) {
        let Some(mut removed) = self.pool.remove(worker, now) else {
            return;
        };
        if let Some(request) = removed.take_pending() {
            out.to_client(request.client(), Reply::ko(EXPIRED_DETAIL).encode());
        }
        self.serve_publisher(now, out);
    }

    /// Gives an idle publisher the subscription work queued for its
    /// predecessor.
    fn serve_publisher(&mut self, now: Instant, out: &mut impl Outbound) {
        if let Some(publisher) = self.pool.publisher().cloned() {
            self.drain_onto(&publisher, now, out);
        }
    }

    /// Hands one queued request to `worker`, which just became idle.
    ///
    /// The publisher serves the subscription queue first. Expired entries met
    /// on the way are answered with `KO|Expired`.
    fn drain_onto(&mut self, worker: &Address, now: Instant, out: &mut impl Outbound) {
        if !self.pool.is_ready(worker) {
            return;
        }

        let is_publisher = self.pool.publisher() == Some(worker);
        let mut expired = Vec::new();
        let mut next = None;
        if is_publisher {
            next = self
                .subscriptions
                .pop_live(now, &mut expired)
                .map(|r| (r, RequestClass::Subscription));
        }
        if next.is_none() {
            next = self
                .ordinary
                .pop_live(now, &mut expired)
                .map(|r| (r, RequestClass::Ordinary));
        }

        if !expired.is_empty() {
            tracing::warn!("Skipped {} expired queued requests", expired.len());
            increment_expired(expired.len());
            for request in &expired {
                out.to_client(request.client(), Reply::ko(EXPIRED_DETAIL).encode());
            }
        }

        let Some((request, class)) = next else {
            return;
        };
        record_queue_wait(now.saturating_duration_since(request.received_at()));
        let affine = class == RequestClass::Subscription;
        match self.pool.dispatch(request, Some(worker), affine, now, out) {
            Ok(_) => increment_dispatched(),
            Err(NoWorkerAvailable(request)) => match class {
                RequestClass::Subscription => self.subscriptions.push_front(request),
                RequestClass::Ordinary => self.ordinary.push_front(request),
            },
        }
    }
}

/// Drives `router` until `token` is cancelled or every endpoint is gone.
///
/// On exit every pending request is answered with a shutdown `KO` and all
/// writers are released so connection tasks can flush and close.
pub async fn run_router(
    mut router: Router,
    mut events: mpsc::Receiver<(Side, LinkEvent)>,
    heartbeat: Duration,
    token: CancellationToken,
) {
    let mut links = Links::new();
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => router.on_tick(Instant::now(), &mut links),
            event = events.recv() => {
                let Some((side, event)) = event else {
                    break;
                };
                handle_event(&mut router, &mut links, side, event);
            }
        }
    }

    router.shutdown(&mut links);
    links.clear();
    tracing::info!("Router stopped");
}

fn handle_event(router: &mut Router, links: &mut Links, side: Side, event: LinkEvent) {
    let now = Instant::now();
    match (side, event) {
        (Side::Client, LinkEvent::Attached { address, writer }) => {
            links.attach_client(address, writer);
        }
        (Side::Worker, LinkEvent::Attached { address, writer }) => {
            tracing::info!("Worker {address} connected");
            links.attach_worker(address, writer);
        }
        (Side::Client, LinkEvent::Frame { address, frame }) => {
            router.on_client_message(&address, frame, now, links);
        }
        (Side::Worker, LinkEvent::Frame { address, frame }) => {
            router.on_worker_message(&address, frame, now, links);
        }
        (Side::Client, LinkEvent::Detached { address }) => {
            links.detach_client(&address);
            router.on_client_disconnected(&address);
        }
        (Side::Worker, LinkEvent::Detached { address }) => {
            router.on_worker_disconnected(&address, now, links);
            links.detach_worker(&address);
        }
    }
}
