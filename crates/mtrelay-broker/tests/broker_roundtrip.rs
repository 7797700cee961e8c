use core::time::Duration;
use futures::SinkExt;
use mtrelay_broker::{BrokerAddrs, BrokerConfig, BrokerService};
use mtrelay_client::{Client, ClientConfig, EventListener, EventPublisher, WorkerSession};
use mtrelay_core::{
    Error,
    wire::{self, Event, Reply, WorkerSignal},
};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

/// Room for connections to attach and announce before the next step.
const SETTLE: Duration = Duration::from_millis(150);

struct Broker {
    addrs: BrokerAddrs,
    token: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Broker {
    async fn start(config: BrokerConfig) -> Self {
        let service = BrokerService::bind(config).await.unwrap();
        let addrs = service.local_addrs().unwrap();
        let token = service.shutdown_token();
        let handle = tokio::spawn(service.run());
        Self {
            addrs,
            token,
            handle,
        }
    }

    fn client(&self, pool_size: usize) -> Client {
        Client::new(&self.client_config().with_pool_size(pool_size))
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_request_addr(self.addrs.client.to_string())
            .with_events_addr(self.addrs.client_events.to_string())
            .with_request_timeout(Duration::from_secs(5))
            .with_reconnect_backoff(Duration::from_millis(20), Duration::from_millis(200))
    }

    /// A worker that answers every request with its own name.
    fn named_worker(&self, name: &'static str, token: &CancellationToken) {
        let session = WorkerSession::new(self.addrs.worker.to_string(), name);
        tokio::spawn(session.run(
            move |request| async move { Reply::ok(request.request_id, name) },
            token.child_token(),
        ));
    }

    /// A worker that answers with the request payload.
    fn echo_worker(&self, token: &CancellationToken) {
        let session = WorkerSession::new(self.addrs.worker.to_string(), "echo");
        tokio::spawn(session.run(
            |request| async move { Reply::ok(request.request_id, request.payload) },
            token.child_token(),
        ));
    }

    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn fast_config() -> BrokerConfig {
    BrokerConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_liveness: 4,
        request_ttl: Duration::from_millis(300),
        ..BrokerConfig::loopback()
    }
}

fn remote_detail<T: core::fmt::Debug>(res: mtrelay_core::Result<T>) -> String {
    match res {
        Err(Error::Remote { detail }) => detail,
        other => panic!("expected a KO reply, got {other:?}"),
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn request_without_workers_expires_in_queue() {
    let broker = Broker::start(fast_config()).await;
    let client = broker.client(1);

    let started = tokio::time::Instant::now();
    let res = client.request("TIME", &[]).await;
    assert_eq!(remote_detail(res), "Expired");
    assert!(started.elapsed() < Duration::from_secs(2));

    client.shutdown();
    broker.stop().await;
}

#[tokio::test]
async fn one_worker_serves_requests_in_turn() {
    let broker = Broker::start(fast_config()).await;
    let workers = CancellationToken::new();
    broker.echo_worker(&workers);
    sleep(SETTLE).await;

    let client = broker.client(2);
    let (a, b) = tokio::join!(
        client.request("ECHO", &["first"]),
        client.request("ECHO", &["second", "part"])
    );
    assert_eq!(a.unwrap(), "first");
    assert_eq!(b.unwrap(), "second;part");

    workers.cancel();
    client.shutdown();
    broker.stop().await;
}

#[tokio::test]
async fn subscriptions_go_to_the_first_ready_worker() {
    let broker = Broker::start(fast_config()).await;
    let workers = CancellationToken::new();
    broker.named_worker("alpha", &workers);
    sleep(SETTLE).await;
    broker.named_worker("beta", &workers);
    sleep(SETTLE).await;

    let client = broker.client(1);
    for _ in 0..4 {
        let served_by = client.request("SUB_TICKS", &["EURUSD"]).await.unwrap();
        assert_eq!(served_by, "alpha");
    }
    let served_by = client.request("UNSUB_TICKS", &["EURUSD"]).await.unwrap();
    assert_eq!(served_by, "alpha");

    // Ordinary requests rotate over both workers.
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(client.request("TIME", &[]).await.unwrap());
    }
    assert!(seen.iter().any(|w| w == "alpha"));
    assert!(seen.iter().any(|w| w == "beta"));

    workers.cancel();
    client.shutdown();
    broker.stop().await;
}

#[tokio::test]
async fn silent_worker_is_evicted_and_never_served() {
    let broker = Broker::start(fast_config()).await;

    let mut silent = wire::connect(broker.addrs.worker, b"silent").await.unwrap();
    silent.send(WorkerSignal::Ready.frame().unwrap()).await.unwrap();
    // Well past the 200ms liveness window without answering a single PING.
    sleep(Duration::from_millis(500)).await;

    let client = broker.client(1);
    let res = client.request("TIME", &[]).await;
    assert_eq!(remote_detail(res), "Expired");

    // Everything the silent worker got was a heartbeat.
    while let Ok(Ok(Some(frame))) =
        tokio::time::timeout(Duration::from_millis(50), wire::recv(&mut silent)).await
    {
        assert_eq!(WorkerSignal::classify(&frame), WorkerSignal::Ping);
    }

    client.shutdown();
    broker.stop().await;
}

#[tokio::test]
async fn channel_recovers_after_a_timed_out_request() {
    let broker = Broker::start(BrokerConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_liveness: 10,
        request_ttl: Duration::from_secs(2),
        ..BrokerConfig::loopback()
    })
    .await;

    let workers = CancellationToken::new();
    let session = WorkerSession::new(broker.addrs.worker.to_string(), "slow-once");
    let mut calls = 0u32;
    tokio::spawn(session.run(
        move |request| {
            calls += 1;
            let slow = calls == 1;
            async move {
                if slow {
                    sleep(Duration::from_millis(400)).await;
                }
                Reply::ok(request.request_id, "done")
            }
        },
        workers.child_token(),
    ));
    sleep(SETTLE).await;

    let client = broker.client(1);
    let res = client
        .request_with_timeout("TIME", &[], Duration::from_millis(100))
        .await;
    assert_eq!(remote_detail(res), "Request expired");

    // The late reply to the first request must not leak into this one.
    let res = client.request("TIME", &[]).await;
    assert_eq!(res.unwrap(), "done");

    workers.cancel();
    client.shutdown();
    broker.stop().await;
}

#[tokio::test]
async fn queued_request_fails_on_shutdown() {
    let broker = Broker::start(BrokerConfig {
        request_ttl: Duration::from_secs(30),
        ..BrokerConfig::loopback()
    })
    .await;
    let client = broker.client(1);

    let token = broker.token.clone();
    tokio::spawn(async move {
        sleep(SETTLE).await;
        token.cancel();
    });
    let res = client.request("TIME", &[]).await;
    assert_eq!(remote_detail(res), "Service shutting down");

    client.shutdown();
    broker.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn events_reach_matching_listeners() {
    let broker = Broker::start(fast_config()).await;
    let listeners = CancellationToken::new();

    let (all_tx, mut all_rx) = mpsc::unbounded_channel();
    let all = EventListener::new(&broker.client_config());
    tokio::spawn(all.run(
        move |event: Event| {
            let tx = all_tx.clone();
            async move {
                let _ = tx.send(event);
            }
        },
        listeners.child_token(),
    ));

    let (eur_tx, mut eur_rx) = mpsc::unbounded_channel();
    let eur = EventListener::new(&broker.client_config()).with_prefixes(["EUR"]);
    tokio::spawn(eur.run(
        move |event: Event| {
            let tx = eur_tx.clone();
            async move {
                let _ = tx.send(event);
            }
        },
        listeners.child_token(),
    ));
    sleep(SETTLE).await;

    let mut publisher = EventPublisher::connect(&broker.addrs.worker_events.to_string(), "ticks")
        .await
        .unwrap();
    publisher
        .publish(&Event::new("GBPUSD", "1.27"))
        .await
        .unwrap();
    publisher
        .publish(&Event::new("EURUSD", "1.08"))
        .await
        .unwrap();

    let mut topics = vec![recv(&mut all_rx).await.topic, recv(&mut all_rx).await.topic];
    topics.sort();
    assert_eq!(topics, ["EURUSD", "GBPUSD"]);

    let eur_event = recv(&mut eur_rx).await;
    assert_eq!(eur_event.topic, "EURUSD");
    assert_eq!(eur_event.data_lossy(), "1.08");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), eur_rx.recv())
            .await
            .is_err()
    );

    listeners.cancel();
    broker.stop().await;
}
