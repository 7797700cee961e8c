//! Client event listener.
//!
//! Connects to the broker's subscriber endpoint, subscribes to every topic and
//! hands each published event to a callback. Each callback runs in its own
//! task: events are received in publish order, callbacks may finish in any
//! order, and a panicking callback only loses its own event.

use crate::config::ClientConfig;
use core::{future::Future, panic::AssertUnwindSafe};
use futures::{FutureExt, SinkExt};
use mtrelay_core::{
    Error, Result,
    wire::{self, Event, Subscription},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identity announced by listener connections.
pub const LISTENER_IDENTITY: &[u8] = b"EventListener";

pub struct EventListener {
    addr: String,
    prefixes: Vec<String>,
}

impl EventListener {
    /// A listener for every topic.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            addr: config.events_addr.clone(),
            prefixes: vec![String::new()],
        }
    }

    /// Restricts delivery to topics starting with one of `prefixes`.
    #[must_use]
    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Receives events until `token` is cancelled, calling `callback` for
    /// each one without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the connection cannot be established or is
    /// lost. The loop does not reconnect by itself; the owner decides whether
    /// to run it again.
    pub async fn run<F, Fut>(self, callback: F, token: CancellationToken) -> Result<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut conn = wire::connect(self.addr.as_str(), LISTENER_IDENTITY).await?;
        for prefix in &self.prefixes {
            let subscription = Subscription::Subscribe(prefix.clone().into());
            conn.send(subscription.encode()).await?;
        }
        tracing::info!("Listening for events on {}", self.addr);

        let callback = Arc::new(callback);
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => return Ok(()),
                frame = wire::recv(&mut conn) => frame?,
            };
            let Some(frame) = frame else {
                return Err(Error::Io {
                    context: "event connection closed by broker".to_string(),
                });
            };

            let event = Event::parse(frame);
            let callback = Arc::clone(&callback);
            tokio::spawn(async move {
                let topic = event.topic.clone();
                let handled = AssertUnwindSafe(async move { callback(event).await })
                    .catch_unwind()
                    .await;
                if handled.is_err() {
                    tracing::error!("Event callback for {topic} panicked");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use mtrelay_core::wire::FrameStream;
    use tokio::{net::TcpListener, sync::mpsc, time::timeout};

    /// Accepts the listener's connection and consumes its handshake and
    /// subscription frames.
    async fn accept_listener(server: &TcpListener) -> FrameStream {
        let (stream, _) = server.accept().await.unwrap();
        let mut conn = wire::framed(stream);
        assert_eq!(wire::read_identity(&mut conn).await.unwrap(), LISTENER_IDENTITY);
        let subscription = wire::recv(&mut conn).await.unwrap().unwrap();
        assert_eq!(Subscription::decode(subscription).unwrap(), Subscription::all());
        conn
    }

    fn topics() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_delivery() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig::default().with_events_addr(server.local_addr().unwrap().to_string());
        let (tx, mut rx) = topics();
        let token = CancellationToken::new();

        let listener = tokio::spawn(EventListener::new(&config).run(
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    assert_ne!(event.topic, "BROKEN", "callback failure");
                    let _ = tx.send(event.topic);
                }
            },
            token.clone(),
        ));

        let mut conn = accept_listener(&server).await;
        conn.send(Event::new("BROKEN", "1").encode()).await.unwrap();
        conn.send(Event::new("EURUSD", "1.08").encode()).await.unwrap();

        let topic = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(topic.as_deref(), Some("EURUSD"));
        assert!(!listener.is_finished());

        token.cancel();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_callback_does_not_hold_back_later_events() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig::default().with_events_addr(server.local_addr().unwrap().to_string());
        let (tx, mut rx) = topics();
        let token = CancellationToken::new();

        let listener = tokio::spawn(EventListener::new(&config).run(
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    if event.topic == "SLOW" {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    let _ = tx.send(event.topic);
                }
            },
            token.clone(),
        ));

        let mut conn = accept_listener(&server).await;
        conn.send(Event::new("SLOW", "1").encode()).await.unwrap();
        conn.send(Event::new("FAST", "2").encode()).await.unwrap();

        let topic = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(topic.as_deref(), Some("FAST"));

        token.cancel();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lost_connection_ends_the_listener_with_an_error() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig::default().with_events_addr(server.local_addr().unwrap().to_string());

        let listener = tokio::spawn(
            EventListener::new(&config).run(|_: Event| async {}, CancellationToken::new()),
        );
        drop(accept_listener(&server).await);

        let res = timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
        assert!(matches!(res, Err(Error::Io { .. })));
    }
}
