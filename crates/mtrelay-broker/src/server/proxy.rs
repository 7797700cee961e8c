//! Event proxy: fans published events out to subscribers.
//!
//! Workers connect to the publisher endpoint and send `{TOPIC} {data}` frames.
//! Clients connect to the subscriber endpoint, send subscription control
//! frames, and receive every published frame that starts with one of their
//! prefixes. Delivery is at-most-once: a subscriber whose write buffer is full
//! misses the frame, and nothing is replayed.
//!
//! The proxy shares no state with the router.

use crate::server::{
    service::connection::LinkEvent,
    telemetry::{increment_events_forwarded, increment_frames_dropped},
};
use bytes::Bytes;
use core::fmt;
use mtrelay_core::{Address, wire::Subscription};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which proxy endpoint a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxySide {
    Publisher,
    Subscriber,
}

impl fmt::Display for ProxySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        })
    }
}

struct Subscriber {
    writer: mpsc::Sender<Bytes>,
    prefixes: Vec<Bytes>,
}

impl Subscriber {
    fn wants(&self, frame: &[u8]) -> bool {
        self.prefixes.iter().any(|p| frame.starts_with(p))
    }
}

/// Subscriber table of the proxy.
#[derive(Default)]
pub struct EventProxy {
    subscribers: HashMap<Address, Subscriber>,
}

impl EventProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn handle(&mut self, side: ProxySide, event: LinkEvent) {
        match (side, event) {
            (ProxySide::Subscriber, LinkEvent::Attached { address, writer }) => {
                tracing::debug!("Subscriber {address} attached");
                self.subscribers.insert(
                    address,
                    Subscriber {
                        writer,
                        prefixes: Vec::new(),
                    },
                );
            }
            (ProxySide::Subscriber, LinkEvent::Frame { address, frame }) => {
                self.subscription(&address, frame);
            }
            (ProxySide::Subscriber, LinkEvent::Detached { address }) => {
                self.subscribers.remove(&address);
            }
            (ProxySide::Publisher, LinkEvent::Frame { frame, .. }) => {
                self.publish(&frame);
            }
            (ProxySide::Publisher, LinkEvent::Attached { address, .. }) => {
                tracing::info!("Publisher {address} attached");
            }
            (ProxySide::Publisher, LinkEvent::Detached { address }) => {
                tracing::info!("Publisher {address} detached");
            }
        }
    }

    fn subscription(&mut self, address: &Address, frame: Bytes) {
        let Some(subscriber) = self.subscribers.get_mut(address) else {
            return;
        };
        match Subscription::decode(frame) {
            Ok(Subscription::Subscribe(prefix)) => {
                if !subscriber.prefixes.contains(&prefix) {
                    subscriber.prefixes.push(prefix);
                }
            }
            Ok(Subscription::Unsubscribe(prefix)) => {
                subscriber.prefixes.retain(|p| *p != prefix);
            }
            Err(e) => tracing::warn!("Subscriber {address}: {e}"),
        }
    }

    /// Forwards `frame` to every interested subscriber without waiting.
    /// Returns the number of subscribers reached.
    pub fn publish(&mut self, frame: &Bytes) -> usize {
        let mut delivered = 0;
        for (address, subscriber) in &self.subscribers {
            if !subscriber.wants(frame) {
                continue;
            }
            match subscriber.writer.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Subscriber {address} is slow, dropping event");
                    increment_frames_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        increment_events_forwarded(delivered);
        delivered
    }
}

/// Runs the proxy until `token` is cancelled or both endpoints are gone.
pub async fn run_proxy(
    mut events: mpsc::Receiver<(ProxySide, LinkEvent)>,
    token: CancellationToken,
) {
    let mut proxy = EventProxy::new();
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            event = events.recv() => match event {
                Some((side, event)) => proxy.handle(side, event),
                None => break,
            },
        }
    }
    tracing::info!(
        "Event proxy stopped with {} subscribers",
        proxy.subscriber_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(proxy: &mut EventProxy, conn: u64) -> (Address, mpsc::Receiver<Bytes>) {
        let address = Address::new("listener", conn);
        let (writer, rx) = mpsc::channel(2);
        proxy.handle(
            ProxySide::Subscriber,
            LinkEvent::Attached {
                address: address.clone(),
                writer,
            },
        );
        (address, rx)
    }

    fn control(proxy: &mut EventProxy, address: &Address, sub: Subscription) {
        proxy.handle(
            ProxySide::Subscriber,
            LinkEvent::Frame {
                address: address.clone(),
                frame: sub.encode(),
            },
        );
    }

    #[test]
    fn forwards_by_prefix() {
        let mut proxy = EventProxy::new();
        let (all, mut all_rx) = attach(&mut proxy, 1);
        let (bars, mut bars_rx) = attach(&mut proxy, 2);
        control(&mut proxy, &all, Subscription::all());
        control(&mut proxy, &bars, Subscription::Subscribe(Bytes::from_static(b"BARS")));

        assert_eq!(proxy.publish(&Bytes::from_static(b"QUOTES EURUSD 1.1")), 1);
        assert_eq!(proxy.publish(&Bytes::from_static(b"BARS EURUSD M5")), 2);

        assert_eq!(all_rx.try_recv().unwrap(), "QUOTES EURUSD 1.1");
        assert_eq!(all_rx.try_recv().unwrap(), "BARS EURUSD M5");
        assert_eq!(bars_rx.try_recv().unwrap(), "BARS EURUSD M5");
        assert!(bars_rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribed_and_slow_subscribers_miss_events() {
        let mut proxy = EventProxy::new();
        let (a, mut a_rx) = attach(&mut proxy, 1);
        control(&mut proxy, &a, Subscription::all());

        for _ in 0..3 {
            proxy.publish(&Bytes::from_static(b"TRADES x"));
        }
        // Buffer of two: the third event was dropped, not queued.
        assert!(a_rx.try_recv().is_ok());
        assert!(a_rx.try_recv().is_ok());
        assert!(a_rx.try_recv().is_err());

        control(&mut proxy, &a, Subscription::Unsubscribe(Bytes::new()));
        assert_eq!(proxy.publish(&Bytes::from_static(b"TRADES y")), 0);
    }

    #[test]
    fn detached_subscriber_is_forgotten() {
        let mut proxy = EventProxy::new();
        let (a, _rx) = attach(&mut proxy, 1);
        control(&mut proxy, &a, Subscription::all());
        proxy.handle(ProxySide::Subscriber, LinkEvent::Detached { address: a });
        assert_eq!(proxy.subscriber_count(), 0);
        assert_eq!(proxy.publish(&Bytes::from_static(b"REFRESH")), 0);
    }
}
