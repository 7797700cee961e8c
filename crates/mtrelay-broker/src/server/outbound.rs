//! Outbound side of the router: frames addressed to connected peers.
//!
//! The [`Outbound`] trait is the seam between routing decisions and the
//! transport. [`Links`] is the production implementation: a table of the
//! per-connection writer channels, owned by the router loop.

use crate::server::telemetry::increment_frames_dropped;
use bytes::Bytes;
use mtrelay_core::Address;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Destination for frames produced by routing decisions.
///
/// Sends never block and never fail the caller: a frame for a connection that
/// is gone or congested is dropped and logged.
pub trait Outbound {
    fn to_worker(&mut self, worker: &Address, frame: Bytes);
    fn to_client(&mut self, client: &Address, frame: Bytes);
}

/// Writer channels of every live client and worker connection.
#[derive(Default)]
pub struct Links {
    clients: HashMap<Address, mpsc::Sender<Bytes>>,
    workers: HashMap<Address, mpsc::Sender<Bytes>>,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_client(&mut self, address: Address, writer: mpsc::Sender<Bytes>) {
        self.clients.insert(address, writer);
    }

    pub fn attach_worker(&mut self, address: Address, writer: mpsc::Sender<Bytes>) {
        self.workers.insert(address, writer);
    }

    pub fn detach_client(&mut self, address: &Address) {
        self.clients.remove(address);
    }

    pub fn detach_worker(&mut self, address: &Address) {
        self.workers.remove(address);
    }

    /// Drops every writer so the connection tasks can flush and exit.
    pub fn clear(&mut self) {
        self.clients.clear();
        self.workers.clear();
    }

    fn send(
        table: &HashMap<Address, mpsc::Sender<Bytes>>,
        kind: &str,
        address: &Address,
        frame: Bytes,
    ) {
        let Some(writer) = table.get(address) else {
            tracing::debug!("Dropping frame for disconnected {kind} {address}");
            increment_frames_dropped();
            return;
        };

        match writer.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Write buffer full for {kind} {address}, dropping frame");
                increment_frames_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Writer closed for {kind} {address}, dropping frame");
                increment_frames_dropped();
            }
        }
    }
}

impl Outbound for Links {
    fn to_worker(&mut self, worker: &Address, frame: Bytes) {
        Self::send(&self.workers, "worker", worker, frame);
    }

    fn to_client(&mut self, client: &Address, frame: Bytes) {
        Self::send(&self.clients, "client", client, frame);
    }
}

/// Records every frame instead of sending it.
#[cfg(test)]
#[derive(Default, Debug)]
pub struct Recorder {
    pub workers: Vec<(Address, Bytes)>,
    pub clients: Vec<(Address, Bytes)>,
}

#[cfg(test)]
impl Outbound for Recorder {
    fn to_worker(&mut self, worker: &Address, frame: Bytes) {
        self.workers.push((worker.clone(), frame));
    }

    fn to_client(&mut self, client: &Address, frame: Bytes) {
        self.clients.push((client.clone(), frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_connection_not_identity() {
        let mut links = Links::new();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        let old = Address::new("Client-0", 1);
        let new = Address::new("Client-0", 2);

        links.attach_client(old.clone(), old_tx);
        links.attach_client(new.clone(), new_tx);
        links.detach_client(&old);

        links.to_client(&old, Bytes::from_static(b"KO|Expired"));
        links.to_client(&new, Bytes::from_static(b"OK;id;1"));

        assert_eq!(new_rx.recv().await.unwrap(), "OK;id;1");
        assert!(old_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_writer_drops_instead_of_blocking() {
        let mut links = Links::new();
        let (tx, mut rx) = mpsc::channel(1);
        let worker = Address::new("w", 1);
        links.attach_worker(worker.clone(), tx);

        links.to_worker(&worker, Bytes::from_static(b"PING"));
        links.to_worker(&worker, Bytes::from_static(b"PING"));

        assert_eq!(rx.recv().await.unwrap(), "PING");
        assert!(rx.try_recv().is_err());
    }
}
