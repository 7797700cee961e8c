//! Requests as tracked by the router.

use bytes::Bytes;
use mtrelay_core::{Address, wire::leading_token};
use tokio::time::Instant;

/// A client request travelling through the broker.
///
/// The frame is forwarded to a worker verbatim. The originating client
/// connection is kept so the reply (or a synthetic `KO`) can be routed back.
#[derive(Clone, Debug)]
pub struct Request {
    client: Address,
    frame: Bytes,
    received_at: Instant,
}

impl Request {
    pub const fn new(client: Address, frame: Bytes, received_at: Instant) -> Self {
        Self {
            client,
            frame,
            received_at,
        }
    }

    pub const fn client(&self) -> &Address {
        &self.client
    }

    pub const fn frame(&self) -> &Bytes {
        &self.frame
    }

    pub const fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The requested action name, e.g. `TIME` or `SUB_BARS`.
    pub fn action(&self) -> &[u8] {
        leading_token(&self.frame)
    }

    /// `action;requestId` for log lines.
    pub fn label(&self) -> String {
        let mut fields = self.frame.splitn(3, |b| *b == b';');
        let action = String::from_utf8_lossy(fields.next().unwrap_or_default());
        let id = String::from_utf8_lossy(fields.next().unwrap_or_default());
        format!("{action};{id}")
    }
}

/// Routing class of a client request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestClass {
    /// Served by any ready worker.
    Ordinary,
    /// Subscribe/unsubscribe command pinned to the publisher worker.
    Subscription,
}

/// Decides which class a request belongs to from its action name.
#[derive(Clone, Debug)]
pub struct Classifier {
    prefixes: Vec<Bytes>,
}

impl Classifier {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .filter(|p| !p.as_ref().is_empty())
                .map(|p| Bytes::copy_from_slice(p.as_ref().as_bytes()))
                .collect(),
        }
    }

    /// A request is subscription-affine when its action starts with one of
    /// the configured markers and a publisher worker is designated.
    pub fn classify(&self, request: &Request, publisher_designated: bool) -> RequestClass {
        let action = request.action();
        if publisher_designated && self.prefixes.iter().any(|p| action.starts_with(p)) {
            RequestClass::Subscription
        } else {
            RequestClass::Ordinary
        }
    }
}
