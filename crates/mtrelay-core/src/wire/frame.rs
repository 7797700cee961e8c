//! Text frame grammar.
//!
//! Every payload exchanged through the broker is a single frame whose content
//! follows one of the shapes below:
//!
//! ```text
//! client -> broker   {action};{requestId};{payload}
//! broker -> client   {OK|KO};{requestId};{payload}   (worker replies)
//!                    KO|{detail}                     (broker-generated)
//! worker -> broker   READY | PING | CLOSE | <reply>
//! broker -> worker   <client request, verbatim> | PING
//! publisher          {TOPIC} {data}
//! subscriber         0x01{prefix} | 0x00{prefix}
//! ```
//!
//! The request id is a diagnostic label only. Routing never looks at it.

use crate::{
    Error, Result,
    types::{CLOSE, FIELD_SEPARATOR, KO, OK, PING, READY, STATUS_SEPARATOR},
};
use bytes::{BufMut, Bytes, BytesMut};
use core::fmt;

/// Returns the bytes of `frame` before the first `;`, or the whole frame.
///
/// This is the action of a client request and the control token of a worker
/// message. It never allocates or validates UTF-8.
pub fn leading_token(frame: &[u8]) -> &[u8] {
    match frame.iter().position(|b| *b == FIELD_SEPARATOR as u8) {
        Some(end) => &frame[..end],
        None => frame,
    }
}

/// A client request: `{action};{requestId};{payload}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub action: String,
    pub request_id: String,
    pub payload: String,
}

impl RequestFrame {
    pub fn new(
        action: impl Into<String>,
        request_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            request_id: request_id.into(),
            payload: payload.into(),
        }
    }

    /// Parses a request frame. Missing trailing fields decode as empty
    /// strings; the payload keeps any further `;` separators.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] if the frame is not UTF-8 or the action
    /// is empty.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let text = core::str::from_utf8(frame).map_err(|e| Error::InvalidFrame {
            reason: format!("request is not UTF-8: {e}"),
        })?;
        let mut parts = text.splitn(3, FIELD_SEPARATOR);
        let action = parts.next().unwrap_or_default();
        if action.is_empty() {
            return Err(Error::InvalidFrame {
                reason: "request has no action".to_string(),
            });
        }

        Ok(Self {
            action: action.to_string(),
            request_id: parts.next().unwrap_or_default().to_string(),
            payload: parts.next().unwrap_or_default().to_string(),
        })
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.action,
            self.request_id,
            self.payload,
            sep = FIELD_SEPARATOR
        )
    }
}

/// Outcome token of a [`Reply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Ko,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => OK,
            Self::Ko => KO,
        }
    }
}

/// A reply as seen by a client.
///
/// Worker replies carry the request id (`OK;{id};{payload}`). Replies
/// generated by the broker or the client pool itself do not
/// (`KO|{detail}`), so `request_id` is `None` for those.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub request_id: Option<String>,
    pub payload: String,
}

impl Reply {
    /// A broker-generated failure reply.
    pub fn ko(detail: impl Into<String>) -> Self {
        Self {
            status: Status::Ko,
            request_id: None,
            payload: detail.into(),
        }
    }

    /// A worker-style success reply.
    pub fn ok(request_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            request_id: Some(request_id.into()),
            payload: payload.into(),
        }
    }

    /// Parses a reply frame.
    ///
    /// The status is everything before the first `;` or `|`. After `|` the
    /// rest is the payload; after `;` the next field is the request id and the
    /// rest is the payload. Any status other than `OK` is a failure.
    pub fn parse(frame: &[u8]) -> Self {
        let text = String::from_utf8_lossy(frame);
        let split = text.find([FIELD_SEPARATOR, STATUS_SEPARATOR]);

        let (status, rest) = match split {
            Some(at) => (&text[..at], Some((text.as_bytes()[at], &text[at + 1..]))),
            None => (&text[..], None),
        };
        let status = if status == OK { Status::Ok } else { Status::Ko };

        match rest {
            None => Self {
                status,
                request_id: None,
                payload: String::new(),
            },
            Some((sep, rest)) if sep == STATUS_SEPARATOR as u8 => Self {
                status,
                request_id: None,
                payload: rest.to_string(),
            },
            Some((_, rest)) => {
                let mut parts = rest.splitn(2, FIELD_SEPARATOR);
                Self {
                    status,
                    request_id: parts.next().map(str::to_string),
                    payload: parts.next().unwrap_or_default().to_string(),
                }
            }
        }
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self.status, Status::Ok)
    }

    /// Converts the reply into the caller-facing result: the payload on `OK`,
    /// [`Error::Remote`] carrying the payload on `KO`.
    pub fn into_result(self) -> Result<String> {
        match self.status {
            Status::Ok => Ok(self.payload),
            Status::Ko => Err(Error::Remote {
                detail: self.payload,
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request_id {
            Some(id) => write!(
                f,
                "{}{sep}{}{sep}{}",
                self.status.as_str(),
                id,
                self.payload,
                sep = FIELD_SEPARATOR
            ),
            None => write!(
                f,
                "{}{}{}",
                self.status.as_str(),
                STATUS_SEPARATOR,
                self.payload
            ),
        }
    }
}

/// Classification of a frame received on the worker endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerSignal {
    Ready,
    Ping,
    Close,
    /// Anything else: the reply to the worker's in-flight request.
    Reply,
}

impl WorkerSignal {
    pub fn classify(frame: &[u8]) -> Self {
        match leading_token(frame) {
            t if t == READY.as_bytes() => Self::Ready,
            t if t == PING.as_bytes() => Self::Ping,
            t if t == CLOSE.as_bytes() => Self::Close,
            _ => Self::Reply,
        }
    }

    /// The frame a worker or broker sends for a control signal.
    pub fn frame(self) -> Option<Bytes> {
        match self {
            Self::Ready => Some(Bytes::from_static(READY.as_bytes())),
            Self::Ping => Some(Bytes::from_static(PING.as_bytes())),
            Self::Close => Some(Bytes::from_static(CLOSE.as_bytes())),
            Self::Reply => None,
        }
    }
}

/// A published event: `{TOPIC} {data}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    pub data: Bytes,
}

impl Event {
    pub fn new(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }

    /// Splits a published frame at its first space. A frame without a space is
    /// a topic with empty data.
    pub fn parse(frame: Bytes) -> Self {
        match frame.iter().position(|b| *b == b' ') {
            Some(at) => Self {
                topic: String::from_utf8_lossy(&frame[..at]).into_owned(),
                data: frame.slice(at + 1..),
            },
            None => Self {
                topic: String::from_utf8_lossy(&frame).into_owned(),
                data: Bytes::new(),
            },
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.topic.len() + 1 + self.data.len());
        buf.put_slice(self.topic.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// The data interpreted as UTF-8, replacing invalid sequences.
    pub fn data_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// A subscriber's control frame on the client-events endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subscription {
    Subscribe(Bytes),
    Unsubscribe(Bytes),
}

impl Subscription {
    const SUBSCRIBE: u8 = 0x01;
    const UNSUBSCRIBE: u8 = 0x00;

    /// Subscribe to every topic.
    pub const fn all() -> Self {
        Self::Subscribe(Bytes::new())
    }

    pub fn encode(&self) -> Bytes {
        let (tag, prefix) = match self {
            Self::Subscribe(prefix) => (Self::SUBSCRIBE, prefix),
            Self::Unsubscribe(prefix) => (Self::UNSUBSCRIBE, prefix),
        };
        let mut buf = BytesMut::with_capacity(prefix.len() + 1);
        buf.put_u8(tag);
        buf.put_slice(prefix);
        buf.freeze()
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] for an empty frame or an unknown tag.
    pub fn decode(frame: Bytes) -> Result<Self> {
        match frame.first() {
            Some(&Self::SUBSCRIBE) => Ok(Self::Subscribe(frame.slice(1..))),
            Some(&Self::UNSUBSCRIBE) => Ok(Self::Unsubscribe(frame.slice(1..))),
            Some(tag) => Err(Error::InvalidFrame {
                reason: format!("unknown subscription tag {tag:#04x}"),
            }),
            None => Err(Error::InvalidFrame {
                reason: "empty subscription frame".to_string(),
            }),
        }
    }
}
