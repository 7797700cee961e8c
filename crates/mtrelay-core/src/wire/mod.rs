//! Wire protocol: the text frame grammar and its length-prefixed transport.
//!
//! - [`frame`] - Request, reply, worker signal, event and subscription frames.
//! - [`codec`] - Frame codec, connect helper and identity handshake.

pub mod codec;
pub mod frame;

pub use codec::{FrameStream, connect, frame_codec, framed, read_identity, recv};
pub use frame::{Event, Reply, RequestFrame, Status, Subscription, WorkerSignal, leading_token};
