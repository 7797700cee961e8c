//! Length-prefixed framing and the identity handshake.
//!
//! Every connection to the broker carries a sequence of frames:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The first frame sent by the connecting side is its identity. Everything
//! after that is protocol traffic for the endpoint it connected to.

use crate::{Error, Result, types::MAX_FRAME_LENGTH};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A framed connection.
pub type FrameStream<T = TcpStream> = Framed<T, LengthDelimitedCodec>;

/// The codec shared by every endpoint.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn framed<T>(io: T) -> FrameStream<T>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, frame_codec())
}

/// Connects to `addr` and announces `identity`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the connection or the handshake write fails.
pub async fn connect<A>(addr: A, identity: &[u8]) -> Result<FrameStream>
where
    A: ToSocketAddrs,
{
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut conn = framed(stream);
    conn.send(Bytes::copy_from_slice(identity)).await?;
    Ok(conn)
}

/// Reads the identity frame of a freshly accepted connection.
///
/// # Errors
///
/// Returns [`Error::Io`] if the peer disconnects or sends an oversized frame
/// before identifying itself.
pub async fn read_identity<T>(conn: &mut FrameStream<T>) -> Result<Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    recv(conn).await?.ok_or_else(|| Error::Io {
        context: "connection closed before handshake".to_string(),
    })
}

/// Receives the next frame, or `None` once the peer closed the connection.
///
/// # Errors
///
/// Returns [`Error::Io`] on a transport or framing failure.
pub async fn recv<T>(conn: &mut FrameStream<T>) -> Result<Option<Bytes>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match conn.next().await {
        Some(Ok(frame)) => Ok(Some(frame.freeze())),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}
