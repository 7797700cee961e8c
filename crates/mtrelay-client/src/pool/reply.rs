use bytes::Bytes;
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use mtrelay_core::{
    types::{REQUEST_EXPIRED_DETAIL, SHUTDOWN_DETAIL},
    wire::Reply,
};
use pin_project_lite::pin_project;
use tokio::{
    sync::oneshot,
    time::{Instant, Sleep, sleep_until},
};

/// One submitted request, owned by exactly one channel until resolved.
#[derive(Debug)]
pub(crate) struct Slot {
    pub frame: Bytes,
    pub deadline: Instant,
    reply: oneshot::Sender<String>,
}

impl Slot {
    pub fn new(frame: Bytes, deadline: Instant) -> (Self, PendingReply) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                frame,
                deadline,
                reply,
            },
            PendingReply {
                rx,
                expiry: sleep_until(deadline),
            },
        )
    }

    /// The submitter dropped its [`PendingReply`].
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub fn resolve(self, reply: String) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(reply);
    }
}

pin_project! {
    /// The raw reply to a submitted request.
    ///
    /// Always resolves: to the worker's reply, to a broker-generated `KO`, or
    /// to a client-side `KO` when the deadline passed or the pool shut down.
    /// The deadline holds even while the request is still queued behind busy
    /// or reconnecting channels; a request still queued at that point is
    /// never sent.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct PendingReply {
        #[pin]
        rx: oneshot::Receiver<String>,
        #[pin]
        expiry: Sleep,
    }
}

impl Future for PendingReply {
    type Output = String;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.rx.as_mut().poll(cx) {
            Poll::Ready(Ok(reply)) => return Poll::Ready(reply),
            Poll::Ready(Err(_)) => return Poll::Ready(Reply::ko(SHUTDOWN_DETAIL).to_string()),
            Poll::Pending => {}
        }

        match this.expiry.poll(cx) {
            Poll::Ready(()) => {
                let rx = this.rx.get_mut();
                rx.close();
                // A reply that raced the deadline still wins.
                Poll::Ready(
                    rx.try_recv()
                        .unwrap_or_else(|_| Reply::ko(REQUEST_EXPIRED_DETAIL).to_string()),
                )
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
