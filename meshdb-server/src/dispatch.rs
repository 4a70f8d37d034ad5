//! Per-connection message multiplexer.
//!
//! Outbound traffic has three shapes: `post` (fire-and-forget), `send`
//! (request that blocks until the matched reply or a timeout) and `reply`
//! (response reusing the request's sequence). Inbound frames are resolved
//! against the pending-request table first; everything else goes to the
//! handler registered for the message id.
//!
//! Sequences are u16, allocated modulo 2^16 and never zero, so a zero
//! sequence always means fire-and-forget. A reply is only matched when its
//! message id is the expected reply id of the pending request; an inbound
//! request that happens to reuse one of our outstanding sequence numbers is
//! therefore still dispatched as a request.
//!
//! All writes funnel through one channel into the connection's writer task,
//! which keeps outbound messages FIFO and atomic per message. When the
//! connection closes every pending `send` fails with `Closed` immediately.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::proto::{self, Frame};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type Handler = Arc<dyn Fn(Frame) -> HandlerFuture + Send + Sync>;

struct Pending {
    request_id: u32,
    tx: oneshot::Sender<Frame>,
}

pub struct Dispatcher {
    writer_tx: mpsc::Sender<Frame>,
    handlers: RwLock<HashMap<u32, Handler>>,
    pending: Mutex<HashMap<u16, Pending>>,
    seq: AtomicU16,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(writer_tx: mpsc::Sender<Frame>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            writer_tx,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Register a handler for a message id. Idempotent: the first
    /// registration wins.
    pub fn register(&self, id: u32, handler: Handler) {
        self.handlers.write().entry(id).or_insert(handler);
    }

    fn next_seq(&self) -> u16 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.writer_tx.send(frame).await.map_err(|_| Error::Closed)
    }

    /// Fire-and-forget send.
    pub async fn post(&self, id: u32, payload: Bytes) -> Result<()> {
        self.write(Frame::new(id, 0, payload)).await
    }

    /// Server-side response, reusing the incoming sequence.
    pub async fn reply(&self, id: u32, seq: u16, payload: Bytes) -> Result<()> {
        self.write(Frame::new(id, seq, payload)).await
    }

    /// Request/response. Allocates a fresh sequence and blocks until the
    /// matched reply arrives, the timeout lapses, or the connection closes.
    pub async fn send(&self, id: u32, payload: Bytes, timeout: Duration) -> Result<Frame> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            pending.insert(seq, Pending { request_id: id, tx });
        }

        if let Err(e) = self.write(Frame::new(id, seq, payload)).await {
            self.pending.lock().remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.pending.lock().remove(&seq);
                Err(Error::Timeout)
            }
        }
    }

    /// Route one inbound frame: resolve a matching pending request, or
    /// invoke the registered handler on this task.
    pub async fn dispatch(&self, frame: Frame) -> Result<()> {
        if frame.seq != 0 {
            let resolved = {
                let mut pending = self.pending.lock();
                let matches = pending
                    .get(&frame.seq)
                    .is_some_and(|p| proto::reply_id(p.request_id) == Some(frame.id));
                if matches { pending.remove(&frame.seq) } else { None }
            };
            if let Some(p) = resolved {
                let _ = p.tx.send(frame);
                return Ok(());
            }
        }

        let handler = self.handlers.read().get(&frame.id).cloned();
        match handler {
            Some(handler) => handler(frame).await,
            None => {
                tracing::warn!(id = frame.id, name = proto::msg_name(frame.id), "no handler for message");
                Ok(())
            }
        }
    }

    /// Tear the dispatcher down: all pending sends fail with `Closed` and
    /// later posts/sends are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the oneshot senders wakes every waiter with `Closed`.
        self.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{P2P_LOG_DATA, P2P_LOG_STATE, P2P_TOPOSYNC};

    fn dispatcher() -> (Arc<Dispatcher>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        (Dispatcher::new(tx), rx)
    }

    #[tokio::test]
    async fn send_resolves_on_matching_reply() {
        let (d, mut wire) = dispatcher();

        let d2 = d.clone();
        let sender = tokio::spawn(async move {
            d2.send(P2P_LOG_STATE, Bytes::from_static(b"{}"), Duration::from_secs(5)).await
        });

        let request = wire.recv().await.unwrap();
        assert_eq!(request.id, P2P_LOG_STATE);
        assert_ne!(request.seq, 0);

        d.dispatch(Frame::new(P2P_LOG_DATA, request.seq, Bytes::from_static(b"{\"E\":[]}")))
            .await
            .unwrap();

        let reply = sender.await.unwrap().unwrap();
        assert_eq!(reply.id, P2P_LOG_DATA);
    }

    #[tokio::test]
    async fn mismatched_reply_id_is_dispatched_as_request() {
        let (d, mut wire) = dispatcher();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let record: Handler = Arc::new(move |frame: Frame| {
            let s = s.clone();
            Box::pin(async move {
                s.lock().push(frame.seq);
                Ok(())
            })
        });
        d.register(P2P_LOG_STATE, record);

        let d2 = d.clone();
        let sender = tokio::spawn(async move {
            d2.send(P2P_TOPOSYNC, Bytes::from_static(b"{}"), Duration::from_millis(200)).await
        });
        let request = wire.recv().await.unwrap();

        // An inbound *request* reusing our outstanding sequence must not be
        // mistaken for the reply.
        d.dispatch(Frame::new(P2P_LOG_STATE, request.seq, Bytes::from_static(b"{}")))
            .await
            .unwrap();
        assert_eq!(seen.lock().as_slice(), &[request.seq]);

        assert!(matches!(sender.await.unwrap(), Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn send_after_close_fails_closed_not_timeout() {
        let (d, _wire) = dispatcher();
        d.close();
        let err = d
            .send(P2P_LOG_STATE, Bytes::new(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn close_releases_pending_sends() {
        let (d, mut wire) = dispatcher();

        let d2 = d.clone();
        let sender = tokio::spawn(async move {
            d2.send(P2P_LOG_STATE, Bytes::new(), Duration::from_secs(30)).await
        });
        let _request = wire.recv().await.unwrap();

        d.close();
        assert!(matches!(sender.await.unwrap(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn sequences_skip_zero() {
        let (d, _wire) = dispatcher();
        for _ in 0..70_000 {
            assert_ne!(d.next_seq(), 0);
        }
    }
}
