//! Connection manager: listener, outbound dials and socket options.
//!
//! One listener accepts inbound peers; every configured seed address gets
//! a dial task that reconnects with capped exponential backoff plus jitter
//! and goes quiet while a live session to that address exists (for example
//! because the remote dialed us first and won the tie-break). Keepalive is
//! applied to every socket so a dead peer is noticed even when the link
//! is idle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::core::CoreCtx;
use crate::error::Result;
use crate::peer::{Direction, PeerSession};

/// TCP keepalive knobs: probe after `idle`, every `interval`, give up
/// after `count` failed probes.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { idle: Duration::from_secs(30), interval: Duration::from_secs(5), count: 3 }
    }
}

const DIAL_BACKOFF_START: Duration = Duration::from_secs(1);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct ConnMan {
    ctx: Arc<CoreCtx>,
    keepalive: KeepaliveConfig,
    active: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnMan {
    pub fn new(ctx: Arc<CoreCtx>, keepalive: KeepaliveConfig) -> ConnMan {
        ConnMan {
            ctx,
            keepalive,
            active: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the listener and start accepting peers. Returns the actual
    /// bound address (relevant when the configured port is 0).
    pub async fn bind(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let ctx = self.ctx.clone();
        let keepalive = self.keepalive;
        let active = self.active.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if !active.load(Ordering::Acquire) {
                            break;
                        }
                        tracing::debug!(%peer, "inbound connection");
                        apply_socket_options(&stream, &keepalive);
                        let _ = PeerSession::spawn(stream, Direction::Inbound, ctx.clone());
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));

        Ok(local)
    }

    /// Keep a session to `addr` alive: dial, drive the session until it
    /// drops, back off, redial.
    pub fn connect(&self, addr: String) {
        let ctx = self.ctx.clone();
        let keepalive = self.keepalive;
        let active = self.active.clone();

        self.tasks.lock().push(tokio::spawn(async move {
            let mut backoff = DIAL_BACKOFF_START;

            while active.load(Ordering::Acquire) {
                // The remote may have dialed us first and won the
                // tie-break; don't stack a second session on top.
                let connected = ctx
                    .registry
                    .uuid_for_addr(&addr)
                    .and_then(|uuid| ctx.registry.get(uuid))
                    .is_some_and(|s| !s.is_closed());
                if connected {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
                    continue;
                }

                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        backoff = DIAL_BACKOFF_START;
                        tracing::info!(%addr, "outbound connection established");
                        apply_socket_options(&stream, &keepalive);
                        let (_session, handle) =
                            PeerSession::spawn(stream, Direction::Outbound, ctx.clone());
                        let _ = handle.await;
                        if active.load(Ordering::Acquire) {
                            tracing::info!(%addr, "peer link dropped, will reconnect");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%addr, backoff_secs = backoff.as_secs(), "dial failed: {e}");
                    }
                }

                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
            }
        }));
    }

    /// Stop accepting, stop dialing and close every session.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.ctx.registry.close_all();
    }
}

fn apply_socket_options(stream: &TcpStream, keepalive: &KeepaliveConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {e}");
    }

    let mut ka = TcpKeepalive::new()
        .with_time(keepalive.idle)
        .with_interval(keepalive.interval);
    #[cfg(not(windows))]
    {
        ka = ka.with_retries(keepalive.count);
    }
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&ka) {
        tracing::debug!("keepalive setup failed: {e}");
    }
}
