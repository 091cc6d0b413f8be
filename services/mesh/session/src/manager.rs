//! Session registry: at most one handshake per remote.
//!
//! The manager owns the session table. A second attempt for a remote that
//! already has a handshake running drops its own link and shares the
//! running handshake's result instead of starting another.

use crate::channel_pool::ChannelPool;
use crate::error::HandshakeError;
use crate::handshake::run_handshake;
use crate::luid::{LuidRotator, TransactionLock};
use crate::session::{HandshakeReport, RemoteId, Session, SessionContext};
use crate::transport::Link;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use mesh_wire::FrameCodec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// Shared result of one handshake
pub type HandshakeHandle = Shared<BoxFuture<'static, Result<HandshakeReport, HandshakeError>>>;

struct LiveSession {
    session: Arc<Session>,
    task: AbortHandle,
}

/// Registry of running handshakes
pub struct SessionManager {
    ctx: Arc<SessionContext>,
    pool: ChannelPool,
    lock: TransactionLock,
    rotator: Arc<LuidRotator>,
    sessions: Arc<DashMap<RemoteId, HandshakeHandle>>,
    live: Arc<DashMap<RemoteId, LiveSession>>,
}

enum Begin {
    Started(HandshakeHandle),
    Existing(HandshakeHandle),
}

impl SessionManager {
    /// Create a manager; the channel pool is sized from the context config
    pub fn new(ctx: SessionContext) -> Self {
        let lock = TransactionLock::new();
        Self {
            pool: ChannelPool::new(ctx.config.max_channels),
            rotator: Arc::new(LuidRotator::new(lock.clone())),
            lock,
            ctx: Arc::new(ctx),
            sessions: Arc::new(DashMap::new()),
            live: Arc::new(DashMap::new()),
        }
    }

    /// LUID holder shared with discovery advertising
    pub fn luid(&self) -> Arc<LuidRotator> {
        self.rotator.clone()
    }

    /// Start rotating the LUID every `interval`
    pub fn start_rotation(&self, interval: Duration) -> JoinHandle<()> {
        self.rotator.clone().run(interval)
    }

    /// Number of handshakes in flight
    pub fn in_flight(&self) -> usize {
        self.lock.in_flight()
    }

    /// Whether a handshake with `remote` is running
    pub fn is_active(&self, remote: &RemoteId) -> bool {
        self.sessions.contains_key(remote)
    }

    /// Channel pool used by stages
    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Shared collaborators
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Run a handshake with `remote` over `link`.
    ///
    /// If one is already running, `link` is disconnected and the running
    /// handshake's result is returned.
    pub async fn handshake(
        &self,
        remote: RemoteId,
        link: Link,
    ) -> Result<HandshakeReport, HandshakeError> {
        match self.begin(remote.clone(), link.clone()) {
            Begin::Started(handle) => handle.await,
            Begin::Existing(handle) => {
                info!("Handshake with {} already running, dropping duplicate link", remote);
                link.disconnect().await;
                handle.await
            }
        }
    }

    /// Start a handshake without waiting; duplicates fail with `TransactionBusy`
    pub fn try_begin(&self, remote: RemoteId, link: Link) -> Result<HandshakeHandle, HandshakeError> {
        match self.begin(remote.clone(), link) {
            Begin::Started(handle) => Ok(handle),
            Begin::Existing(_) => Err(HandshakeError::TransactionBusy(remote.to_string())),
        }
    }

    /// Abort a running handshake, disconnect its link and forget it
    pub async fn dispose(&self, remote: &RemoteId) -> bool {
        let Some((_, live)) = self.live.remove(remote) else {
            return false;
        };
        live.task.abort();
        self.sessions.remove(remote);
        live.session.link().disconnect().await;
        self.pool.forget(remote);
        info!("Disposed handshake with {}", remote);
        true
    }

    fn begin(&self, remote: RemoteId, link: Link) -> Begin {
        let (tx, rx) = oneshot::channel();
        let handle: HandshakeHandle = async move {
            rx.await.unwrap_or(Err(HandshakeError::Disposed))
        }
        .boxed()
        .shared();

        match self.sessions.entry(remote.clone()) {
            Entry::Occupied(existing) => return Begin::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        let link = link.with_codec(FrameCodec::with_max_frame_size(self.ctx.config.max_frame_size));
        let session = Arc::new(Session::new(
            remote.clone(),
            self.rotator.current(),
            self.ctx.clone(),
            link,
        ));
        let guard = self.lock.begin();
        let sessions = self.sessions.clone();
        let live = self.live.clone();
        let pool = self.pool.clone();
        let key = remote.clone();
        let (start_tx, start_rx) = oneshot::channel::<()>();

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                // Wait until the live entry exists so cleanup below finds it.
                if start_rx.await.is_err() {
                    return;
                }
                let result = run_handshake(session, pool.clone()).await;
                sessions.remove(&key);
                live.remove(&key);
                pool.forget(&key);
                drop(guard);
                debug!("Handshake with {} finished", key);
                let _ = tx.send(result);
            }
        });

        self.live.insert(
            remote,
            LiveSession {
                session,
                task: task.abort_handle(),
            },
        );
        let _ = start_tx.send(());
        Begin::Started(handle)
    }
}
