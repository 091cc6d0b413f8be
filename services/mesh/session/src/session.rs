//! Per-remote handshake session state.
//!
//! A [`Session`] is shared between the two role steps of a stage and the
//! state machine driving it. Mutable state sits behind one mutex that is
//! never held across an await; inbound packets come through an [`Inbox`]
//! so a step that times out never leaves the stream half-read.

use crate::election::{ElectionOutcome, ElectionState};
use crate::error::HandshakeError;
use crate::stage::Stage;
use crate::transport::{Inbox, Link};
use crate::upgrade::{RelayDirectory, Rendezvous, RendezvousProvider};
use bytes::Bytes;
use mesh_crypto::{HashOutput, Keypair};
use mesh_storage::MessageStore;
use mesh_wire::{
    AckPacket, AdvertisePacket, Band, Capability, DeclareHashesPacket, IdentityPacket, Packet,
    Role, TypedPacket, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_REASSEMBLY_CAPACITY,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default cap on reassembled message content
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for handshake sessions
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Time allowed for both role steps of a stage
    pub stage_timeout: Duration,
    /// Time allowed to receive the peer's ack at the barrier
    pub ack_timeout: Duration,
    /// Frame cap for decoding
    pub max_frame_size: usize,
    /// Reassembly buffer size for links created by this node
    pub reassembly_capacity: usize,
    /// Identities offered per session
    pub identity_batch: usize,
    /// Messages offered per session
    pub message_batch: usize,
    /// Block size for outgoing content
    pub block_size: usize,
    /// Whether to take content from peers; otherwise opt out
    pub accept_content: bool,
    /// Largest message content accepted from a peer
    pub max_message_size: usize,
    /// Concurrent sessions allowed by the channel pool
    pub max_channels: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reassembly_capacity: DEFAULT_REASSEMBLY_CAPACITY,
            identity_batch: 32,
            message_batch: 32,
            block_size: DEFAULT_BLOCK_SIZE,
            accept_content: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_channels: 8,
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Packets received
    pub packets_in: u64,
    /// Packets sent
    pub packets_out: u64,
    /// Frame bytes received
    pub bytes_in: u64,
    /// Frame bytes sent
    pub bytes_out: u64,
    /// Stages that passed the barrier
    pub stages_completed: u32,
    /// Valid identities stored from the peer
    pub identities_received: u32,
    /// Identities dropped for a bad self-signature
    pub identities_rejected: u32,
    /// Messages stored from the peer
    pub messages_received: u32,
    /// Messages dropped for a bad signature
    pub messages_rejected: u32,
    /// Messages offered to the peer
    pub messages_sent: u32,
}

/// Remote device identifier as known to the discovery bearer
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteId(pub String);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        RemoteId(s.to_string())
    }
}

/// Events emitted by sessions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A stage passed the ack barrier
    StageCompleted {
        /// Remote peer
        remote: RemoteId,
        /// Stage that finished
        stage: Stage,
        /// Stage committed next
        next: Stage,
    },
    /// The session moved to a new bearer
    Upgraded {
        /// Remote peer
        remote: RemoteId,
        /// New bearer
        bearer: Capability,
        /// New endpoint
        endpoint: String,
    },
    /// A direct link was formed with an announced group
    DirectLink {
        /// Remote peer that took part in the announce round
        remote: RemoteId,
        /// Group the link belongs to; the link waits in the relay directory
        group: String,
        /// Bearer of the link
        bearer: Capability,
    },
    /// The session ended
    Terminated {
        /// Remote peer
        remote: RemoteId,
        /// Last stage reached
        stage: Stage,
        /// Failure, if any
        error: Option<HandshakeError>,
    },
}

/// Local node identity and election preferences
#[derive(Clone, Debug)]
pub struct NodeProfile {
    /// Signing identity
    pub keypair: Keypair,
    /// Display name sent in the identity stage
    pub name: String,
    /// Extra identity attributes
    pub extra: BTreeMap<String, Bytes>,
    /// Bearers this node can provide, most preferred first
    pub capabilities: Vec<Capability>,
    /// Role held in other encounters
    pub role_hint: Role,
    /// Preferred rendezvous band
    pub band: Band,
    /// Roles demanded for specific LUIDs when this node wins
    pub force: BTreeMap<Uuid, Role>,
    /// LUIDs dropped when this node wins
    pub remove: BTreeMap<Uuid, Role>,
}

impl NodeProfile {
    /// Profile with no election hints
    pub fn new(keypair: Keypair, name: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            keypair,
            name: name.into(),
            extra: BTreeMap::new(),
            capabilities,
            role_hint: Role::Seme,
            band: Band::Any,
            force: BTreeMap::new(),
            remove: BTreeMap::new(),
        }
    }

    /// Self-signed identity for this node
    pub fn identity(&self) -> IdentityPacket {
        IdentityPacket::new_signed(&self.keypair, self.name.clone(), self.extra.clone())
    }
}

/// Collaborators and settings shared by every session of a node
pub struct SessionContext {
    /// Session settings
    pub config: SessionConfig,
    /// Local identity and preferences
    pub profile: NodeProfile,
    /// Content store
    pub store: Arc<dyn MessageStore>,
    /// Rendezvous providers by bearer
    pub providers: HashMap<Capability, Arc<dyn RendezvousProvider>>,
    /// Rendezvous learned and hosted across sessions
    pub relays: Arc<RelayDirectory>,
    /// Event sink
    pub events: Option<mpsc::Sender<SessionEvent>>,
}

impl SessionContext {
    /// Context with no rendezvous providers and no event sink
    pub fn new(config: SessionConfig, profile: NodeProfile, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config,
            profile,
            store,
            providers: HashMap::new(),
            relays: Arc::new(RelayDirectory::new()),
            events: None,
        }
    }

    /// Register a rendezvous provider for a bearer
    pub fn with_provider(mut self, bearer: Capability, provider: Arc<dyn RendezvousProvider>) -> Self {
        self.providers.insert(bearer, provider);
        self
    }

    /// Emit session events on `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }
}

/// Rendezvous bookkeeping for the upgrade stage
#[derive(Debug, Clone, Default)]
pub struct UpgradeState {
    /// Upgrade session identifier
    pub session_id: Option<Uuid>,
    /// Rendezvous this node created as UKE
    pub hosted: Option<Rendezvous>,
    /// Rendezvous this node joined as SEME
    pub joined: Option<Rendezvous>,
    /// Hosted groups announced to the peer after the upgrade
    pub announcing: Vec<(Capability, Rendezvous)>,
}

/// Mutable per-session state
#[derive(Debug, Default)]
pub struct SessionState {
    /// Current stage
    pub stage: Option<Stage>,
    /// Peer's LUID commitment
    pub remote_luid_hash: Option<Bytes>,
    /// Peer's revealed LUID
    pub remote_luid: Option<Uuid>,
    /// Peer's advertisement
    pub remote_advertise: Option<AdvertisePacket>,
    /// Election record
    pub election: Option<ElectionState>,
    /// Election decision
    pub outcome: Option<ElectionOutcome>,
    /// Upgrade bookkeeping
    pub upgrade: UpgradeState,
    /// Hashes the peer already holds
    pub remote_declared: Option<DeclareHashesPacket>,
    /// Peer ack read early by a step
    pub stashed_ack: Option<AckPacket>,
    /// Counters
    pub stats: SessionStats,
}

/// Summary returned when a handshake ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    /// Remote peer
    pub remote: RemoteId,
    /// LUID used by this node
    pub local_luid: Uuid,
    /// Peer's LUID
    pub remote_luid: Option<Uuid>,
    /// Role taken
    pub role: Option<Role>,
    /// Elected bearer
    pub capability: Option<Capability>,
    /// Bearer of the link the session ended on
    pub bearer: Capability,
    /// Counters
    pub stats: SessionStats,
    /// Wall time
    pub elapsed: Duration,
}

/// One handshake with one remote
pub struct Session {
    /// Remote peer
    pub remote: RemoteId,
    /// LUID used for this session
    pub local_luid: Uuid,
    ctx: Arc<SessionContext>,
    link: Mutex<Link>,
    inbox: tokio::sync::Mutex<Inbox>,
    state: Mutex<SessionState>,
    gate: AtomicBool,
    started: Instant,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("local_luid", &self.local_luid)
            .field("link", &self.link())
            .finish()
    }
}

impl Session {
    /// Create a session over `link` and start reading it
    pub fn new(remote: RemoteId, local_luid: Uuid, ctx: Arc<SessionContext>, link: Link) -> Self {
        let inbox = Inbox::spawn(&link);
        Self {
            remote,
            local_luid,
            ctx,
            link: Mutex::new(link),
            inbox: tokio::sync::Mutex::new(inbox),
            state: Mutex::new(SessionState::default()),
            gate: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Shared collaborators
    pub fn ctx(&self) -> &SessionContext {
        &self.ctx
    }

    /// Session settings
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Current link
    pub fn link(&self) -> Link {
        self.link.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Lock the mutable state; never hold the guard across an await
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> SessionStats {
        self.state().stats.clone()
    }

    /// Close the gate while a stage runs
    pub fn lock_gate(&self) {
        self.gate.store(true, Ordering::Release);
    }

    /// Reopen the gate after the barrier
    pub fn unlock_gate(&self) {
        self.gate.store(false, Ordering::Release);
    }

    /// Whether a stage is running
    pub fn is_gated(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    fn check_gate(&self) -> Result<(), HandshakeError> {
        if self.is_gated() {
            Ok(())
        } else {
            Err(HandshakeError::Ungated)
        }
    }

    /// Send a packet on the current link; only while a stage holds the gate
    pub async fn send(&self, packet: impl Into<Packet>) -> Result<(), HandshakeError> {
        self.check_gate()?;
        let packet = packet.into();
        let link = self.link();
        let len = link.send_packet(&packet).await?;
        debug!("{} -> {:?} ({} bytes)", self.remote, packet.packet_type(), len);
        let mut state = self.state();
        state.stats.packets_out += 1;
        state.stats.bytes_out += len as u64;
        Ok(())
    }

    /// Next packet from the peer, whatever its type
    pub async fn recv(&self) -> Result<Packet, HandshakeError> {
        let (packet, len) = self.inbox.lock().await.recv().await?;
        trace!("{} <- {:?} ({} bytes)", self.remote, packet.packet_type(), len);
        let mut state = self.state();
        state.stats.packets_in += 1;
        state.stats.bytes_in += len as u64;
        Ok(packet)
    }

    /// Next stage packet of type `T`.
    ///
    /// An ack arriving here means the peer has finished the stage early; it
    /// is stashed for the barrier and the step fails.
    pub async fn expect<T: TypedPacket>(&self, stage: Stage) -> Result<T, HandshakeError> {
        self.check_gate()?;
        let packet = self.recv().await?;
        debug!("{} <- {:?} in {}", self.remote, packet.packet_type(), stage);
        match T::from_packet(packet) {
            Ok(inner) => Ok(inner),
            Err(Packet::Ack(ack)) => {
                let err = if ack.success {
                    HandshakeError::UnexpectedPacket {
                        stage,
                        got: mesh_wire::PacketType::Ack,
                    }
                } else {
                    HandshakeError::PeerFailed {
                        status: ack.status,
                        message: ack.message.clone().unwrap_or_default(),
                    }
                };
                self.state().stashed_ack = Some(ack);
                Err(err)
            }
            Err(other) => Err(HandshakeError::UnexpectedPacket {
                stage,
                got: other.packet_type(),
            }),
        }
    }

    /// Wait for the peer's ack, discarding leftover stage packets
    pub async fn await_peer_ack(&self, stage: Stage) -> Result<AckPacket, HandshakeError> {
        let stashed = self.state().stashed_ack.take();
        if let Some(ack) = stashed {
            return Ok(ack);
        }
        loop {
            match self.recv().await? {
                Packet::Ack(ack) => return Ok(ack),
                other => debug!(
                    "{} discarding stale {:?} at {} barrier",
                    self.remote,
                    other.packet_type(),
                    stage
                ),
            }
        }
    }

    /// Move to a new link; the old one is disconnected
    pub async fn swap_link(&self, new_link: Link) {
        let inbox = Inbox::spawn(&new_link);
        let old = std::mem::replace(
            &mut *self.link.lock().unwrap_or_else(|p| p.into_inner()),
            new_link,
        );
        *self.inbox.lock().await = inbox;
        old.disconnect().await;
    }

    /// Emit an event if a sink is attached
    pub async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.ctx.events {
            tx.send(event).await.ok();
        }
    }

    /// LUID commitment of this session's LUID
    pub fn local_luid_hash(&self) -> HashOutput {
        crate::luid::luid_hash(&self.local_luid)
    }

    /// Build the report for the current state
    pub fn report(&self) -> HandshakeReport {
        let bearer = self.link().bearer();
        let state = self.state();
        HandshakeReport {
            remote: self.remote.clone(),
            local_luid: self.local_luid,
            remote_luid: state.remote_luid,
            role: state.outcome.as_ref().map(|o| o.role),
            capability: state.outcome.as_ref().map(|o| o.capability),
            bearer,
            stats: state.stats.clone(),
            elapsed: self.started.elapsed(),
        }
    }
}
