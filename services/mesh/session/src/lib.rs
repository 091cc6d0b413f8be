//! Handshake sessions for mesh discovery bearers.
//!
//! Two devices that find each other on a low-bandwidth discovery bearer run
//! a staged handshake: exchange ephemeral LUIDs, advertise the bearers they
//! can provide, elect a leader with commit-reveal, optionally move to a
//! faster bearer, then swap identities and content.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_crypto::Keypair;
//! use mesh_session::{
//!     memory_link_pair, NodeProfile, RemoteId, SessionConfig, SessionContext, SessionManager,
//! };
//! use mesh_storage::MemoryStore;
//! use mesh_wire::Capability;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let profile = NodeProfile::new(Keypair::generate(), "relay-7", vec![Capability::Ble]);
//! let ctx = SessionContext::new(SessionConfig::default(), profile, Arc::new(MemoryStore::new()));
//! let manager = SessionManager::new(ctx);
//!
//! let (link, _peer) = memory_link_pair(Capability::Ble, 64 * 1024, 185);
//! let report = manager.handshake(RemoteId::from("peer"), link).await?;
//! println!("elected {:?} as {:?}", report.capability, report.role);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel_pool;
mod content;
pub mod election;
pub mod error;
pub mod handshake;
pub mod luid;
pub mod manager;
pub mod outcome;
pub mod session;
pub mod stage;
mod steps;
pub mod transport;
pub mod upgrade;

// Re-export main types
pub use channel_pool::{ChannelGuard, ChannelPool};
pub use election::{
    elect_capability, election_seed, preferred_capability, rank, ElectionOutcome, ElectionState,
    LocalVote,
};
pub use error::{HandshakeError, TransportError, UpgradeError};
pub use handshake::run_handshake;
pub use luid::{luid_hash, verify_luid, LuidRotator, TransactionGuard, TransactionLock};
pub use manager::{HandshakeHandle, SessionManager};
pub use outcome::{StagePayload, TransactionResult};
pub use session::{
    HandshakeReport, NodeProfile, RemoteId, Session, SessionConfig, SessionContext, SessionEvent,
    SessionState, SessionStats, UpgradeState, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use stage::Stage;
pub use transport::{
    connect_tcp, listen_tcp, memory_link_pair, Inbox, Link, MemoryTransport, TcpTransport,
    Transport,
};
pub use upgrade::{MemoryBearer, RelayDirectory, Rendezvous, RendezvousProvider};
