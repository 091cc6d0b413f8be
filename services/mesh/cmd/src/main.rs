//! Mesh router node binary.
//!
//! Accepts and dials TCP links that stand in for a discovery bearer, runs
//! the bearer-negotiation handshake over each, and upgrades to a TCP
//! rendezvous when the election picks a faster bearer.

use anyhow::Context;
use clap::Parser;
use mesh_session::{
    connect_tcp, listen_tcp, RemoteId, SessionContext, SessionEvent, SessionManager, TcpTransport,
};
use mesh_storage::MemoryStore;
use mesh_wire::Capability;
use std::{net::IpAddr, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod rendezvous;

use config::NodeConfig;
use logging::MeshLogFormatter;
use rendezvous::TcpRendezvousProvider;

/// Mesh router node
#[derive(Parser, Debug)]
#[command(name = "mesh-router", version, about = "Mesh router with bearer negotiation")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Name sent in the identity stage
    #[arg(long)]
    name: Option<String>,

    /// Listen address for discovery links, e.g. 0.0.0.0:7400
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer to dial, e.g. 10.0.0.2:7400 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Bearer this node provides, most preferred first (repeatable)
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Preferred rendezvous band (any, 2.4, 5)
    #[arg(long)]
    band: Option<String>,

    /// Time allowed per stage, e.g. 30s
    #[arg(long)]
    stage_timeout: Option<humantime::Duration>,

    /// Time allowed for the peer's ack, e.g. 10s
    #[arg(long)]
    ack_timeout: Option<humantime::Duration>,

    /// Address rendezvous listeners bind to
    #[arg(long)]
    rendezvous_ip: Option<IpAddr>,

    /// File holding the signing seed
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values win over file and environment
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(name) = &self.name {
            config.identity_name = name.clone();
        }
        if self.listen.is_some() {
            config.listen = self.listen;
        }
        if !self.connect.is_empty() {
            config.connect = self.connect.clone();
        }
        if !self.capabilities.is_empty() {
            config.capabilities = self.capabilities.clone();
        }
        if let Some(band) = &self.band {
            config.band = band.clone();
        }
        if let Some(timeout) = self.stage_timeout {
            config.stage_timeout = timeout.into();
        }
        if let Some(timeout) = self.ack_timeout {
            config.ack_timeout = timeout.into();
        }
        if let Some(ip) = self.rendezvous_ip {
            config.rendezvous_ip = ip;
        }
        if self.key_file.is_some() {
            config.key_file = self.key_file.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("mesh_router={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?)
        .add_directive(format!("mesh_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting mesh router v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let keypair = config.load_keypair()?;
    let profile = config.profile(keypair)?;
    let discovery = config.discovery_bearer()?;
    info!(
        "Node {} ({}) provides {:?}, discovery over {}",
        profile.name,
        profile.keypair.fingerprint(),
        profile.capabilities,
        discovery
    );

    let (events_tx, events_rx) = mpsc::channel(256);
    let mut ctx = SessionContext::new(
        config.session_config(),
        profile,
        Arc::new(MemoryStore::new()),
    )
    .with_events(events_tx);
    for bearer in [Capability::WifiDirect, Capability::Lan] {
        ctx = ctx.with_provider(
            bearer,
            Arc::new(TcpRendezvousProvider::new(
                bearer,
                config.rendezvous_ip,
                config.reassembly_capacity,
            )),
        );
    }

    let manager = Arc::new(SessionManager::new(ctx));
    let rotation = manager.start_rotation(config.luid_rotation_interval);
    tokio::spawn(handle_events(events_rx, manager.clone()));

    if let Some(addr) = config.listen {
        let listener = listen_tcp(addr).await?;
        info!("Listening for discovery links on {}", addr);
        tokio::spawn(accept_loop(
            listener,
            manager.clone(),
            discovery,
            config.reassembly_capacity,
        ));
    }

    for addr in config.connect.clone() {
        tokio::spawn(dial(addr, manager.clone(), discovery, config.reassembly_capacity));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, {} handshakes in flight", manager.in_flight());
    rotation.abort();
    Ok(())
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    manager: Arc<SessionManager>,
    bearer: Capability,
    capacity: usize,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("Inbound discovery link from {}", peer);
        match TcpTransport::link(stream, bearer, capacity) {
            Ok(link) => {
                tokio::spawn(run(manager.clone(), RemoteId(peer.to_string()), link));
            }
            Err(e) => warn!("Could not set up link from {}: {}", peer, e),
        }
    }
}

async fn dial(addr: SocketAddr, manager: Arc<SessionManager>, bearer: Capability, capacity: usize) {
    let link = match connect_tcp(addr).await {
        Ok(stream) => TcpTransport::link(stream, bearer, capacity),
        Err(e) => Err(e),
    };
    match link {
        Ok(link) => run(manager, RemoteId(addr.to_string()), link).await,
        Err(e) => warn!("Could not reach {}: {}", addr, e),
    }
}

async fn run(manager: Arc<SessionManager>, remote: RemoteId, link: mesh_session::Link) {
    match manager.handshake(remote.clone(), link).await {
        Ok(report) => info!(
            "Handshake with {} done in {:?}: {:?} on {}, {} messages in, {} out",
            remote,
            report.elapsed,
            report.role,
            report.bearer,
            report.stats.messages_received,
            report.stats.messages_sent
        ),
        Err(e) => warn!("Handshake with {} failed: {}", remote, e),
    }
}

async fn handle_events(mut events: mpsc::Receiver<SessionEvent>, manager: Arc<SessionManager>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StageCompleted { remote, stage, next } => {
                component_debug!("session", "{} finished {}, next {}", remote, stage, next)
            }
            SessionEvent::Upgraded {
                remote,
                bearer,
                endpoint,
            } => component_info!("upgrade", "{} moved to {} at {}", remote, bearer, endpoint),
            SessionEvent::DirectLink {
                remote,
                group,
                bearer,
            } => {
                component_info!("announce", "direct link to {} on {} via {}", group, bearer, remote);
                // Run a handshake of its own over the direct link.
                if let Some(link) = manager.context().relays.take_direct(&group) {
                    let peer = RemoteId(format!("{group}/{remote}"));
                    tokio::spawn(run(manager.clone(), peer, link));
                }
            }
            SessionEvent::Terminated {
                remote,
                stage,
                error: Some(e),
            } => component_warn!("session", "{} terminated in {}: {}", remote, stage, e),
            SessionEvent::Terminated { remote, .. } => {
                component_info!("session", "{} terminated cleanly", remote)
            }
        }
    }
}
