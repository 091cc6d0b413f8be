//! Bearer upgrade: rendezvous providers, relay bookkeeping and the upgrade stage.
//!
//! The elected UKE creates a rendezvous on the upgraded bearer and publishes
//! it over the discovery link; SEMEs join it. A SUPERSEME additionally passes
//! on rendezvous it learned elsewhere.
//!
//! Once both sides sit on the new bearer an announce round runs over it. The
//! UKE passes its relays on to the member, and a SUPERSEME announces the
//! groups it hosts. The receiver joins every announced group it can reach
//! and answers `joined` or `declined`, so the host knows which direct links
//! to accept.

use crate::error::{HandshakeError, UpgradeError};
use crate::outcome::{StagePayload, TransactionResult};
use crate::session::{Session, SessionEvent};
use crate::stage::Stage;
use crate::transport::{memory_link_pair, Link};
use async_trait::async_trait;
use dashmap::DashMap;
use mesh_wire::packet::MAX_MAP_ENTRIES;
use mesh_wire::{get_meta_str, get_meta_u32, Band, Capability, MetaBuilder, Role, UpgradePacket};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const KIND: &str = "kind";
const KIND_RENDEZVOUS: &str = "rendezvous";
const KIND_RELAY: &str = "relay";
const KIND_ANNOUNCE: &str = "announce";
const KIND_JOINED: &str = "joined";
const KIND_DECLINED: &str = "declined";
const KIND_DONE: &str = "done";

/// Parameters needed to join a group on the upgraded bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    /// Group or network name
    pub name: String,
    /// Join secret
    pub passphrase: String,
    /// Radio band
    pub band: Band,
    /// Address to connect to
    pub endpoint: String,
    /// LUID of the hosting UKE
    pub owner: Uuid,
}

impl Rendezvous {
    /// Fresh group name for a group owned by `owner`
    pub fn group_name(owner: &Uuid) -> String {
        let tag = rand::thread_rng().next_u32() as u16;
        format!("DIRECT-{}{tag:04x}", &owner.simple().to_string()[..4])
    }

    /// Encode into upgrade metadata under `kind`
    pub fn to_metadata(&self, kind: &str) -> BTreeMap<String, String> {
        MetaBuilder::new()
            .insert_str(KIND, kind)
            .insert_str("name", &self.name)
            .insert_str("passphrase", &self.passphrase)
            .insert_u32("band", u8::from(self.band) as u32)
            .insert_str("endpoint", &self.endpoint)
            .insert_str("owner", &self.owner.to_string())
            .build()
    }

    /// Decode from upgrade metadata
    pub fn from_metadata(meta: &BTreeMap<String, String>) -> Result<Self, UpgradeError> {
        let field = |key: &str| {
            get_meta_str(meta, key).ok_or_else(|| UpgradeError::Metadata(format!("missing {key}")))
        };
        let band = get_meta_u32(meta, "band")
            .and_then(|b| u8::try_from(b).ok())
            .and_then(|b| Band::try_from(b).ok())
            .ok_or_else(|| UpgradeError::Metadata("bad band".to_string()))?;
        let owner = field("owner")?
            .parse()
            .map_err(|_| UpgradeError::Metadata("bad owner".to_string()))?;
        Ok(Self {
            name: field("name")?,
            passphrase: field("passphrase")?,
            band,
            endpoint: field("endpoint")?,
            owner,
        })
    }
}

/// Creates and joins groups on one upgraded bearer
#[async_trait]
pub trait RendezvousProvider: Send + Sync {
    /// Create a group owned by `owner` on `band`
    async fn create_rendezvous(&self, owner: Uuid, band: Band) -> Result<Rendezvous, UpgradeError>;

    /// Wait for one peer to join a group this node created
    async fn accept(&self, rendezvous: &Rendezvous) -> Result<Link, UpgradeError>;

    /// Join a group created by another node
    async fn connect(&self, rendezvous: &Rendezvous) -> Result<Link, UpgradeError>;

    /// Dissolve a group this node created
    async fn teardown(&self, rendezvous: &Rendezvous);
}

/// Rendezvous known to this node across sessions, with the bearer each runs on
#[derive(Debug, Default)]
pub struct RelayDirectory {
    /// Groups this node hosts, by name
    hosted: DashMap<String, (Capability, Rendezvous)>,
    /// Groups learned from UKEs and relays, by name
    learned: DashMap<String, (Capability, Rendezvous)>,
    /// Groups announced by SUPERSEMEs, by announcing LUID
    announced: DashMap<Uuid, Vec<Rendezvous>>,
    /// Direct links formed in announce rounds, by group name
    direct: DashMap<String, Link>,
}

impl RelayDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a group this node hosts on `bearer`
    pub fn host(&self, bearer: Capability, rendezvous: Rendezvous) {
        self.learned.remove(&rendezvous.name);
        self.hosted
            .insert(rendezvous.name.clone(), (bearer, rendezvous));
    }

    /// Forget a hosted group
    pub fn unhost(&self, name: &str) {
        self.hosted.remove(name);
    }

    /// Whether this node hosts the named group
    pub fn is_hosted(&self, name: &str) -> bool {
        self.hosted.contains_key(name)
    }

    /// Record a group on `bearer` learned from a peer
    pub fn learn(&self, bearer: Capability, rendezvous: Rendezvous) {
        if !self.hosted.contains_key(&rendezvous.name) {
            self.learned
                .insert(rendezvous.name.clone(), (bearer, rendezvous));
        }
    }

    /// Record a group announced by `luid`
    pub fn announce(&self, luid: Uuid, rendezvous: Rendezvous) {
        let mut groups = self.announced.entry(luid).or_default();
        if !groups.iter().any(|g| g.name == rendezvous.name) {
            groups.push(rendezvous);
        }
    }

    /// Hosted groups
    pub fn hosted(&self) -> Vec<(Capability, Rendezvous)> {
        self.hosted.iter().map(|e| e.value().clone()).collect()
    }

    /// Learned groups
    pub fn learned(&self) -> Vec<(Capability, Rendezvous)> {
        self.learned.iter().map(|e| e.value().clone()).collect()
    }

    /// Groups announced by one peer
    pub fn announced_by(&self, luid: &Uuid) -> Vec<Rendezvous> {
        self.announced.get(luid).map(|g| g.clone()).unwrap_or_default()
    }

    /// Keep a direct link until its owner takes it
    pub fn add_direct(&self, group: String, link: Link) {
        if let Some(stale) = self.direct.insert(group, link) {
            tokio::spawn(async move { stale.disconnect().await });
        }
    }

    /// Whether a direct link to the named group is waiting
    pub fn has_direct(&self, group: &str) -> bool {
        self.direct.contains_key(group)
    }

    /// Take the direct link formed with the named group
    pub fn take_direct(&self, group: &str) -> Option<Link> {
        self.direct.remove(group).map(|(_, link)| link)
    }
}

struct PendingGroup {
    passphrase: String,
    joins: mpsc::Sender<Link>,
    accepted: Arc<Mutex<mpsc::Receiver<Link>>>,
}

/// In-process rendezvous provider; joined links are memory pairs
pub struct MemoryBearer {
    bearer: Capability,
    capacity: usize,
    mtu: usize,
    groups: DashMap<String, PendingGroup>,
}

impl MemoryBearer {
    /// Create a provider for `bearer` with the given link buffer size and MTU
    pub fn new(bearer: Capability, capacity: usize, mtu: usize) -> Self {
        Self {
            bearer,
            capacity,
            mtu,
            groups: DashMap::new(),
        }
    }

    /// Number of open groups
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }
}

#[async_trait]
impl RendezvousProvider for MemoryBearer {
    async fn create_rendezvous(&self, owner: Uuid, band: Band) -> Result<Rendezvous, UpgradeError> {
        let mut secret = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut secret);
        let passphrase: String = secret.iter().map(|b| format!("{b:02x}")).collect();
        let name = Rendezvous::group_name(&owner);

        let (joins, accepted) = mpsc::channel(4);
        self.groups.insert(
            name.clone(),
            PendingGroup {
                passphrase: passphrase.clone(),
                joins,
                accepted: Arc::new(Mutex::new(accepted)),
            },
        );
        debug!("Created in-process group {} on {}", name, self.bearer);

        Ok(Rendezvous {
            endpoint: format!("mem://{name}"),
            name,
            passphrase,
            band,
            owner,
        })
    }

    async fn accept(&self, rendezvous: &Rendezvous) -> Result<Link, UpgradeError> {
        let accepted = self
            .groups
            .get(&rendezvous.name)
            .map(|g| g.accepted.clone())
            .ok_or_else(|| UpgradeError::Accept(format!("no group {}", rendezvous.name)))?;
        let link = accepted.lock().await.recv().await;
        link.ok_or_else(|| UpgradeError::Accept("group dissolved".to_string()))
    }

    async fn connect(&self, rendezvous: &Rendezvous) -> Result<Link, UpgradeError> {
        let joins = {
            let group = self
                .groups
                .get(&rendezvous.name)
                .ok_or_else(|| UpgradeError::Connect(format!("no group {}", rendezvous.name)))?;
            if group.passphrase != rendezvous.passphrase {
                return Err(UpgradeError::Connect("passphrase rejected".to_string()));
            }
            group.joins.clone()
        };
        let (host_side, joiner_side) = memory_link_pair(self.bearer, self.capacity, self.mtu);
        joins
            .send(host_side)
            .await
            .map_err(|_| UpgradeError::Connect("group dissolved".to_string()))?;
        Ok(joiner_side)
    }

    async fn teardown(&self, rendezvous: &Rendezvous) {
        if self.groups.remove(&rendezvous.name).is_some() {
            debug!("Dissolved in-process group {}", rendezvous.name);
        }
    }
}

fn provider_for(
    session: &Session,
    bearer: Capability,
) -> Result<Arc<dyn RendezvousProvider>, HandshakeError> {
    session
        .ctx()
        .providers
        .get(&bearer)
        .cloned()
        .ok_or_else(|| UpgradeError::Unsupported(bearer).into())
}

fn upgrade_target(session: &Session) -> Result<(Uuid, Capability, Band, Role), HandshakeError> {
    let mut state = session.state();
    let outcome = state
        .outcome
        .clone()
        .ok_or_else(|| HandshakeError::Task("upgrade before election".to_string()))?;
    let session_id = *state.upgrade.session_id.get_or_insert_with(Uuid::new_v4);
    Ok((session_id, outcome.capability, outcome.band, outcome.role))
}

fn marker(kind: &str) -> BTreeMap<String, String> {
    MetaBuilder::new().insert_str(KIND, kind).build()
}

fn reply(kind: &str, name: &str) -> BTreeMap<String, String> {
    MetaBuilder::new()
        .insert_str(KIND, kind)
        .insert_str("name", name)
        .build()
}

/// Learned relays worth passing to the peer: never the peer's own groups
fn forwardable(session: &Session) -> Vec<(Capability, Rendezvous)> {
    let remote_luid = session.state().remote_luid;
    session
        .ctx()
        .relays
        .learned()
        .into_iter()
        .filter(|(_, relay)| Some(relay.owner) != remote_luid)
        .take(MAX_MAP_ENTRIES)
        .collect()
}

async fn send_relays(session: &Session, session_id: Uuid) -> Result<(), HandshakeError> {
    for (bearer, relay) in forwardable(session) {
        session
            .send(UpgradePacket::new(session_id, bearer, relay.to_metadata(KIND_RELAY)))
            .await?;
    }
    Ok(())
}

fn learn_relay(session: &Session, packet: &UpgradePacket) {
    match Rendezvous::from_metadata(&packet.metadata) {
        Ok(relay) => session.ctx().relays.learn(packet.provides, relay),
        Err(e) => warn!("{} sent unusable relay: {}", session.remote, e),
    }
}

/// Emit side of the upgrade stage
pub(crate) async fn acceptor_step(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let (session_id, bearer, band, role) = upgrade_target(session)?;

    if role == Role::Uke {
        let provider = provider_for(session, bearer)?;
        let rendezvous = provider.create_rendezvous(session.local_luid, band).await?;
        session.ctx().relays.host(bearer, rendezvous.clone());
        session.state().upgrade.hosted = Some(rendezvous.clone());

        info!("{} hosting {} on {}", session.remote, rendezvous.name, bearer);
        session
            .send(UpgradePacket::new(
                session_id,
                bearer,
                rendezvous.to_metadata(KIND_RENDEZVOUS),
            ))
            .await?;

        let link = provider.accept(&rendezvous).await?;
        return Ok(TransactionResult::done().with_payload(StagePayload::UpgradedLink(link)));
    }

    if role == Role::SuperSeme {
        send_relays(session, session_id).await?;
    }
    session
        .send(UpgradePacket::new(session_id, bearer, marker(KIND_DONE)))
        .await?;
    Ok(TransactionResult::done())
}

/// Consume side of the upgrade stage
pub(crate) async fn initiator_step(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let (_, _, _, role) = upgrade_target(session)?;

    if role == Role::Uke {
        loop {
            let packet: UpgradePacket = session.expect(Stage::Upgrade).await?;
            match get_meta_str(&packet.metadata, KIND).as_deref() {
                Some(KIND_DONE) => break,
                Some(KIND_RELAY) => learn_relay(session, &packet),
                other => debug!("{} ignoring upgrade packet {:?}", session.remote, other),
            }
        }
        return Ok(TransactionResult::advance(Stage::Announce));
    }

    let packet: UpgradePacket = session.expect(Stage::Upgrade).await?;
    if get_meta_str(&packet.metadata, KIND).as_deref() != Some(KIND_RENDEZVOUS) {
        return Err(UpgradeError::Metadata("expected rendezvous".to_string()).into());
    }
    let rendezvous = Rendezvous::from_metadata(&packet.metadata)?;
    let provider = provider_for(session, packet.provides)?;

    info!("{} joining {} on {}", session.remote, rendezvous.name, packet.provides);
    let link = provider.connect(&rendezvous).await?;
    session.ctx().relays.learn(packet.provides, rendezvous.clone());
    {
        let mut state = session.state();
        state.upgrade.session_id = Some(packet.session_id);
        state.upgrade.joined = Some(rendezvous);
    }
    Ok(TransactionResult::advance(Stage::Announce).with_payload(StagePayload::UpgradedLink(link)))
}

/// Fix the groups a SUPERSEME announces before the round starts
pub(crate) fn prepare_announce(session: &Session) -> Result<(), HandshakeError> {
    let hosted = session.ctx().relays.hosted();
    let mut state = session.state();
    let role = state.outcome.as_ref().map(|o| o.role);
    state.upgrade.announcing = if role == Some(Role::SuperSeme) {
        hosted.into_iter().take(MAX_MAP_ENTRIES).collect()
    } else {
        Vec::new()
    };
    Ok(())
}

/// Emit side of the announce round
pub(crate) async fn send_announce(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let (session_id, bearer, _, role) = upgrade_target(session)?;

    if role == Role::Uke {
        send_relays(session, session_id).await?;
    }
    let announcing = session.state().upgrade.announcing.clone();
    for (group_bearer, group) in announcing {
        debug!("{} announcing {} on {}", session.remote, group.name, group_bearer);
        session
            .send(UpgradePacket::new(session_id, group_bearer, group.to_metadata(KIND_ANNOUNCE)))
            .await?;
    }
    session
        .send(UpgradePacket::new(session_id, bearer, marker(KIND_DONE)))
        .await?;
    Ok(TransactionResult::done())
}

/// Consume side of the announce round.
///
/// Ends once the peer is done and has answered every group we announced.
pub(crate) async fn receive_announce(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let (session_id, _, _, _) = upgrade_target(session)?;
    let mut awaiting: BTreeMap<String, (Capability, Rendezvous)> = session
        .state()
        .upgrade
        .announcing
        .iter()
        .map(|(bearer, group)| (group.name.clone(), (*bearer, group.clone())))
        .collect();
    let mut peer_done = false;

    while !peer_done || !awaiting.is_empty() {
        let packet: UpgradePacket = session.expect(Stage::Announce).await?;
        let kind = get_meta_str(&packet.metadata, KIND);
        match kind.as_deref() {
            Some(KIND_DONE) => peer_done = true,
            Some(KIND_RELAY) => learn_relay(session, &packet),
            Some(KIND_ANNOUNCE) => {
                let (answer, name) = join_announced(session, &packet).await;
                session
                    .send(UpgradePacket::new(session_id, packet.provides, reply(answer, &name)))
                    .await?;
            }
            Some(answer @ (KIND_JOINED | KIND_DECLINED)) => {
                let name = get_meta_str(&packet.metadata, "name").unwrap_or_default();
                let Some((bearer, group)) = awaiting.remove(&name) else {
                    debug!("{} answered for unknown group {}", session.remote, name);
                    continue;
                };
                if answer == KIND_JOINED {
                    accept_direct(session, bearer, group).await;
                }
            }
            other => debug!("{} ignoring announce packet {:?}", session.remote, other),
        }
    }
    Ok(TransactionResult::advance(Stage::Identity))
}

/// Record an announced group and join it if we can; returns the answer kind
async fn join_announced(session: &Session, packet: &UpgradePacket) -> (&'static str, String) {
    let name = get_meta_str(&packet.metadata, "name").unwrap_or_default();
    let group = match Rendezvous::from_metadata(&packet.metadata) {
        Ok(group) => group,
        Err(e) => {
            warn!("{} sent unusable announce: {}", session.remote, e);
            return (KIND_DECLINED, name);
        }
    };

    let relays = &session.ctx().relays;
    let announcer = session.state().remote_luid;
    if let Some(luid) = announcer {
        relays.announce(luid, group.clone());
    }
    relays.learn(packet.provides, group.clone());

    if group.owner == session.local_luid
        || relays.is_hosted(&group.name)
        || relays.has_direct(&group.name)
    {
        return (KIND_DECLINED, name);
    }
    let Some(provider) = session.ctx().providers.get(&packet.provides).cloned() else {
        debug!("{} announced {} on unsupported {}", session.remote, name, packet.provides);
        return (KIND_DECLINED, name);
    };

    match provider.connect(&group).await {
        Ok(link) => {
            info!("{} direct link to {} on {}", session.remote, name, packet.provides);
            relays.add_direct(name.clone(), link);
            session
                .emit(SessionEvent::DirectLink {
                    remote: session.remote.clone(),
                    group: name.clone(),
                    bearer: packet.provides,
                })
                .await;
            (KIND_JOINED, name)
        }
        Err(e) => {
            warn!("{} could not join announced {}: {}", session.remote, name, e);
            (KIND_DECLINED, name)
        }
    }
}

/// Take the peer's join on a group we announced
async fn accept_direct(session: &Session, bearer: Capability, group: Rendezvous) {
    let Some(provider) = session.ctx().providers.get(&bearer).cloned() else {
        return;
    };
    match provider.accept(&group).await {
        Ok(link) => {
            info!("{} joined {} directly", session.remote, group.name);
            session.ctx().relays.add_direct(group.name.clone(), link);
            session
                .emit(SessionEvent::DirectLink {
                    remote: session.remote.clone(),
                    group: group.name,
                    bearer,
                })
                .await;
        }
        Err(e) => warn!("{} direct join on {} failed: {}", session.remote, group.name, e),
    }
}

/// Dissolve the group this session hosted, if any
pub(crate) async fn teardown(session: &Session) {
    let hosted = session.state().upgrade.hosted.take();
    let Some(rendezvous) = hosted else {
        return;
    };
    session.ctx().relays.unhost(&rendezvous.name);
    let bearer = session.state().outcome.as_ref().map(|o| o.capability);
    if let Some(provider) = bearer.and_then(|b| session.ctx().providers.get(&b).cloned()) {
        provider.teardown(&rendezvous).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous_metadata() {
        let rendezvous = Rendezvous {
            name: "DIRECT-ab12".to_string(),
            passphrase: "secret".to_string(),
            band: Band::Ghz5,
            endpoint: "192.168.49.1:8988".to_string(),
            owner: Uuid::new_v4(),
        };
        let meta = rendezvous.to_metadata(KIND_RENDEZVOUS);
        assert_eq!(get_meta_str(&meta, KIND).as_deref(), Some(KIND_RENDEZVOUS));
        assert_eq!(Rendezvous::from_metadata(&meta).unwrap(), rendezvous);

        let mut broken = meta.clone();
        broken.remove("passphrase");
        assert!(matches!(
            Rendezvous::from_metadata(&broken),
            Err(UpgradeError::Metadata(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_bearer_join() {
        let bearer = MemoryBearer::new(Capability::WifiDirect, 4096, 1024);
        let rendezvous = bearer.create_rendezvous(Uuid::new_v4(), Band::Any).await.unwrap();

        let (host, joiner) = tokio::join!(bearer.accept(&rendezvous), bearer.connect(&rendezvous));
        let (host, joiner) = (host.unwrap(), joiner.unwrap());
        assert_eq!(host.bearer(), Capability::WifiDirect);

        joiner
            .send_packet(&mesh_wire::Packet::Ack(mesh_wire::AckPacket::ok()))
            .await
            .unwrap();
        assert!(host.recv_packet().await.is_ok());

        let mut wrong = rendezvous.clone();
        wrong.passphrase = "guess".to_string();
        assert!(bearer.connect(&wrong).await.is_err());

        bearer.teardown(&rendezvous).await;
        assert_eq!(bearer.open_groups(), 0);
        assert!(bearer.connect(&rendezvous).await.is_err());
    }

    #[test]
    fn test_group_names_differ_per_group() {
        let owner = Uuid::new_v4();
        let prefix = format!("DIRECT-{}", &owner.simple().to_string()[..4]);
        let names: std::collections::HashSet<_> =
            (0..8).map(|_| Rendezvous::group_name(&owner)).collect();
        assert!(names.iter().all(|n| n.starts_with(&prefix) && n.len() == prefix.len() + 4));
        assert!(names.len() > 1);
    }

    #[tokio::test]
    async fn test_direct_links_wait_in_directory() {
        let dir = RelayDirectory::new();
        let (a, b) = memory_link_pair(Capability::WifiDirect, 4096, 1024);
        dir.add_direct("DIRECT-1".to_string(), a);
        assert!(dir.has_direct("DIRECT-1"));

        let link = dir.take_direct("DIRECT-1").unwrap();
        link.send_packet(&mesh_wire::Packet::Ack(mesh_wire::AckPacket::ok()))
            .await
            .unwrap();
        assert!(b.recv_packet().await.is_ok());
        assert!(!dir.has_direct("DIRECT-1"));
        assert!(dir.take_direct("DIRECT-1").is_none());
    }

    #[test]
    fn test_relay_directory() {
        let dir = RelayDirectory::new();
        let group = Rendezvous {
            name: "DIRECT-1".to_string(),
            passphrase: "p".to_string(),
            band: Band::Any,
            endpoint: "mem://DIRECT-1".to_string(),
            owner: Uuid::new_v4(),
        };
        dir.host(Capability::WifiDirect, group.clone());
        // Own groups are never learned back.
        dir.learn(Capability::WifiDirect, group.clone());
        assert!(dir.learned().is_empty());
        assert!(dir.is_hosted("DIRECT-1"));

        let luid = Uuid::new_v4();
        dir.announce(luid, group.clone());
        dir.announce(luid, group.clone());
        assert_eq!(dir.announced_by(&luid), vec![group.clone()]);

        dir.unhost("DIRECT-1");
        assert!(dir.hosted().is_empty());
        dir.learn(Capability::Lan, group.clone());
        assert_eq!(dir.learned(), vec![(Capability::Lan, group)]);
    }
}
