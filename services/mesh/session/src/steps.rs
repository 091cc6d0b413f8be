//! Role steps for every stage.
//!
//! Both peers run both steps of each stage at once: the acceptor step emits
//! the local side's packets, the initiator step consumes the peer's.

use crate::content;
use crate::election::{preferred_capability, ElectionState, LocalVote};
use crate::error::HandshakeError;
use crate::luid::verify_luid;
use crate::outcome::TransactionResult;
use crate::session::Session;
use crate::stage::Stage;
use crate::upgrade;
use mesh_wire::{AdvertisePacket, ElectLeaderPacket, LuidPacket, PROTOCOL_VERSION};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consume the peer's packets for `stage`
pub(crate) async fn initiator_step(session: Arc<Session>, stage: Stage) -> TransactionResult {
    let session = session.as_ref();
    let result = match stage {
        Stage::Start => receive_luid_commitment(session).await,
        Stage::Luid => receive_luid(session).await,
        Stage::Advertise => receive_advertise(session).await,
        Stage::ElectionHashed => receive_commitment(session).await,
        Stage::Election => receive_reveal(session).await,
        Stage::Upgrade => upgrade::initiator_step(session).await,
        Stage::Announce => upgrade::receive_announce(session).await,
        Stage::Identity => content::receive_identities(session).await,
        Stage::DeclareHashes => content::receive_declared(session).await,
        Stage::BlockData => content::receive_blocks(session).await,
        Stage::Terminate => Ok(TransactionResult::done()),
    };
    result.into()
}

/// Emit the local packets for `stage`
pub(crate) async fn acceptor_step(session: Arc<Session>, stage: Stage) -> TransactionResult {
    let session = session.as_ref();
    let result = match stage {
        Stage::Start => send_luid_commitment(session).await,
        Stage::Luid => send_luid(session).await,
        Stage::Advertise => send_advertise(session).await,
        Stage::ElectionHashed => send_commitment(session).await,
        Stage::Election => send_reveal(session).await,
        Stage::Upgrade => upgrade::acceptor_step(session).await,
        Stage::Announce => upgrade::send_announce(session).await,
        Stage::Identity => content::send_identities(session).await,
        Stage::DeclareHashes => content::send_declared(session).await,
        Stage::BlockData => content::send_blocks(session).await,
        Stage::Terminate => Ok(TransactionResult::done()),
    };
    result.into()
}

/// Local setup that must happen before a stage's steps start
pub(crate) fn prepare(session: &Session, stage: Stage) -> Result<(), HandshakeError> {
    match stage {
        Stage::ElectionHashed => prepare_vote(session),
        Stage::Announce => upgrade::prepare_announce(session),
        _ => Ok(()),
    }
}

fn prepare_vote(session: &Session) -> Result<(), HandshakeError> {
    let profile = &session.ctx().profile;
    let link_bearer = session.link().bearer();
    let mut state = session.state();

    let peer = state
        .remote_advertise
        .as_ref()
        .map(|a| a.capabilities.clone())
        .unwrap_or_default();
    // With nothing in common the vote stays on the discovery bearer.
    let provides = preferred_capability(&profile.capabilities, &peer).unwrap_or(link_bearer);

    let vote = LocalVote {
        provides,
        role: profile.role_hint,
        band: profile.band,
        force: profile.force.clone(),
        remove: profile.remove.clone(),
    };
    debug!("{} voting for {}", session.remote, provides);
    state.election = Some(ElectionState::new(session.local_luid, vote));
    Ok(())
}

async fn send_luid_commitment(session: &Session) -> Result<TransactionResult, HandshakeError> {
    session.send(LuidPacket::hashed(session.local_luid_hash())).await?;
    Ok(TransactionResult::done())
}

async fn receive_luid_commitment(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet: LuidPacket = session.expect(Stage::Start).await?;
    let LuidPacket::Hashed { hash } = packet else {
        return Err(HandshakeError::InvalidLuid);
    };
    if let Some(advertised) = session.link().advertised_luid {
        if hash.as_ref() != advertised.as_slice() {
            warn!("{} commitment differs from discovery advertisement", session.remote);
            return Err(HandshakeError::InvalidLuid);
        }
    }
    session.state().remote_luid_hash = Some(hash);
    Ok(TransactionResult::advance(Stage::Luid))
}

async fn send_luid(session: &Session) -> Result<TransactionResult, HandshakeError> {
    session.send(LuidPacket::clear(session.local_luid)).await?;
    Ok(TransactionResult::done())
}

async fn receive_luid(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet: LuidPacket = session.expect(Stage::Luid).await?;
    let LuidPacket::Clear { luid, version } = packet else {
        return Err(HandshakeError::InvalidLuid);
    };
    if version != PROTOCOL_VERSION {
        warn!(
            "{} speaks protocol version {}, ours is {}",
            session.remote, version, PROTOCOL_VERSION
        );
    }

    let commitment = session.state().remote_luid_hash.clone().unwrap_or_default();
    verify_luid(&commitment, &luid)?;
    if luid == session.local_luid {
        return Err(HandshakeError::InvalidLuid);
    }
    session.state().remote_luid = Some(luid);
    Ok(TransactionResult::advance(Stage::Advertise))
}

async fn send_advertise(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let capabilities = session.ctx().profile.capabilities.clone();
    session.send(AdvertisePacket::new(capabilities)).await?;
    Ok(TransactionResult::done())
}

async fn receive_advertise(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet: AdvertisePacket = session.expect(Stage::Advertise).await?;
    debug!("{} advertises {:?}", session.remote, packet.capabilities);
    session.state().remote_advertise = Some(packet);
    Ok(TransactionResult::advance(Stage::ElectionHashed))
}

fn election_packet(
    session: &Session,
    pick: impl FnOnce(&ElectionState) -> ElectLeaderPacket,
) -> Result<ElectLeaderPacket, HandshakeError> {
    session
        .state()
        .election
        .as_ref()
        .map(pick)
        .ok_or_else(|| HandshakeError::Task("election not prepared".to_string()))
}

async fn send_commitment(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet = election_packet(session, ElectionState::local_commit)?;
    session.send(packet).await?;
    Ok(TransactionResult::done())
}

async fn receive_commitment(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet: ElectLeaderPacket = session.expect(Stage::ElectionHashed).await?;
    let ElectLeaderPacket::Hashed { hash } = packet else {
        return Err(HandshakeError::ElectionVerification);
    };
    record(session, |e| e.record_hashed(hash))?;
    Ok(TransactionResult::advance(Stage::Election))
}

async fn send_reveal(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet = election_packet(session, ElectionState::local_reveal)?;
    session.send(packet).await?;
    Ok(TransactionResult::done())
}

async fn receive_reveal(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let packet: ElectLeaderPacket = session.expect(Stage::Election).await?;
    let ElectLeaderPacket::Revealed(reveal) = packet else {
        return Err(HandshakeError::ElectionVerification);
    };
    if Some(reveal.luid) != session.state().remote_luid {
        return Err(HandshakeError::InvalidLuid);
    }

    let link_bearer = session.link().bearer();
    let mut state = session.state();
    let election = state
        .election
        .as_mut()
        .ok_or_else(|| HandshakeError::Task("election not prepared".to_string()))?;
    election.record_revealed(reveal);
    let outcome = election.decide()?;

    let next = if outcome.skip_upgrade || outcome.capability == link_bearer {
        Stage::Identity
    } else {
        Stage::Upgrade
    };
    info!(
        "{} elected {} as {:?}, next {}",
        session.remote, outcome.capability, outcome.role, next
    );
    state.outcome = Some(outcome);
    Ok(TransactionResult::advance(next))
}

fn record(
    session: &Session,
    apply: impl FnOnce(&mut ElectionState),
) -> Result<(), HandshakeError> {
    let mut state = session.state();
    let election = state
        .election
        .as_mut()
        .ok_or_else(|| HandshakeError::Task("election not prepared".to_string()))?;
    apply(election);
    Ok(())
}
