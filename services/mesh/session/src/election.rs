//! Commit-reveal leader election.
//!
//! Every participant commits to a random tiebreaker and the bearer it votes
//! for, then reveals. All tiebreakers are multiplied together and hashed into
//! a seed; the participant whose tiebreaker lies closest to the seed wins and
//! becomes UKE. No single participant can steer the seed without knowing the
//! other tiebreakers in advance, which the commitment round prevents.

use crate::error::HandshakeError;
use bytes::Bytes;
use mesh_crypto::generic_hash;
use mesh_wire::packet::SALT_SIZE;
use mesh_wire::{Band, Capability, ElectLeaderPacket, ElectionReveal, Role};
use num_bigint::BigUint;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

/// What the local peer brings to an election
#[derive(Debug, Clone)]
pub struct LocalVote {
    /// Bearer voted for
    pub provides: Capability,
    /// Role held in other encounters
    pub role: Role,
    /// Preferred band
    pub band: Band,
    /// Roles demanded for specific LUIDs if the local peer wins
    pub force: BTreeMap<Uuid, Role>,
    /// LUIDs dropped from the group if the local peer wins
    pub remove: BTreeMap<Uuid, Role>,
}

impl LocalVote {
    /// Plain vote with no hints
    pub fn new(provides: Capability) -> Self {
        Self {
            provides,
            role: Role::Seme,
            band: Band::Any,
            force: BTreeMap::new(),
            remove: BTreeMap::new(),
        }
    }
}

/// Election decision as seen by the local peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    /// LUID of the winner
    pub winner: Uuid,
    /// Bearer to upgrade to
    pub capability: Capability,
    /// Band the winner prefers
    pub band: Band,
    /// Local role
    pub role: Role,
    /// The winner removed a participant, so no upgrade happens
    pub skip_upgrade: bool,
}

/// Per-session election record, local entries first
#[derive(Debug, Clone)]
pub struct ElectionState {
    local: ElectionReveal,
    hashed: Vec<Bytes>,
    revealed: Vec<ElectionReveal>,
}

impl ElectionState {
    /// Draw a salt and tiebreaker and record the local commitment and reveal
    pub fn new(luid: Uuid, vote: LocalVote) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let local = ElectionReveal {
            salt: Bytes::from(salt),
            tiebreaker: Uuid::new_v4(),
            luid,
            provides: vote.provides,
            role: vote.role,
            band: vote.band,
            force: vote.force,
            remove: vote.remove,
        };
        Self {
            hashed: vec![Bytes::copy_from_slice(&local.commitment())],
            revealed: vec![local.clone()],
            local,
        }
    }

    /// Local reveal body
    pub fn local(&self) -> &ElectionReveal {
        &self.local
    }

    /// Commitment packet for the local reveal
    pub fn local_commit(&self) -> ElectLeaderPacket {
        ElectLeaderPacket::commit(&self.local)
    }

    /// Reveal packet for the local body
    pub fn local_reveal(&self) -> ElectLeaderPacket {
        ElectLeaderPacket::Revealed(self.local.clone())
    }

    /// Record a peer's commitment
    pub fn record_hashed(&mut self, hash: Bytes) {
        self.hashed.push(hash);
    }

    /// Record a peer's reveal
    pub fn record_revealed(&mut self, reveal: ElectionReveal) {
        self.revealed.push(reveal);
    }

    /// Every reveal must match the commitment received in the same position
    pub fn verify(&self) -> Result<(), HandshakeError> {
        if self.hashed.len() != self.revealed.len() {
            return Err(HandshakeError::ElectionVerification);
        }
        let all_match = self
            .hashed
            .iter()
            .zip(&self.revealed)
            .all(|(hash, reveal)| hash.as_ref() == reveal.commitment().as_slice());
        if all_match {
            Ok(())
        } else {
            Err(HandshakeError::ElectionVerification)
        }
    }

    /// Verify, then decide winner, bearer and local role
    pub fn decide(&self) -> Result<ElectionOutcome, HandshakeError> {
        self.verify()?;

        let ranking = rank(&self.revealed)?;
        let winner = &self.revealed[ranking[0]];
        let capability = elect_capability(&self.revealed, &ranking);

        let local_luid = self.local.luid;
        let mut role = if winner.luid == local_luid {
            Role::Uke
        } else if self.local.role == Role::Uke {
            Role::SuperSeme
        } else {
            Role::Seme
        };
        if let Some(forced) = winner.force.get(&local_luid) {
            role = *forced;
        }

        let skip_upgrade = self
            .revealed
            .iter()
            .any(|r| r.luid != winner.luid && winner.remove.contains_key(&r.luid));

        debug!(
            "Election decided: winner={} capability={} role={:?} skip_upgrade={}",
            winner.luid, capability, role, skip_upgrade
        );

        Ok(ElectionOutcome {
            winner: winner.luid,
            capability,
            band: winner.band,
            role,
            skip_upgrade,
        })
    }
}

/// Seed derived from every tiebreaker
pub fn election_seed(reveals: &[ElectionReveal]) -> BigUint {
    let product = reveals
        .iter()
        .fold(BigUint::from(1u8), |acc, r| acc * tiebreaker_value(r));
    BigUint::from_bytes_be(&generic_hash(&product.to_bytes_be()))
}

fn tiebreaker_value(reveal: &ElectionReveal) -> BigUint {
    BigUint::from_bytes_be(reveal.tiebreaker.as_bytes())
}

fn distance(a: &BigUint, b: &BigUint) -> BigUint {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// Indices of `reveals` ordered by distance to the seed, winner first.
///
/// Fails when the closest distance is shared.
pub fn rank(reveals: &[ElectionReveal]) -> Result<Vec<usize>, HandshakeError> {
    if reveals.is_empty() {
        return Err(HandshakeError::ElectionDegenerate);
    }
    let seed = election_seed(reveals);
    let distances: Vec<BigUint> = reveals
        .iter()
        .map(|r| distance(&tiebreaker_value(r), &seed))
        .collect();

    let mut order: Vec<usize> = (0..reveals.len()).collect();
    // Ties past first place are broken by tiebreaker so every peer agrees.
    order.sort_by(|&a, &b| {
        distances[a]
            .cmp(&distances[b])
            .then_with(|| reveals[a].tiebreaker.cmp(&reveals[b].tiebreaker))
    });

    if order.len() > 1 && distances[order[0]] == distances[order[1]] {
        return Err(HandshakeError::ElectionDegenerate);
    }
    Ok(order)
}

/// Majority vote over the revealed bearers.
///
/// When several bearers share the top count, the vote of the best-ranked
/// participant among them decides.
pub fn elect_capability(reveals: &[ElectionReveal], ranking: &[usize]) -> Capability {
    let mut counts: HashMap<Capability, usize> = HashMap::new();
    for reveal in reveals {
        *counts.entry(reveal.provides).or_default() += 1;
    }
    let top = counts.values().copied().max().unwrap_or(0);

    ranking
        .iter()
        .map(|&i| reveals[i].provides)
        .find(|c| counts.get(c) == Some(&top))
        .unwrap_or(reveals[ranking[0]].provides)
}

/// The local vote: most preferred local capability the peer also advertised
pub fn preferred_capability(local: &[Capability], peer: &[Capability]) -> Option<Capability> {
    local.iter().copied().find(|c| peer.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reveal(tiebreaker: Uuid, provides: Capability) -> ElectionReveal {
        ElectionReveal {
            salt: Bytes::from(vec![7u8; SALT_SIZE]),
            tiebreaker,
            luid: Uuid::new_v4(),
            provides,
            role: Role::Seme,
            band: Band::Any,
            force: BTreeMap::new(),
            remove: BTreeMap::new(),
        }
    }

    fn pair(local: Capability, remote: Capability) -> (ElectionState, ElectionState) {
        let mut a = ElectionState::new(Uuid::new_v4(), LocalVote::new(local));
        let mut b = ElectionState::new(Uuid::new_v4(), LocalVote::new(remote));
        let (ah, bh) = (a.local_commit().commitment(), b.local_commit().commitment());
        a.record_hashed(bh);
        b.record_hashed(ah);
        let (ar, br) = (a.local().clone(), b.local().clone());
        a.record_revealed(br);
        b.record_revealed(ar);
        (a, b)
    }

    #[test]
    fn test_two_peers_agree() {
        let (a, b) = pair(Capability::WifiDirect, Capability::WifiDirect);
        let oa = a.decide().unwrap();
        let ob = b.decide().unwrap();

        assert_eq!(oa.winner, ob.winner);
        assert_eq!(oa.capability, Capability::WifiDirect);
        let roles = [oa.role, ob.role];
        assert!(roles.contains(&Role::Uke));
        assert!(roles.contains(&Role::Seme));
    }

    #[test]
    fn test_split_vote_goes_to_winner() {
        let (a, b) = pair(Capability::WifiDirect, Capability::Ble);
        let oa = a.decide().unwrap();
        let ob = b.decide().unwrap();
        assert_eq!(oa.capability, ob.capability);
        let winner_vote = if oa.role == Role::Uke {
            a.local().provides
        } else {
            b.local().provides
        };
        assert_eq!(oa.capability, winner_vote);
    }

    #[test]
    fn test_order_independent() {
        let reveals: Vec<_> = (0..5)
            .map(|_| reveal(Uuid::new_v4(), Capability::Ble))
            .collect();
        let forward = rank(&reveals).unwrap();
        let mut reversed = reveals.clone();
        reversed.reverse();
        let backward = rank(&reversed).unwrap();
        assert_eq!(
            reveals[forward[0]].tiebreaker,
            reversed[backward[0]].tiebreaker
        );
    }

    #[test]
    fn test_identical_tiebreakers_degenerate() {
        let t = Uuid::new_v4();
        let reveals = vec![reveal(t, Capability::Ble), reveal(t, Capability::Lan)];
        assert_eq!(rank(&reveals), Err(HandshakeError::ElectionDegenerate));
    }

    #[test]
    fn test_majority_beats_winner() {
        let reveals = vec![
            reveal(Uuid::new_v4(), Capability::Lan),
            reveal(Uuid::new_v4(), Capability::WifiDirect),
            reveal(Uuid::new_v4(), Capability::WifiDirect),
        ];
        let ranking = rank(&reveals).unwrap();
        assert_eq!(elect_capability(&reveals, &ranking), Capability::WifiDirect);
    }

    #[test]
    fn test_three_way_tie_follows_ranking() {
        let reveals = vec![
            reveal(Uuid::new_v4(), Capability::Lan),
            reveal(Uuid::new_v4(), Capability::WifiDirect),
            reveal(Uuid::new_v4(), Capability::Ble),
        ];
        let ranking = rank(&reveals).unwrap();
        assert_eq!(
            elect_capability(&reveals, &ranking),
            reveals[ranking[0]].provides
        );
    }

    #[test]
    fn test_tampered_reveal_fails() {
        let (mut a, _) = pair(Capability::WifiDirect, Capability::WifiDirect);
        a.revealed[1].provides = Capability::Lan;
        assert_eq!(a.decide(), Err(HandshakeError::ElectionVerification));

        let mut short = ElectionState::new(Uuid::new_v4(), LocalVote::new(Capability::Ble));
        short.record_hashed(Bytes::from_static(&[0u8; 32]));
        assert_eq!(short.verify(), Err(HandshakeError::ElectionVerification));
    }

    #[test]
    fn test_force_and_remove() {
        let (mut a, mut b) = pair(Capability::WifiDirect, Capability::WifiDirect);
        let outcome = a.decide().unwrap();
        let (winner, loser) = if outcome.role == Role::Uke {
            (&mut a, &mut b)
        } else {
            (&mut b, &mut a)
        };
        let loser_luid = loser.local().luid;

        // Rebuild the winner's reveal with a force entry and replay it to the loser.
        winner.local.force.insert(loser_luid, Role::SuperSeme);
        winner.local.remove.insert(loser_luid, Role::Seme);
        let body = winner.local.clone();
        loser.hashed[1] = Bytes::copy_from_slice(&body.commitment());
        loser.revealed[1] = body;

        let seen = loser.decide().unwrap();
        assert_eq!(seen.role, Role::SuperSeme);
        assert!(seen.skip_upgrade);
    }

    #[test]
    fn test_uke_hint_promotes_loser() {
        let mut vote = LocalVote::new(Capability::WifiDirect);
        vote.role = Role::Uke;
        let mut a = ElectionState::new(Uuid::new_v4(), vote);
        let mut b = ElectionState::new(Uuid::new_v4(), LocalVote::new(Capability::WifiDirect));
        a.record_hashed(b.local_commit().commitment());
        b.record_hashed(a.local_commit().commitment());
        let (ar, br) = (a.local().clone(), b.local().clone());
        a.record_revealed(br);
        b.record_revealed(ar);

        let oa = a.decide().unwrap();
        if oa.role != Role::Uke {
            assert_eq!(oa.role, Role::SuperSeme);
        }
    }

    #[test]
    fn test_preferred_capability() {
        let local = [Capability::WifiDirect, Capability::Ble];
        assert_eq!(
            preferred_capability(&local, &[Capability::Ble, Capability::WifiDirect]),
            Some(Capability::WifiDirect)
        );
        assert_eq!(preferred_capability(&local, &[Capability::Lan]), None);
    }
}
