//! Handshake stages and their default progression.

use std::fmt;

/// Handshake stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Exchange LUID commitments
    Start,
    /// Reveal LUIDs
    Luid,
    /// Exchange capability advertisements
    Advertise,
    /// Exchange election commitments
    ElectionHashed,
    /// Reveal election bodies and decide roles
    Election,
    /// Move to the elected bearer
    Upgrade,
    /// Pass on relays and announce hosted groups over the new bearer
    Announce,
    /// Exchange signed identities
    Identity,
    /// Exchange held message hashes
    DeclareHashes,
    /// Transfer messages the peer lacks
    BlockData,
    /// Session over
    Terminate,
}

impl Stage {
    /// Stage that follows when no step overrides it
    pub fn next(self) -> Stage {
        match self {
            Stage::Start => Stage::Luid,
            Stage::Luid => Stage::Advertise,
            Stage::Advertise => Stage::ElectionHashed,
            Stage::ElectionHashed => Stage::Election,
            Stage::Election => Stage::Upgrade,
            Stage::Upgrade => Stage::Announce,
            Stage::Announce => Stage::Identity,
            Stage::Identity => Stage::DeclareHashes,
            Stage::DeclareHashes => Stage::BlockData,
            Stage::BlockData | Stage::Terminate => Stage::Terminate,
        }
    }

    /// Whether the stage ends the session
    pub fn is_terminal(self) -> bool {
        self == Stage::Terminate
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "START",
            Stage::Luid => "LUID",
            Stage::Advertise => "ADVERTISE",
            Stage::ElectionHashed => "ELECTION_HASHED",
            Stage::Election => "ELECTION",
            Stage::Upgrade => "UPGRADE",
            Stage::Announce => "ANNOUNCE",
            Stage::Identity => "IDENTITY",
            Stage::DeclareHashes => "DECLARE_HASHES",
            Stage::BlockData => "BLOCK_DATA",
            Stage::Terminate => "TERMINATE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progression_reaches_terminate() {
        let mut stage = Stage::Start;
        let mut visited = vec![stage];
        while !stage.is_terminal() {
            stage = stage.next();
            visited.push(stage);
        }
        assert_eq!(visited.len(), 11);
        assert_eq!(Stage::Terminate.next(), Stage::Terminate);
    }
}
