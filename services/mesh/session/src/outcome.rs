//! Per-step results and how the two role steps of a stage merge.

use crate::error::HandshakeError;
use crate::stage::Stage;
use crate::transport::Link;

/// Data a step hands to the state machine
#[derive(Debug, Clone)]
pub enum StagePayload {
    /// Link on the upgraded bearer, swapped in after the barrier
    UpgradedLink(Link),
}

/// Result of one role step
#[derive(Debug, Clone, Default)]
pub struct TransactionResult {
    /// Step output
    pub payload: Option<StagePayload>,
    /// Step failure
    pub error: Option<HandshakeError>,
    /// Stage the step wants next
    pub next_stage: Option<Stage>,
}

impl TransactionResult {
    /// Successful step with no opinion on the next stage
    pub fn done() -> Self {
        Self::default()
    }

    /// Successful step naming the next stage
    pub fn advance(next: Stage) -> Self {
        Self {
            next_stage: Some(next),
            ..Self::default()
        }
    }

    /// Failed step
    pub fn failed(error: HandshakeError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: StagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether the step succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Merge the two role results of a stage.
    ///
    /// The first error wins. Two different next stages are a conflict.
    /// Otherwise each field keeps whichever side set it, `self` first.
    pub fn merge(self, other: TransactionResult) -> TransactionResult {
        let error = self.error.or(other.error);
        let payload = self.payload.or(other.payload);

        let (next_stage, error) = match (self.next_stage, other.next_stage) {
            (Some(a), Some(b)) if a != b => {
                (None, error.or(Some(HandshakeError::ProtocolConflict(a, b))))
            }
            (a, b) => (a.or(b), error),
        };

        TransactionResult {
            payload,
            error,
            next_stage,
        }
    }
}

impl From<Result<TransactionResult, HandshakeError>> for TransactionResult {
    fn from(result: Result<TransactionResult, HandshakeError>) -> Self {
        result.unwrap_or_else(TransactionResult::failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_link_pair;
    use mesh_wire::Capability;

    #[test]
    fn test_first_error_wins() {
        let a = TransactionResult::failed(HandshakeError::InvalidLuid);
        let b = TransactionResult::failed(HandshakeError::ElectionDegenerate);
        assert_eq!(a.merge(b).error, Some(HandshakeError::InvalidLuid));

        let a = TransactionResult::advance(Stage::Luid);
        let b = TransactionResult::failed(HandshakeError::ElectionDegenerate);
        let merged = a.merge(b);
        assert_eq!(merged.error, Some(HandshakeError::ElectionDegenerate));
        assert_eq!(merged.next_stage, Some(Stage::Luid));
    }

    #[test]
    fn test_conflicting_next_stage() {
        let merged = TransactionResult::advance(Stage::Upgrade)
            .merge(TransactionResult::advance(Stage::Identity));
        assert_eq!(
            merged.error,
            Some(HandshakeError::ProtocolConflict(Stage::Upgrade, Stage::Identity))
        );
        assert_eq!(merged.next_stage, None);
    }

    #[tokio::test]
    async fn test_union_of_fields() {
        let (link, _peer) = memory_link_pair(Capability::WifiDirect, 1024, 64);
        let merged = TransactionResult::done()
            .with_payload(StagePayload::UpgradedLink(link))
            .merge(TransactionResult::advance(Stage::Identity));
        assert!(merged.is_ok());
        assert_eq!(merged.next_stage, Some(Stage::Identity));
        assert!(matches!(merged.payload, Some(StagePayload::UpgradedLink(_))));

        let same = TransactionResult::advance(Stage::Luid).merge(TransactionResult::advance(Stage::Luid));
        assert_eq!(same.next_stage, Some(Stage::Luid));
        assert!(same.is_ok());
    }
}
