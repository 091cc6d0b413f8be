//! Identity, declared-hash and block-data stages.

use crate::error::HandshakeError;
use crate::outcome::TransactionResult;
use crate::session::Session;
use crate::stage::Stage;
use futures::StreamExt;
use mesh_wire::{
    BlockHeaderPacket, BlockSequencePacket, DeclareHashesPacket, IdentityPacket, Reassembler,
};
use tracing::{debug, info, warn};

/// Send our identity and a random batch of known ones, then the end marker
pub(crate) async fn send_identities(session: &Session) -> Result<TransactionResult, HandshakeError> {
    session.send(session.ctx().profile.identity()).await?;

    let batch = session.config().identity_batch;
    let mut known = session.ctx().store.top_random_identities(batch).await;
    while let Some(identity) = known.next().await {
        session.send(identity).await?;
    }
    session.send(IdentityPacket::end_marker()).await?;
    Ok(TransactionResult::done())
}

/// Take identities until the end marker; bad self-signatures are skipped
pub(crate) async fn receive_identities(
    session: &Session,
) -> Result<TransactionResult, HandshakeError> {
    loop {
        let identity: IdentityPacket = session.expect(Stage::Identity).await?;
        if identity.end {
            break;
        }
        if !identity.verify() {
            warn!(
                "{} sent identity {} with a bad self-signature, skipping",
                session.remote,
                identity.fingerprint()
            );
            session.state().stats.identities_rejected += 1;
            continue;
        }
        if session.ctx().store.insert_identity(identity).await? {
            session.state().stats.identities_received += 1;
        }
    }
    Ok(TransactionResult::advance(Stage::DeclareHashes))
}

/// Tell the peer which messages we hold, or opt out of content
pub(crate) async fn send_declared(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let declared = if session.config().accept_content {
        session.ctx().store.declare_hashes_snapshot().await
    } else {
        DeclareHashesPacket::opt_out()
    };
    debug!(
        "{} declaring {} hashes (opt_out={})",
        session.remote,
        declared.hashes.len(),
        declared.opt_out
    );
    session.send(declared).await?;
    Ok(TransactionResult::done())
}

/// Cache the peer's declaration for the block stage
pub(crate) async fn receive_declared(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let declared: DeclareHashesPacket = session.expect(Stage::DeclareHashes).await?;
    session.state().remote_declared = Some(declared);
    Ok(TransactionResult::advance(Stage::BlockData))
}

/// Stream messages the peer lacks, then an end-of-stream header
pub(crate) async fn send_blocks(session: &Session) -> Result<TransactionResult, HandshakeError> {
    let declared = session.state().remote_declared.clone().unwrap_or_default();

    if !declared.opt_out {
        let batch = session.config().message_batch;
        let mut messages = session
            .ctx()
            .store
            .top_random_messages(batch, &declared.hashes)
            .await;
        while let Some(message) = messages.next().await {
            let blocks = message.blocks();
            session.send(message.header).await?;
            for block in blocks {
                session.send(block).await?;
            }
            session.state().stats.messages_sent += 1;
        }
    }

    session.send(BlockHeaderPacket::end_of_stream()).await?;
    Ok(TransactionResult::done())
}

/// Reassemble and store messages until the end-of-stream header.
///
/// A block that fails its hash check fails the stage. A header that names
/// an author must carry a signature, and when the author is known the
/// signature must hold; otherwise the message is dropped.
pub(crate) async fn receive_blocks(session: &Session) -> Result<TransactionResult, HandshakeError> {
    loop {
        let header: BlockHeaderPacket = session.expect(Stage::BlockData).await?;
        if header.is_end_of_stream() {
            break;
        }

        let mut reassembler =
            Reassembler::with_limit(&header, session.config().max_message_size)?;
        let content = loop {
            let block: BlockSequencePacket = session.expect(Stage::BlockData).await?;
            if let Some(content) = reassembler.push(block)? {
                break content;
            }
        };

        if !signature_holds(session, &header).await {
            warn!(
                "{} sent message with a bad signature from {:?}, dropping",
                session.remote, header.from
            );
            session.state().stats.messages_rejected += 1;
            continue;
        }

        if !session.config().accept_content {
            continue;
        }
        if session.ctx().store.insert_message(header, content).await? {
            session.state().stats.messages_received += 1;
        }
    }

    let received = session.state().stats.messages_received;
    info!("{} block stage done, {} new messages", session.remote, received);
    Ok(TransactionResult::advance(Stage::Terminate))
}

async fn signature_holds(session: &Session, header: &BlockHeaderPacket) -> bool {
    let Some(from) = header.from.as_ref() else {
        return true;
    };
    if header.signature.is_none() {
        return false;
    }
    match session.ctx().store.find_identity(from).await {
        Some(author) => header.verify_signature(&author.public_key),
        None => true,
    }
}
