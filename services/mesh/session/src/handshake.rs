//! Handshake state machine and ack barrier.
//!
//! Each stage runs both role steps as separate tasks under the stage
//! timeout, merges their results, then meets the peer at the ack barrier.
//! A stage commits only if both sides acknowledge success; anything else
//! ends the session.

use crate::channel_pool::ChannelPool;
use crate::error::HandshakeError;
use crate::outcome::{StagePayload, TransactionResult};
use crate::session::{HandshakeReport, Session, SessionEvent};
use crate::stage::Stage;
use crate::steps;
use crate::upgrade;
use mesh_wire::AckPacket;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Drive a session from START to TERMINATE
pub async fn run_handshake(
    session: Arc<Session>,
    pool: ChannelPool,
) -> Result<HandshakeReport, HandshakeError> {
    info!(
        "Starting handshake with {} over {}",
        session.remote,
        session.link().describe()
    );

    let mut stage = Stage::Start;
    let mut failure = None;

    while !stage.is_terminal() {
        session.state().stage = Some(stage);

        let channel = match pool.acquire(&session.remote).await {
            Ok(channel) => channel,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        session.lock_gate();

        let outcome = match steps::prepare(&session, stage) {
            Ok(()) => run_stage(&session, stage).await,
            Err(e) => TransactionResult::failed(e),
        };
        let barrier = ack_barrier(&session, stage, &outcome).await;

        session.unlock_gate();
        drop(channel);

        if let Err(e) = barrier {
            if let Some(StagePayload::UpgradedLink(orphan)) = &outcome.payload {
                orphan.disconnect().await;
            }
            failure = Some(e);
            break;
        }

        if let Some(StagePayload::UpgradedLink(link)) = outcome.payload {
            let endpoint = link.describe();
            let bearer = link.bearer();
            session.swap_link(link).await;
            info!("{} upgraded to {} at {}", session.remote, bearer, endpoint);
            session
                .emit(SessionEvent::Upgraded {
                    remote: session.remote.clone(),
                    bearer,
                    endpoint,
                })
                .await;
        }

        let next = outcome.next_stage.unwrap_or_else(|| stage.next());
        session.state().stats.stages_completed += 1;
        info!("{} stage {} complete, next {}", session.remote, stage, next);
        session
            .emit(SessionEvent::StageCompleted {
                remote: session.remote.clone(),
                stage,
                next,
            })
            .await;
        stage = next;
    }

    terminate(&session, stage, failure).await
}

async fn run_stage(session: &Arc<Session>, stage: Stage) -> TransactionResult {
    debug!("{} running stage {}", session.remote, stage);

    let initiator = tokio::spawn(steps::initiator_step(session.clone(), stage));
    let acceptor = tokio::spawn(steps::acceptor_step(session.clone(), stage));
    let (initiator_abort, acceptor_abort) = (initiator.abort_handle(), acceptor.abort_handle());

    match timeout(session.config().stage_timeout, async {
        tokio::join!(initiator, acceptor)
    })
    .await
    {
        Ok((initiator, acceptor)) => joined(initiator).merge(joined(acceptor)),
        Err(_) => {
            warn!("{} stage {} timed out", session.remote, stage);
            initiator_abort.abort();
            acceptor_abort.abort();
            TransactionResult::failed(HandshakeError::StageTimeout(stage))
        }
    }
}

fn joined(result: Result<TransactionResult, JoinError>) -> TransactionResult {
    result.unwrap_or_else(|e| TransactionResult::failed(HandshakeError::Task(e.to_string())))
}

/// Exchange acks for `stage`; succeeds only if both sides succeeded
async fn ack_barrier(
    session: &Session,
    stage: Stage,
    outcome: &TransactionResult,
) -> Result<(), HandshakeError> {
    let ack = match &outcome.error {
        None => AckPacket::ok(),
        Some(e) => AckPacket::failure(e.ack_status(), e.to_string()),
    };
    let sent = session.send(ack).await;

    if let Some(e) = &outcome.error {
        return Err(e.clone());
    }
    sent?;

    let peer = timeout(session.config().ack_timeout, session.await_peer_ack(stage))
        .await
        .map_err(|_| HandshakeError::StageTimeout(stage))??;

    if !peer.success {
        return Err(HandshakeError::PeerFailed {
            status: peer.status,
            message: peer.message.unwrap_or_default(),
        });
    }
    debug!("{} passed {} barrier", session.remote, stage);
    Ok(())
}

async fn terminate(
    session: &Session,
    stage: Stage,
    failure: Option<HandshakeError>,
) -> Result<HandshakeReport, HandshakeError> {
    session.state().stage = Some(Stage::Terminate);
    upgrade::teardown(session).await;
    session.link().disconnect().await;

    match &failure {
        None => info!("Handshake with {} complete", session.remote),
        Some(e) => error!("Handshake with {} failed in {}: {}", session.remote, stage, e),
    }
    session
        .emit(SessionEvent::Terminated {
            remote: session.remote.clone(),
            stage,
            error: failure.clone(),
        })
        .await;

    match failure {
        None => Ok(session.report()),
        Some(e) => Err(e),
    }
}
