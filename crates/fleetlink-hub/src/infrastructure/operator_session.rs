//! App-side (operator) session loop.
//!
//! One operator socket targets one instance. The session:
//!
//! - subscribes to the instance's broadcast frames and its disconnect
//!   notification,
//! - forwards subscribed frames to the operator socket,
//! - reads operator frames and routes them with topic-gated command
//!   forwarding: `command` frames on the recognized sub-channels
//!   (`control`, `engine`, `motion`) pass through the claim gate; `peer`
//!   frames are relayed unconditionally; everything else is dropped.
//!
//! The claim is acquired lazily on the first gated command and held as a
//! scoped guard for the rest of the session, so release is guaranteed on
//! every exit path — clean close, socket error, or panic — without any
//! session-local bookkeeping flag.
//!
//! Rejections (`claim_conflict`, `not_connected`, `peer_send_failure`) come
//! back to the operator as typed `error`-kind frames; they never close the
//! operator's socket.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleetlink_core::{
    decode_frame, encode_frame, Frame, InstanceId, MessageKind, RejectCode, SessionId, Topic,
};

use crate::application::{ClaimGuard, MessageRouter, RouterError};
use crate::infrastructure::ws_server::HubState;

/// Write half of the operator socket, shared between the forward task and
/// the reader's rejection replies.
type SharedSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, WsMessage>>>;

/// Runs the complete lifecycle of one operator socket.
pub async fn run(
    ws_stream: WebSocketStream<TcpStream>,
    instance_id: InstanceId,
    state: HubState,
) -> anyhow::Result<()> {
    let router = state.router.clone();
    let session: SessionId = Uuid::new_v4();

    let (frame_tx, frame_rx) = mpsc::channel(state.config.channel.subscriber_queue);
    let (disconnect_tx, disconnect_rx) = mpsc::channel(state.config.channel.disconnect_queue);

    let frame_token = router.subscribe_frames(instance_id, frame_tx);
    let disconnect_token = router.subscribe_disconnect(instance_id, disconnect_tx);

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let ws_tx: SharedSink = Arc::new(Mutex::new(ws_tx));

    if frame_token.is_none() {
        // The instance is not connected; the subscription was a no-op. Tell
        // the operator with a typed rejection and keep the socket open so it
        // can observe further rejections deliberately.
        warn!("session {session}: instance {instance_id} is not connected");
        send_frame(
            &ws_tx,
            &Frame::rejection(
                Topic::Status,
                RejectCode::NotConnected,
                "instance has no live connection",
            ),
        )
        .await;
    }

    let mut forward_task = tokio::spawn(forward_to_operator(
        Arc::clone(&ws_tx),
        frame_rx,
        disconnect_rx,
        session,
    ));

    // The claim guard lives for the whole session once acquired; dropping it
    // below is the implicit release on every exit path.
    let mut claim: Option<ClaimGuard> = None;

    {
        let reader = read_operator_frames(
            &mut ws_rx,
            &ws_tx,
            &router,
            instance_id,
            session,
            &mut claim,
        );
        tokio::pin!(reader);
        tokio::select! {
            _ = &mut forward_task => debug!("session {session}: forward task ended"),
            _ = &mut reader => debug!("session {session}: reader ended"),
        }
    }
    forward_task.abort();

    // Teardown on every exit path: drop subscriptions, then the claim.
    if let Some(token) = frame_token {
        router.unsubscribe_frames(instance_id, token);
    }
    if let Some(token) = disconnect_token {
        router.unsubscribe_disconnect(instance_id, token);
    }
    drop(claim);

    info!("session {session}: operator for instance {instance_id} closed");
    Ok(())
}

/// Forwards subscribed frames to the operator; ends the session when the
/// instance disconnects.
async fn forward_to_operator(
    ws_tx: SharedSink,
    mut frame_rx: mpsc::Receiver<(InstanceId, Frame)>,
    mut disconnect_rx: mpsc::Receiver<InstanceId>,
    session: SessionId,
) {
    // A closed frame subscription is not by itself the end of the session:
    // teardown drops the frame senders before the disconnect notice is
    // delivered, and a session attached to an absent instance never had
    // live senders at all. Each closed channel just disables its branch.
    let mut frames_open = true;
    let mut disconnect_open = true;
    loop {
        tokio::select! {
            delivered = frame_rx.recv(), if frames_open => match delivered {
                Some((_, frame)) => {
                    if !send_frame(&ws_tx, &frame).await {
                        debug!("session {session}: operator socket send failed");
                        break;
                    }
                }
                None => frames_open = false,
            },
            gone = disconnect_rx.recv(), if disconnect_open => match gone {
                Some(instance_id) => {
                    info!("session {session}: instance {instance_id} disconnected");
                    send_frame(
                        &ws_tx,
                        &Frame::rejection(
                            Topic::Status,
                            RejectCode::InstanceDisconnected,
                            "instance connection closed",
                        ),
                    )
                    .await;
                    let mut sink = ws_tx.lock().await;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                None => disconnect_open = false,
            },
            else => {
                // Nothing left to forward and no notice coming; the session
                // now lives exactly as long as its reader, which aborts this
                // task on exit.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Reads operator frames and routes them until the socket closes.
async fn read_operator_frames(
    ws_rx: &mut SplitStream<WebSocketStream<TcpStream>>,
    ws_tx: &SharedSink,
    router: &MessageRouter,
    instance_id: InstanceId,
    session: SessionId,
    claim: &mut Option<ClaimGuard>,
) {
    while let Some(next) = ws_rx.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                debug!("session {session}: socket error: {e}");
                break;
            }
        };

        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Binary(_) => {
                warn!("session {session}: unexpected binary frame (ignored)");
                continue;
            }
            WsMessage::Close(_) => {
                debug!("session {session}: close frame received");
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        let frame = match decode_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("session {session}: malformed frame dropped: {e}");
                continue;
            }
        };

        match frame.kind {
            MessageKind::Command if frame.topic.is_command_topic() => {
                let topic = frame.topic;

                // Acquire the claim on first use and keep it for the session.
                if claim.is_none() {
                    match router.claim(instance_id, session) {
                        Ok(guard) => {
                            debug!("session {session}: claimed instance {instance_id}");
                            *claim = Some(guard);
                        }
                        Err(e) => {
                            send_rejection(ws_tx, topic, &e).await;
                            continue;
                        }
                    }
                }

                if let Err(e) = router.command(instance_id, frame, session).await {
                    send_rejection(ws_tx, topic, &e).await;
                }
            }
            MessageKind::Command => {
                // Unrecognized command sub-channel; deliberately ignored.
                debug!(
                    "session {session}: command on topic {:?} ignored",
                    frame.topic
                );
            }
            MessageKind::Peer => {
                // Peer traffic bypasses the claim gate.
                let topic = frame.topic;
                if let Err(e) = router.relay(instance_id, frame).await {
                    send_rejection(ws_tx, topic, &e).await;
                }
            }
            kind => {
                debug!("session {session}: {kind:?} frame dropped");
            }
        }
    }
}

/// Encodes and sends one frame to the operator; `true` on success.
async fn send_frame(ws_tx: &SharedSink, frame: &Frame) -> bool {
    let text = match encode_frame(frame) {
        Ok(text) => text,
        Err(e) => {
            error!("operator frame encode error: {e}");
            return false;
        }
    };
    let mut sink = ws_tx.lock().await;
    sink.send(WsMessage::Text(text)).await.is_ok()
}

/// Reports a router error back to the operator as a typed rejection frame.
async fn send_rejection(ws_tx: &SharedSink, topic: Topic, error: &RouterError) {
    let code = match error {
        RouterError::NotConnected(_) => RejectCode::NotConnected,
        RouterError::ClaimConflict(_) => RejectCode::ClaimConflict,
        RouterError::PeerSendFailure(_) => RejectCode::PeerSendFailure,
    };
    send_frame(ws_tx, &Frame::rejection(topic, code, error.to_string())).await;
}
