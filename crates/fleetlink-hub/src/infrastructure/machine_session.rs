//! Instance-side session loop.
//!
//! One machine socket = one registered connection. The session runs two
//! halves:
//!
//! - **Writer**: drains the connection's bounded outbound queue (filled by
//!   `command`/`relay`) and writes frames to the socket. The queue closing —
//!   which happens when the connection is deregistered — ends the writer and
//!   closes the socket, so the socket is released exactly once.
//! - **Reader**: decodes inbound text frames; `signal` and `peer` kinds are
//!   broadcast to the instance's subscribers, anything else is dropped.
//!   Frames are processed strictly in arrival order: each broadcast
//!   completes before the next frame is read.
//!
//! A malformed inbound frame is logged and skipped — never fatal to the
//! connection. Whichever half ends first, teardown deregisters the
//! connection exactly once, firing disconnect subscribers.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use fleetlink_core::{decode_frame, encode_frame, Frame, InstanceId, MessageKind};

use crate::application::MessageRouter;
use crate::infrastructure::ws_server::HubState;

/// Runs the complete lifecycle of one machine socket.
pub async fn run(
    ws_stream: WebSocketStream<TcpStream>,
    instance_id: InstanceId,
    state: HubState,
) -> anyhow::Result<()> {
    let router = state.router.clone();

    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.channel.outbound_queue);
    let handle = router.register_connection(instance_id, outbound_tx).await;
    info!(
        "machine {instance_id} registered ({} live)",
        router.connection_count()
    );

    let (ws_tx, ws_rx) = ws_stream.split();

    let writer_task = tokio::spawn(write_outbound(ws_tx, outbound_rx, instance_id));
    let reader_task = tokio::spawn(read_inbound(ws_rx, instance_id, router.clone()));

    // Whichever half ends first ends the session; the other is detached and
    // exits on its own once the connection is deregistered below.
    tokio::select! {
        _ = writer_task => debug!("machine {instance_id}: writer ended"),
        _ = reader_task => debug!("machine {instance_id}: reader ended"),
    }

    // A no-op here means this connection was already displaced by a
    // reconnect and the newcomer owns the registry entry now.
    if router.unregister_connection(handle).await {
        info!(
            "machine {instance_id} deregistered ({} live)",
            router.connection_count()
        );
    }
    Ok(())
}

/// Drains the outbound queue into the socket.
///
/// Returns when the queue closes (deregistration) or a write fails (peer
/// send failure — equivalent to a disconnect).
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    instance_id: InstanceId,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                error!("machine {instance_id}: encode error: {e}");
                continue;
            }
        };
        if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
            debug!("machine {instance_id}: socket write failed: {e}");
            return;
        }
    }
    // Queue closed by deregistration; close the socket politely.
    let _ = ws_tx.send(WsMessage::Close(None)).await;
}

/// Reads inbound frames and broadcasts signal/peer traffic.
async fn read_inbound(
    mut ws_rx: SplitStream<WebSocketStream<TcpStream>>,
    instance_id: InstanceId,
    router: MessageRouter,
) {
    while let Some(next) = ws_rx.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                debug!("machine {instance_id}: socket error: {e}");
                break;
            }
        };

        match message {
            WsMessage::Text(text) => {
                let frame = match decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("machine {instance_id}: malformed frame dropped: {e}");
                        continue;
                    }
                };
                match frame.kind {
                    MessageKind::Signal | MessageKind::Peer => {
                        router.broadcast(instance_id, &frame).await;
                    }
                    kind => {
                        debug!("machine {instance_id}: {kind:?} frame dropped");
                    }
                }
            }
            WsMessage::Binary(_) => {
                // The channel protocol is JSON text only.
                warn!("machine {instance_id}: unexpected binary frame (ignored)");
            }
            WsMessage::Close(_) => {
                debug!("machine {instance_id}: close frame received");
                break;
            }
            // Protocol-level ping/pong is handled by tungstenite.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}
