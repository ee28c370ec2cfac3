//! WebSocket upgrade handler

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchCommand, PlayerInput, PlayerSlot, ProtocolError};
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Time a fresh connection gets to send `identify`
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound messages buffered per connection before new ones are dropped
const OUTBOUND_QUEUE: usize = 128;
/// Time the writer gets to flush after the reader stops
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    debug!(connection = %connection_id, "New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    let identified = match tokio::time::timeout(IDENTIFY_TIMEOUT, read_identify(&mut ws_stream)).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::IdentifyTimeout),
    };
    let player_id = match identified {
        Ok(player_id) => player_id,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Handshake failed");
            reject(&mut ws_sink, &e).await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (reply_tx, reply_rx) = oneshot::channel();
    let command = MatchCommand::Identify {
        player_id: player_id.clone(),
        connection_id,
        outbound: outbound_tx.clone(),
        reply: reply_tx,
    };

    let bound = if state.match_handle.command_tx.send(command).await.is_err() {
        Err(ProtocolError::MatchClosed)
    } else {
        reply_rx.await.unwrap_or(Err(ProtocolError::MatchClosed))
    };
    let slot = match bound {
        Ok(slot) => slot,
        Err(e) => {
            warn!(player = %player_id, error = %e, "Identify refused");
            reject(&mut ws_sink, &e).await;
            return;
        }
    };

    info!(player = %player_id, slot, "Player connected");
    run_session(
        &state,
        &player_id,
        slot,
        connection_id,
        ws_sink,
        ws_stream,
        outbound_tx,
        outbound_rx,
    )
    .await;
    info!(player = %player_id, "WebSocket connection closed");
}

/// Wait for the first text frame and require it to be `identify`
async fn read_identify(ws_stream: &mut WsStream) -> Result<String, ProtocolError> {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(ClientMsg::Identify { player_id }) => Ok(player_id),
                    Ok(_) => Err(ProtocolError::ExpectedIdentify),
                    Err(e) => Err(ProtocolError::Malformed(e.to_string())),
                };
            }
            Ok(Message::Binary(_)) => return Err(ProtocolError::BinaryFrame),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }
    Err(ProtocolError::ExpectedIdentify)
}

/// Run the WebSocket session with read/write split
#[allow(clippy::too_many_arguments)]
async fn run_session(
    state: &AppState,
    player_id: &str,
    slot: PlayerSlot,
    connection_id: Uuid,
    mut ws_sink: WsSink,
    mut ws_stream: WsStream,
    outbound_tx: mpsc::Sender<ServerMsg>,
    mut outbound_rx: mpsc::Receiver<ServerMsg>,
) {
    let rate_limiter = PlayerRateLimiter::new();
    let command_tx = state.match_handle.command_tx.clone();

    // Writer task: match outbox -> WebSocket
    let writer_player = player_id.to_string();
    let mut writer_handle = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(player = %writer_player, error = %e, "WebSocket send failed");
                return;
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    // Reader loop: WebSocket -> match task
    loop {
        let result = tokio::select! {
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => break,
            },
            _ = &mut writer_handle => {
                debug!(player = %player_id, "Writer finished, closing session");
                break;
            }
        };

        let violation = match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(player = %player_id, "Rate limited input message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(ClientMsg::Identify { .. }) => Some(ProtocolError::DuplicateIdentify),
                    Ok(msg) => {
                        let input = PlayerInput {
                            slot,
                            connection_id,
                            msg,
                            received_at: unix_millis(),
                        };
                        if command_tx.send(MatchCommand::Input(input)).await.is_err() {
                            debug!(player = %player_id, "Match task gone");
                            break;
                        }
                        None
                    }
                    Err(e) => Some(ProtocolError::Malformed(e.to_string())),
                }
            }
            Ok(Message::Binary(_)) => Some(ProtocolError::BinaryFrame),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) => {
                info!(player = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(player = %player_id, error = %e, "WebSocket error");
                break;
            }
        };

        if let Some(e) = violation {
            warn!(player = %player_id, error = %e, "Protocol violation, closing connection");
            let _ = outbound_tx.try_send(error_msg(&e));
            break;
        }
    }

    // Signal disconnect to the match task, which drops its sender for this slot
    let _ = command_tx
        .send(MatchCommand::Disconnect {
            slot,
            connection_id,
        })
        .await;
    drop(outbound_tx);

    if !writer_handle.is_finished()
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle)
            .await
            .is_err()
    {
        writer_handle.abort();
    }
}

fn error_msg(e: &ProtocolError) -> ServerMsg {
    ServerMsg::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

/// Send the error and close a connection that never got bound
async fn reject(ws_sink: &mut WsSink, e: &ProtocolError) {
    let _ = send_msg(ws_sink, &error_msg(e)).await;
    let _ = ws_sink.send(Message::Close(None)).await;
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut WsSink, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
