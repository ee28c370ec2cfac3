//! Match task: owns the [`MatchServer`] and drives it from a fixed-rate loop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::time::{unix_millis, MatchClock, TICK_DURATION_MICROS};
use crate::ws::protocol::{MatchPhase, MatchResult, ServerMsg};

use super::player::PlayerSlot;
use super::r#match::{MatchServer, ProtocolError, Recipient};
use super::PlayerInput;

const COMMAND_QUEUE: usize = 512;
/// Inputs waiting longer than this in the command queue are logged
const SLOW_INPUT_MS: u64 = 50;

/// Everything a connection can ask of the match task
#[derive(Debug)]
pub enum MatchCommand {
    Identify {
        player_id: String,
        connection_id: Uuid,
        outbound: mpsc::Sender<ServerMsg>,
        reply: oneshot::Sender<Result<PlayerSlot, ProtocolError>>,
    },
    Input(PlayerInput),
    Disconnect {
        slot: PlayerSlot,
        connection_id: Uuid,
    },
}

/// Handle to the running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub command_tx: mpsc::Sender<MatchCommand>,
    pub player_count: Arc<AtomicUsize>,
    phase: Arc<RwLock<MatchPhase>>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> MatchPhase {
        *self.phase.read()
    }
}

struct Connection {
    id: Uuid,
    outbound: mpsc::Sender<ServerMsg>,
}

/// The authoritative game match task
pub struct GameMatch {
    server: MatchServer,
    command_rx: mpsc::Receiver<MatchCommand>,
    connections: [Option<Connection>; 2],
    clock: MatchClock,
    player_count: Arc<AtomicUsize>,
    phase: Arc<RwLock<MatchPhase>>,
}

impl GameMatch {
    pub fn new(server: MatchServer) -> (Self, MatchHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let player_count = Arc::new(AtomicUsize::new(0));
        let phase = Arc::new(RwLock::new(server.phase()));

        let handle = MatchHandle {
            id: server.settings.match_id,
            command_tx,
            player_count: player_count.clone(),
            phase: phase.clone(),
        };

        let game_match = Self {
            server,
            command_rx,
            connections: [None, None],
            clock: MatchClock::new(),
            player_count,
            phase,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop until the match is over
    pub async fn run(mut self) -> Option<MatchResult> {
        info!(match_id = %self.server.settings.match_id, "Match task started");

        let mut tick_interval = interval(Duration::from_micros(TICK_DURATION_MICROS));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now = self.clock.now_ms();
                    self.server.tick(now);
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        warn!("Command channel closed, stopping match");
                        break;
                    }
                },
            }

            self.flush();
            self.publish_status();

            if self.server.is_over() {
                break;
            }
        }

        // Dropping the senders lets every writer drain and close
        self.connections = [None, None];
        self.server.result().cloned()
    }

    fn handle_command(&mut self, command: MatchCommand) {
        let now = self.clock.now_ms();
        match command {
            MatchCommand::Identify {
                player_id,
                connection_id,
                outbound,
                reply,
            } => {
                let result = self.server.identify(&player_id, now);
                if let Ok(slot) = result {
                    self.connections[slot] = Some(Connection {
                        id: connection_id,
                        outbound,
                    });
                }
                let _ = reply.send(result);
            }
            MatchCommand::Input(input) => {
                let bound = self.connections[input.slot]
                    .as_ref()
                    .is_some_and(|c| c.id == input.connection_id);
                if bound {
                    let queued_ms = unix_millis().saturating_sub(input.received_at);
                    if queued_ms > SLOW_INPUT_MS {
                        debug!(slot = input.slot, queued_ms, kind = input.msg.kind(), "Input delayed in command queue");
                    }
                    self.server.handle_client_msg(input.slot, input.msg, now);
                }
            }
            MatchCommand::Disconnect {
                slot,
                connection_id,
            } => {
                let bound = self.connections[slot]
                    .as_ref()
                    .is_some_and(|c| c.id == connection_id);
                if bound {
                    // Flush first so the leaving player gets anything already queued
                    self.flush();
                    self.connections[slot] = None;
                    self.server.disconnect(slot, now);
                }
            }
        }
    }

    /// Deliver queued messages. A full queue drops that message for that player only.
    fn flush(&mut self) {
        for outbound in self.server.drain_outbox() {
            match outbound.to {
                Recipient::All => {
                    for slot in 0..2 {
                        self.deliver(slot, outbound.msg.clone());
                    }
                }
                Recipient::Player(slot) => self.deliver(slot, outbound.msg),
            }
        }
    }

    fn deliver(&self, slot: PlayerSlot, msg: ServerMsg) {
        if let Some(connection) = &self.connections[slot] {
            if connection.outbound.try_send(msg).is_err() {
                warn!(slot, "Outbound queue full or closed, message dropped");
            }
        }
    }

    fn publish_status(&self) {
        self.player_count
            .store(self.server.connected_count(), Ordering::Relaxed);
        *self.phase.write() = self.server.phase();
    }
}
