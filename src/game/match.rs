//! Match state, flow controller and the per-tick simulation driver

use std::collections::HashMap;

use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::config::MatchSettings;
use crate::util::time::{tick_millis, unix_millis, SIMULATION_TPS, SNAPSHOT_TPS};
use crate::ws::protocol::{
    ClientMsg, MatchEndReason, MatchPhase, MatchResult, PlayerLifecycle, PlayerResult,
    RoundEndReason, ServerMsg, StateSnapshot,
};

use super::actions::ActionRejected;
use super::grenades::{GrenadeEntity, GrenadeId};
use super::map::MapDefinition;
use super::movement::InputFrame;
use super::physics::PhysicsWorld;
use super::player::{PlayerRecord, PlayerSlot};
use super::snapshot::SnapshotBuilder;
use super::timers::{TimerKey, Timers};

/// Pause between a round ending and the next countdown (ms)
pub const ROUND_OVER_DELAY_MS: u64 = 3000;

/// Match state (owned by the match task)
#[derive(Debug)]
pub struct MatchState {
    pub phase: MatchPhase,
    pub map_id: String,
    /// Current round, starting at 1 with the first countdown
    pub round: u32,
    pub round_wins: [u32; 2],
    pub round_ends_at: Option<u64>,
    pub countdown_remaining: u32,
    pub players: [PlayerRecord; 2],
}

/// Who an outbound message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    All,
    Player(PlayerSlot),
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Recipient,
    pub msg: ServerMsg,
}

/// Connection-level violations. The offending connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("player {0:?} is not part of this match")]
    UnknownPlayer(String),

    #[error("player {0:?} is already connected")]
    AlreadyBound(String),

    #[error("first message must be identify")]
    ExpectedIdentify,

    #[error("connection is already identified")]
    DuplicateIdentify,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("identify not received in time")]
    IdentifyTimeout,

    #[error("match is no longer accepting connections")]
    MatchClosed,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnknownPlayer(_) => "unknown_player",
            ProtocolError::AlreadyBound(_) => "already_connected",
            ProtocolError::ExpectedIdentify => "expected_identify",
            ProtocolError::DuplicateIdentify => "duplicate_identify",
            ProtocolError::Malformed(_) => "malformed_message",
            ProtocolError::BinaryFrame => "binary_frame",
            ProtocolError::IdentifyTimeout => "identify_timeout",
            ProtocolError::MatchClosed => "match_closed",
        }
    }
}

/// The authoritative match: every piece of game state for one process
pub struct MatchServer {
    pub(crate) settings: MatchSettings,
    pub(crate) state: MatchState,
    pub(crate) map: MapDefinition,
    pub(crate) physics: PhysicsWorld,
    pub(crate) grenades: HashMap<GrenadeId, GrenadeEntity>,
    pub(crate) next_grenade_id: GrenadeId,
    pub(crate) timers: Timers,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) tick: u64,
    /// Time of the last physics step, cleared outside rounds
    last_step_at: Option<u64>,
    snapshot_builder: SnapshotBuilder,
    outbox: Vec<Outbound>,
    result: Option<MatchResult>,
}

impl MatchServer {
    /// Build the match from fully loaded settings and map.
    /// `degraded` marks a fallback map whose geometry must be replaced by a floor.
    pub fn new(settings: MatchSettings, map: MapDefinition, degraded: bool) -> Self {
        let mut physics = PhysicsWorld::new();
        if degraded {
            physics.add_fallback_floor();
        } else if let Err(e) = physics.load_map(&map) {
            warn!(map_id = %map.id, error = %e, "Map geometry rejected, running in degraded mode on a fallback floor");
            physics.add_fallback_floor();
        }

        let mut players = [
            PlayerRecord::new(0, &settings.players[0]),
            PlayerRecord::new(1, &settings.players[1]),
        ];
        for player in players.iter_mut() {
            let spawn = map.spawn_point(player.slot);
            player.body = Some(physics.create_player_body(player.slot, spawn));
            player.position = super::physics::to_vector(spawn);
        }

        // Settle mass properties and the query structure before anything is frozen
        physics.step();
        for player in players.iter() {
            if let Some(body) = player.body {
                physics.teleport(body, map.spawn_point(player.slot));
                physics.set_body_active(body, false);
            }
        }

        info!(
            match_id = %settings.match_id,
            map_id = %map.id,
            degraded,
            rounds_to_win = settings.rounds_to_win,
            "Match created"
        );

        let state = MatchState {
            phase: MatchPhase::Waiting,
            map_id: settings.map_id.clone(),
            round: 0,
            round_wins: [0, 0],
            round_ends_at: None,
            countdown_remaining: 0,
            players,
        };

        Self {
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
            settings,
            state,
            map,
            physics,
            grenades: HashMap::new(),
            next_grenade_id: 1,
            timers: Timers::new(),
            tick: 0,
            last_step_at: None,
            snapshot_builder: SnapshotBuilder::new(SIMULATION_TPS / SNAPSHOT_TPS),
            outbox: Vec::new(),
            result: None,
        }
    }

    pub fn phase(&self) -> MatchPhase {
        self.state.phase
    }

    #[cfg(test)]
    pub fn state(&self) -> &MatchState {
        &self.state
    }

    #[cfg(test)]
    pub fn player(&self, slot: PlayerSlot) -> &PlayerRecord {
        &self.state.players[slot]
    }

    pub fn slot_of(&self, player_id: &str) -> Option<PlayerSlot> {
        self.state.players.iter().position(|p| p.id == player_id)
    }

    pub fn is_over(&self) -> bool {
        self.state.phase == MatchPhase::MatchOver
    }

    pub fn result(&self) -> Option<&MatchResult> {
        self.result.as_ref()
    }

    pub fn connected_count(&self) -> usize {
        self.state.players.iter().filter(|p| p.is_connected()).count()
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn push(&mut self, to: Recipient, msg: ServerMsg) {
        self.outbox.push(Outbound { to, msg });
    }

    /// Bind a connection to a player slot
    pub fn identify(&mut self, player_id: &str, now: u64) -> Result<PlayerSlot, ProtocolError> {
        let slot = self
            .slot_of(player_id)
            .ok_or_else(|| ProtocolError::UnknownPlayer(player_id.to_string()))?;

        if self.is_over() {
            return Err(ProtocolError::MatchClosed);
        }
        if self.state.players[slot].state != PlayerLifecycle::Waiting {
            return Err(ProtocolError::AlreadyBound(player_id.to_string()));
        }

        self.state.players[slot].state = PlayerLifecycle::Connected;
        info!(player = %player_id, slot, "Player identified");

        let snapshot = self.snapshot_for(slot, now);
        self.push(
            Recipient::Player(slot),
            ServerMsg::Welcome {
                player_id: player_id.to_string(),
                server_time: unix_millis(),
                snapshot,
            },
        );

        if self.state.phase == MatchPhase::Waiting && self.connected_count() == 2 {
            self.state.round = 1;
            self.start_countdown(now);
        }
        Ok(slot)
    }

    /// Connection for `slot` went away
    pub fn disconnect(&mut self, slot: PlayerSlot, now: u64) {
        if !self.state.players[slot].is_connected() {
            return;
        }

        let player = &mut self.state.players[slot];
        player.state = PlayerLifecycle::Disconnected;
        player.grapple = Default::default();
        player.loadout.reloading = None;
        if let Some(body) = player.body {
            self.physics.set_body_active(body, false);
        }
        self.timers.cancel_player(slot);
        info!(player = %self.state.players[slot].id, phase = ?self.state.phase, "Player disconnected");

        match self.state.phase {
            MatchPhase::Waiting => {
                // Slot is free to identify again
                self.state.players[slot].state = PlayerLifecycle::Waiting;
            }
            MatchPhase::MatchOver => {}
            _ => self.end_match(Some(1 - slot), MatchEndReason::Forfeit, now),
        }
    }

    /// Route one inbound message. Action failures stop here.
    pub fn handle_client_msg(&mut self, slot: PlayerSlot, msg: ClientMsg, now: u64) {
        let kind = msg.kind();
        let outcome: Result<(), ActionRejected> = match msg {
            ClientMsg::Identify { .. } => Ok(()),
            ClientMsg::Input {
                sequence,
                delta_time,
                keys,
                look_orientation,
            } => {
                let frame = InputFrame::from_wire(sequence, delta_time, keys, look_orientation);
                self.handle_input(slot, frame, now);
                Ok(())
            }
            ClientMsg::Fire { aim_direction } => self.handle_fire(slot, aim_direction, now),
            ClientMsg::SwitchWeapon { target_slot } => {
                self.handle_switch_weapon(slot, target_slot, now)
            }
            ClientMsg::Reload => self.handle_reload(slot, now),
            ClientMsg::ThrowGrenade {
                grenade_type,
                direction,
            } => self.handle_throw_grenade(slot, grenade_type, direction, now),
            ClientMsg::UseAbility { slot: ability_slot } => {
                self.handle_use_ability(slot, ability_slot, now)
            }
            ClientMsg::FireGrapple { target_point } => {
                self.handle_fire_grapple(slot, target_point, now)
            }
            ClientMsg::ReleaseGrapple => self.handle_release_grapple(slot, now),
            ClientMsg::Ping { t } => {
                self.push(
                    Recipient::Player(slot),
                    ServerMsg::Pong {
                        t,
                        server_time: unix_millis(),
                    },
                );
                Ok(())
            }
        };

        if let Err(reason) = outcome {
            debug!(
                player = %self.state.players[slot].id,
                action = kind,
                reason = %reason,
                "Action rejected"
            );
        }
    }

    /// One fixed-rate tick: physics, bookkeeping, timers, snapshots
    pub fn tick(&mut self, now: u64) {
        self.tick += 1;

        if self.state.phase == MatchPhase::InProgress {
            let elapsed_ms = self
                .last_step_at
                .map_or(tick_millis(), |last| now.saturating_sub(last));
            self.last_step_at = Some(now);

            self.apply_grapple_pulls(now);
            let contacts = self.physics.step();
            self.handle_grenade_contacts(contacts, now);
            self.sync_players_from_physics(now, elapsed_ms);
            self.follow_attached_grenades();
        } else {
            self.last_step_at = None;
        }

        for key in self.timers.drain_due(now) {
            self.resolve_timer(key, now);
        }

        if self.snapshot_builder.should_send() && self.state.phase != MatchPhase::MatchOver {
            self.broadcast_snapshots(now);
        }
    }

    fn resolve_timer(&mut self, key: TimerKey, now: u64) {
        match key {
            TimerKey::Reload { player, slot } => self.complete_reload(player, slot, now),
            TimerKey::GrenadeFuse(id) => self.detonate_grenade(id, now),
            TimerKey::Countdown => self.countdown_second(now),
            TimerKey::RoundClock => self.round_timeout(now),
            TimerKey::NextRound => self.prepare_next_round(now),
        }
    }

    pub fn snapshot_for(&self, slot: PlayerSlot, now: u64) -> StateSnapshot {
        self.snapshot_builder.build(self.tick, &self.state, slot, now)
    }

    fn broadcast_snapshots(&mut self, now: u64) {
        for slot in 0..2 {
            if self.state.players[slot].is_connected() {
                let snapshot = self.snapshot_for(slot, now);
                self.push(Recipient::Player(slot), ServerMsg::StateSnapshot(snapshot));
            }
        }
    }

    // ------------------------------------------------------------------
    // Flow controller
    // ------------------------------------------------------------------

    fn start_countdown(&mut self, now: u64) {
        self.state.phase = MatchPhase::Countdown;
        self.state.countdown_remaining = self.settings.countdown_secs;
        info!(round = self.state.round, "Round countdown started");

        if self.state.countdown_remaining == 0 {
            self.start_round(now);
            return;
        }
        self.push(
            Recipient::All,
            ServerMsg::MatchCountdown {
                round: self.state.round,
                seconds_remaining: self.state.countdown_remaining,
            },
        );
        self.timers.schedule(TimerKey::Countdown, now + 1000);
        self.snapshot_builder.force_next();
    }

    fn countdown_second(&mut self, now: u64) {
        if self.state.phase != MatchPhase::Countdown {
            return;
        }
        self.state.countdown_remaining = self.state.countdown_remaining.saturating_sub(1);
        if self.state.countdown_remaining == 0 {
            self.start_round(now);
        } else {
            self.push(
                Recipient::All,
                ServerMsg::MatchCountdown {
                    round: self.state.round,
                    seconds_remaining: self.state.countdown_remaining,
                },
            );
            self.timers.schedule(TimerKey::Countdown, now + 1000);
        }
    }

    fn start_round(&mut self, now: u64) {
        for slot in 0..2 {
            self.respawn_player(slot);
        }
        self.state.phase = MatchPhase::InProgress;
        let ends_at = now + u64::from(self.settings.round_time_secs) * 1000;
        self.state.round_ends_at = Some(ends_at);
        self.timers.schedule(TimerKey::RoundClock, ends_at);
        self.push(
            Recipient::All,
            ServerMsg::RoundStarted {
                round: self.state.round,
            },
        );
        self.snapshot_builder.force_next();
        info!(round = self.state.round, "Round started");
    }

    /// Full reset, back at the slot's spawn point, simulated again
    pub(crate) fn respawn_player(&mut self, slot: PlayerSlot) {
        let spawn = self.map.spawn_point(slot);
        let player = &mut self.state.players[slot];
        player.reset_for_round();
        player.position = super::physics::to_vector(spawn);
        player.velocity = rapier3d::na::Vector3::zeros();
        player.grounded = false;
        if player.is_connected() {
            player.state = PlayerLifecycle::Alive;
        }
        let active = player.is_alive();
        if let Some(body) = player.body {
            self.physics.teleport(body, spawn);
            self.physics.set_body_active(body, active);
        }
    }

    /// Mark a player dead, freeze their body and update counters
    pub(crate) fn kill_player(&mut self, victim: PlayerSlot, killer: Option<PlayerSlot>) {
        let player = &mut self.state.players[victim];
        if !player.is_alive() {
            return;
        }
        player.state = PlayerLifecycle::Dead;
        player.deaths += 1;
        player.grapple = Default::default();
        player.loadout.reloading = None;
        if let Some(body) = player.body {
            self.physics.set_body_active(body, false);
        }
        self.timers.cancel_player(victim);

        let killer = killer.filter(|&k| k != victim);
        if let Some(k) = killer {
            self.state.players[k].kills += 1;
        }

        let victim_id = self.state.players[victim].id.clone();
        let killer_id = killer.map(|k| self.state.players[k].id.clone());
        info!(victim = %victim_id, killer = ?killer_id, "Player died");
        self.push(
            Recipient::All,
            ServerMsg::PlayerDied {
                victim_id,
                killer_id,
            },
        );
    }

    /// End the round if a death has decided it
    pub(crate) fn check_round_end(&mut self, now: u64) {
        if self.state.phase != MatchPhase::InProgress {
            return;
        }
        let alive: Vec<PlayerSlot> = (0..2).filter(|&s| self.state.players[s].is_alive()).collect();
        match alive.as_slice() {
            [_, _] => {}
            [survivor] => self.end_round(Some(*survivor), RoundEndReason::Elimination, now),
            _ => self.end_round(None, RoundEndReason::Draw, now),
        }
    }

    /// Round clock expired: more health + shield wins, exact tie is a draw
    fn round_timeout(&mut self, now: u64) {
        if self.state.phase != MatchPhase::InProgress {
            return;
        }
        let total = |p: &PlayerRecord| if p.is_alive() { p.health + p.shield } else { 0.0 };
        let a = total(&self.state.players[0]);
        let b = total(&self.state.players[1]);
        if a > b {
            self.end_round(Some(0), RoundEndReason::Timeout, now);
        } else if b > a {
            self.end_round(Some(1), RoundEndReason::Timeout, now);
        } else {
            self.end_round(None, RoundEndReason::Draw, now);
        }
    }

    pub(crate) fn end_round(&mut self, winner: Option<PlayerSlot>, reason: RoundEndReason, now: u64) {
        if self.state.phase != MatchPhase::InProgress {
            return;
        }
        self.state.phase = MatchPhase::RoundOver;
        self.state.round_ends_at = None;
        self.timers.cancel(TimerKey::RoundClock);
        self.clear_grenades();
        for player in self.state.players.iter_mut() {
            player.grapple = Default::default();
        }

        if let Some(w) = winner {
            self.state.round_wins[w] += 1;
        }
        let winner_id = winner.map(|w| self.state.players[w].id.clone());
        info!(
            round = self.state.round,
            winner = ?winner_id,
            ?reason,
            wins = ?self.state.round_wins,
            "Round over"
        );
        self.push(
            Recipient::All,
            ServerMsg::RoundOver {
                round: self.state.round,
                winner_id,
                reason,
            },
        );
        self.snapshot_builder.force_next();

        match winner {
            Some(w) if self.state.round_wins[w] >= self.settings.rounds_to_win => {
                self.end_match(Some(w), MatchEndReason::RoundsWon, now);
            }
            _ => self
                .timers
                .schedule(TimerKey::NextRound, now + ROUND_OVER_DELAY_MS),
        }
    }

    /// Reset per-round state and put both players back on their spawns
    fn prepare_next_round(&mut self, now: u64) {
        if self.state.phase != MatchPhase::RoundOver {
            return;
        }
        self.state.round += 1;
        for slot in 0..2 {
            let spawn = self.map.spawn_point(slot);
            let player = &mut self.state.players[slot];
            player.reset_for_round();
            if matches!(player.state, PlayerLifecycle::Alive | PlayerLifecycle::Dead) {
                player.state = PlayerLifecycle::Connected;
            }
            if let Some(body) = player.body {
                self.physics.teleport(body, spawn);
                self.physics.set_body_active(body, false);
            }
            player.position = super::physics::to_vector(spawn);
        }
        self.start_countdown(now);
    }

    pub(crate) fn end_match(&mut self, winner: Option<PlayerSlot>, reason: MatchEndReason, _now: u64) {
        if self.is_over() {
            return;
        }
        self.state.phase = MatchPhase::MatchOver;
        self.state.round_ends_at = None;
        self.timers.clear();
        self.clear_grenades();

        let result = MatchResult {
            match_id: self.settings.match_id,
            map_id: self.state.map_id.clone(),
            winner_id: winner.map(|w| self.state.players[w].id.clone()),
            loser_id: winner.map(|w| self.state.players[1 - w].id.clone()),
            reason,
            rounds_played: self.state.round,
            players: self
                .state
                .players
                .iter()
                .map(|p| PlayerResult {
                    player_id: p.id.clone(),
                    character: p.character,
                    kills: p.kills,
                    deaths: p.deaths,
                    round_wins: self.state.round_wins[p.slot],
                })
                .collect(),
            ended_at: Utc::now(),
        };

        info!(
            match_id = %result.match_id,
            winner = ?result.winner_id,
            ?reason,
            rounds = result.rounds_played,
            physics_steps = self.physics.steps(),
            "Match over"
        );
        self.push(
            Recipient::All,
            ServerMsg::MatchOver {
                result: result.clone(),
            },
        );
        self.result = Some(result);
    }

    fn clear_grenades(&mut self) {
        for (id, grenade) in self.grenades.drain() {
            self.timers.cancel(TimerKey::GrenadeFuse(id));
            self.physics.remove_body(grenade.body);
        }
    }

    pub(crate) fn require_in_progress(&self) -> Result<(), ActionRejected> {
        if self.state.phase == MatchPhase::InProgress {
            Ok(())
        } else {
            Err(ActionRejected::NotInProgress)
        }
    }

    pub(crate) fn require_alive(&self, slot: PlayerSlot) -> Result<(), ActionRejected> {
        if self.state.players[slot].is_alive() {
            Ok(())
        } else {
            Err(ActionRejected::NotAlive)
        }
    }
}
