//! Snapshot building and per-recipient filtering

use std::collections::BTreeMap;

use crate::ws::protocol::{GrappleSnapshot, MatchPhase, PlayerSnapshot, Quat, StateSnapshot};

use super::physics::to_wire;
use super::player::{PlayerRecord, PlayerSlot};
use super::r#match::MatchState;

/// Builds snapshots for network transmission
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (phase changes)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Full match state as `recipient` may see it.
    /// Exact clip ammo and the input acknowledgement go to their owner only.
    pub fn build(
        &self,
        tick: u64,
        state: &MatchState,
        recipient: PlayerSlot,
        now: u64,
    ) -> StateSnapshot {
        let players = state
            .players
            .iter()
            .map(|p| (p.id.clone(), player_snapshot(p, p.slot == recipient, now)))
            .collect();
        let round_wins = state
            .players
            .iter()
            .map(|p| (p.id.clone(), state.round_wins[p.slot]))
            .collect::<BTreeMap<_, _>>();
        let round_time_remaining_ms = match (state.phase, state.round_ends_at) {
            (MatchPhase::InProgress, Some(ends_at)) => ends_at.saturating_sub(now),
            _ => 0,
        };

        StateSnapshot {
            server_tick: tick,
            match_phase: state.phase,
            map_id: state.map_id.clone(),
            round: state.round,
            round_wins,
            round_time_remaining_ms,
            players,
        }
    }
}

fn player_snapshot(p: &PlayerRecord, owner: bool, now: u64) -> PlayerSnapshot {
    let q = p.orientation.into_inner();
    PlayerSnapshot {
        character: p.character,
        state: p.state,
        position: to_wire(&p.position),
        orientation: Quat {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        },
        velocity: to_wire(&p.velocity),
        grounded: p.grounded,
        health: p.health,
        shield: p.shield,
        weapons: p.loadout.weapons(),
        active_weapon_slot: p.loadout.active,
        reloading: p.loadout.reloading.is_some(),
        grenades: p.grenade_counts(),
        ability: p.profile.ability,
        ability_cooldown_ms: p.ability_cooldown_remaining(now),
        grapple: GrappleSnapshot {
            active: p.grapple.active,
            target_point: p.grapple.target.as_ref().map(to_wire),
            started_at: p.grapple.started_at,
        },
        damage_amp_until: p.damage_amp_until,
        flashed_until: p.flashed_until,
        kills: p.kills,
        deaths: p.deaths,
        clip_ammo: owner.then(|| p.loadout.clip_ammo()),
        last_processed_sequence: owner.then_some(p.last_input_seq),
    }
}
