//! Action handlers: fire, weapon switch, reload, abilities, grapple
//!
//! Every handler validates against authoritative state first and only then
//! mutates, so a rejected action leaves the match untouched.

use rapier3d::na::Vector3;
use tracing::debug;

use crate::ws::protocol::{AbilityType, GrenadeType, ServerMsg, Vec3};

use super::combat::{CombatSystem, WeaponStats};
use super::movement::{
    horizontal_forward, look_direction, DASH_SPEED, DASH_WINDOW_MS, GRAPPLE_MAX_RANGE,
};
use super::physics::{eye_position, to_vector, to_wire, BodyOwner, PLAYER_MASS};
use super::player::{GrappleState, PlayerSlot};
use super::r#match::{MatchServer, Recipient};
use super::timers::TimerKey;

pub const HEAL_AMOUNT: f32 = 50.0;
pub const DAMAGE_AMP_DURATION_MS: u64 = 6000;
/// Grapple ray may stop this short of the target and still count as a clear line
const GRAPPLE_LOS_TOLERANCE: f32 = 0.25;

/// Why an action was refused. Rejections never reach the client.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ActionRejected {
    #[error("match is not in progress")]
    NotInProgress,

    #[error("player is not alive")]
    NotAlive,

    #[error("weapon is reloading")]
    Reloading,

    #[error("clip is empty")]
    OutOfAmmo,

    #[error("weapon is still cycling")]
    FireRate,

    #[error("invalid weapon slot {0}")]
    InvalidSlot(usize),

    #[error("weapon slot {0} is already active")]
    SameSlot(usize),

    #[error("already reloading")]
    AlreadyReloading,

    #[error("clip is already full")]
    ClipFull,

    #[error("no {0:?} grenades left")]
    NoGrenades(GrenadeType),

    #[error("invalid ability slot {0}")]
    InvalidAbilitySlot(usize),

    #[error("ability on cooldown for {0} ms")]
    AbilityCooldown(u64),

    #[error("grapple already attached")]
    AlreadyGrappling,

    #[error("grapple target {0:.1} m away is out of range")]
    OutOfRange(f32),

    #[error("no line of sight to grapple target")]
    NoLineOfSight,

    #[error("grapple is not attached")]
    NotGrappling,

    #[error("non-finite vector")]
    InvalidVector,
}

impl MatchServer {
    pub(crate) fn handle_fire(
        &mut self,
        slot: PlayerSlot,
        aim_direction: Vec3,
        now: u64,
    ) -> Result<(), ActionRejected> {
        self.require_in_progress()?;
        self.require_alive(slot)?;
        if !aim_direction.is_finite() {
            return Err(ActionRejected::InvalidVector);
        }

        let shooter = &self.state.players[slot];
        let loadout = &shooter.loadout;
        if loadout.reloading.is_some() {
            return Err(ActionRejected::Reloading);
        }
        let weapon = loadout.active_slot();
        if weapon.ammo == 0 {
            return Err(ActionRejected::OutOfAmmo);
        }
        let stats = weapon.stats();
        if let Some(last) = loadout.last_shot_at {
            if now.saturating_sub(last) < stats.fire_interval_ms {
                return Err(ActionRejected::FireRate);
            }
        }
        let body = shooter.body.ok_or(ActionRejected::NotAlive)?;

        let center = self.physics.body_position(body).unwrap_or(shooter.position);
        let origin = eye_position(center);
        let aim = to_vector(aim_direction)
            .try_normalize(1.0e-6)
            .unwrap_or_else(|| look_direction(&shooter.orientation));
        let spread = loadout.spread;
        let per_pellet = CombatSystem::calculate_damage(stats.damage, shooter.damage_amp_until, now);

        let shooter = &mut self.state.players[slot];
        shooter.loadout.active_slot_mut().ammo -= 1;
        shooter.loadout.last_shot_at = Some(now);
        shooter.loadout.spread = CombatSystem::spread_after_shot(spread, &stats);

        let mut pellets_hit = 0u32;
        let mut hit_point = None;
        let target = 1 - slot;
        for _ in 0..stats.pellets {
            let dir = CombatSystem::apply_spread(aim, spread, &mut self.rng);
            if let Some(hit) = self.physics.cast_ray(origin, dir, stats.range, true, Some(body)) {
                if hit.owner == BodyOwner::Player(target) {
                    pellets_hit += 1;
                    hit_point.get_or_insert(hit.point);
                }
            }
        }

        if let Some(point) = hit_point {
            let damage = per_pellet * pellets_hit as f32;
            self.apply_player_damage(Some(slot), target, damage, point, now);
            self.check_round_end(now);
        }
        Ok(())
    }

    /// Shield-first damage with hit confirmation; kills are recorded here
    pub(crate) fn apply_player_damage(
        &mut self,
        attacker: Option<PlayerSlot>,
        victim: PlayerSlot,
        damage: f32,
        hit_point: Vector3<f32>,
        _now: u64,
    ) {
        if !self.state.players[victim].is_alive() {
            return;
        }
        let result = self.state.players[victim].take_damage(damage);

        let victim_id = self.state.players[victim].id.clone();
        let shooter_id = attacker
            .map(|a| self.state.players[a].id.clone())
            .unwrap_or_else(|| victim_id.clone());
        debug!(
            shooter = %shooter_id,
            victim = %victim_id,
            dealt = result.dealt,
            shield = result.shield,
            health = result.health,
            "Damage applied"
        );
        self.push(
            Recipient::All,
            ServerMsg::HitConfirmed {
                shooter_id,
                victim_id,
                damage: result.dealt,
                hit_point: to_wire(&hit_point),
            },
        );

        if result.killed {
            self.kill_player(victim, attacker);
        }
    }

    pub(crate) fn handle_switch_weapon(
        &mut self,
        slot: PlayerSlot,
        target_slot: usize,
        _now: u64,
    ) -> Result<(), ActionRejected> {
        self.require_in_progress()?;
        self.require_alive(slot)?;

        let loadout = &self.state.players[slot].loadout;
        if target_slot >= loadout.slots.len() {
            return Err(ActionRejected::InvalidSlot(target_slot));
        }
        if target_slot == loadout.active {
            return Err(ActionRejected::SameSlot(target_slot));
        }

        let loadout = &mut self.state.players[slot].loadout;
        if let Some(reloading) = loadout.reloading.take() {
            self.timers.cancel(TimerKey::Reload {
                player: slot,
                slot: reloading,
            });
        }
        loadout.active = target_slot;
        loadout.spread = loadout.active_slot().stats().base_spread;
        Ok(())
    }

    pub(crate) fn handle_reload(&mut self, slot: PlayerSlot, now: u64) -> Result<(), ActionRejected> {
        self.require_in_progress()?;
        self.require_alive(slot)?;

        let loadout = &mut self.state.players[slot].loadout;
        if loadout.reloading.is_some() {
            return Err(ActionRejected::AlreadyReloading);
        }
        if loadout.active_slot().is_full() {
            return Err(ActionRejected::ClipFull);
        }

        let weapon_slot = loadout.active;
        let stats: WeaponStats = loadout.active_slot().stats();
        loadout.reloading = Some(weapon_slot);
        self.timers.schedule(
            TimerKey::Reload {
                player: slot,
                slot: weapon_slot,
            },
            now + stats.reload_ms,
        );
        Ok(())
    }

    /// Reload timer fired. Refills only if that reload is still the live one.
    pub(crate) fn complete_reload(&mut self, slot: PlayerSlot, weapon_slot: usize, _now: u64) {
        let player = &mut self.state.players[slot];
        if !player.is_alive() || player.loadout.reloading != Some(weapon_slot) {
            debug!(player = %player.id, weapon_slot, "Stale reload ignored");
            return;
        }
        player.loadout.slots[weapon_slot].refill();
        player.loadout.reloading = None;
    }

    pub(crate) fn handle_use_ability(
        &mut self,
        slot: PlayerSlot,
        ability_slot: usize,
        now: u64,
    ) -> Result<(), ActionRejected> {
        self.require_in_progress()?;
        self.require_alive(slot)?;
        if ability_slot != 0 {
            return Err(ActionRejected::InvalidAbilitySlot(ability_slot));
        }

        let player = &mut self.state.players[slot];
        let remaining = player.ability_cooldown_remaining(now);
        if remaining > 0 {
            return Err(ActionRejected::AbilityCooldown(remaining));
        }

        let ability = player.profile.ability;
        match ability {
            AbilityType::Dash => {
                let body = player.body.ok_or(ActionRejected::NotAlive)?;
                let impulse = horizontal_forward(&player.orientation) * PLAYER_MASS * DASH_SPEED;
                player.dash_until = now + DASH_WINDOW_MS;
                self.physics.apply_impulse(body, impulse);
            }
            AbilityType::Heal => player.heal(HEAL_AMOUNT),
            AbilityType::DamageAmp => player.damage_amp_until = now + DAMAGE_AMP_DURATION_MS,
        }
        player.ability_ready_at = now + player.profile.ability_cooldown_ms;

        let player_id = player.id.clone();
        debug!(player = %player_id, ?ability, "Ability used");
        self.push(
            Recipient::All,
            ServerMsg::AbilityUsed {
                player_id,
                ability_type: ability,
            },
        );
        Ok(())
    }

    pub(crate) fn handle_fire_grapple(
        &mut self,
        slot: PlayerSlot,
        target_point: Vec3,
        now: u64,
    ) -> Result<(), ActionRejected> {
        self.require_in_progress()?;
        self.require_alive(slot)?;
        if !target_point.is_finite() {
            return Err(ActionRejected::InvalidVector);
        }

        let player = &self.state.players[slot];
        if player.grapple.active {
            return Err(ActionRejected::AlreadyGrappling);
        }
        let body = player.body.ok_or(ActionRejected::NotAlive)?;
        let center = self.physics.body_position(body).unwrap_or(player.position);
        let origin = eye_position(center);
        let target = to_vector(target_point);

        let to_target = target - origin;
        let distance = to_target.norm();
        if distance > GRAPPLE_MAX_RANGE {
            return Err(ActionRejected::OutOfRange(distance));
        }
        if let Some(hit) = self.physics.cast_ray(origin, to_target, distance, true, Some(body)) {
            if hit.distance < distance - GRAPPLE_LOS_TOLERANCE {
                return Err(ActionRejected::NoLineOfSight);
            }
        }

        self.state.players[slot].grapple = GrappleState {
            active: true,
            target: Some(target),
            started_at: now,
        };
        debug!(player = %self.state.players[slot].id, distance, "Grapple attached");
        Ok(())
    }

    pub(crate) fn handle_release_grapple(
        &mut self,
        slot: PlayerSlot,
        _now: u64,
    ) -> Result<(), ActionRejected> {
        self.require_alive(slot)?;
        let player = &mut self.state.players[slot];
        if !player.grapple.active {
            return Err(ActionRejected::NotGrappling);
        }
        player.grapple = GrappleState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::tests::{in_progress, new_server};
    use crate::ws::protocol::{ClientMsg, MatchPhase};

    /// From slot 0's eyes towards slot 1's body centre
    fn aim_at_opponent(server: &MatchServer) -> Vec3 {
        let from = eye_position(server.player(0).position);
        to_wire(&(server.player(1).position - from))
    }

    fn aim_away() -> Vec3 {
        Vec3::new(1.0, 0.2, 0.0)
    }

    #[test]
    fn empty_clip_fires_nothing() {
        let (mut server, mut now) = in_progress(3);
        for _ in 0..30 {
            now += 100;
            server.handle_fire(0, aim_away(), now).unwrap();
        }
        assert_eq!(server.player(0).loadout.clip_ammo()[0], 0);

        server.drain_outbox();
        now += 100;
        assert_eq!(
            server.handle_fire(0, aim_away(), now),
            Err(ActionRejected::OutOfAmmo)
        );
        assert_eq!(server.player(0).loadout.clip_ammo()[0], 0);
        assert!(server.drain_outbox().is_empty());
    }

    #[test]
    fn fire_rate_is_enforced() {
        let (mut server, now) = in_progress(3);
        server.handle_fire(0, aim_away(), now).unwrap();
        assert_eq!(
            server.handle_fire(0, aim_away(), now + 50),
            Err(ActionRejected::FireRate)
        );
        assert!(server.handle_fire(0, aim_away(), now + 100).is_ok());
        assert_eq!(server.player(0).loadout.clip_ammo()[0], 28);
    }

    #[test]
    fn switching_back_and_forth_keeps_fire_rate() {
        let (mut server, now) = in_progress(3);
        server.handle_fire(0, aim_away(), now).unwrap();
        server.handle_switch_weapon(0, 1, now + 1).unwrap();
        server.handle_switch_weapon(0, 0, now + 2).unwrap();
        assert_eq!(
            server.handle_fire(0, aim_away(), now + 3),
            Err(ActionRejected::FireRate)
        );
        assert_eq!(server.player(0).loadout.clip_ammo(), [29, 12]);
        assert!(server.handle_fire(0, aim_away(), now + 100).is_ok());
    }

    #[test]
    fn hitscan_damages_shield_first() {
        let (mut server, now) = in_progress(3);
        let aim = aim_at_opponent(&server);
        server.handle_fire(0, aim, now).unwrap();

        let victim = server.player(1);
        assert_eq!(victim.shield, 32.0);
        assert_eq!(victim.health, 100.0);
        assert!(server.drain_outbox().iter().any(|o| matches!(
            &o.msg,
            ServerMsg::HitConfirmed { victim_id, damage, .. } if victim_id == "p2" && *damage == 18.0
        )));
    }

    #[test]
    fn damage_amp_scales_shots() {
        let mut settings = crate::game::r#match::tests::settings(3);
        settings.players[0].character = crate::ws::protocol::CharacterType::Striker;
        let mut server = MatchServer::new(
            settings,
            crate::game::map::MapDefinition::fallback("test"),
            true,
        );
        let mut now = 0;
        server.identify("p1", now).unwrap();
        server.identify("p2", now).unwrap();
        crate::game::r#match::tests::run_until(&mut server, &mut now, MatchPhase::InProgress);
        for _ in 0..30 {
            now += 16;
            server.tick(now);
        }

        server.handle_use_ability(0, 0, now).unwrap();
        let aim = aim_at_opponent(&server);
        server.handle_fire(0, aim, now).unwrap();
        // Sniper 90 x 1.5 = 135 against 50 shield + 100 health
        assert_eq!(server.player(1).shield, 0.0);
        assert_eq!(server.player(1).health, 15.0);
    }

    #[test]
    fn lethal_shot_ends_round() {
        let (mut server, now) = in_progress(3);
        server.state.players[1].shield = 0.0;
        server.state.players[1].health = 10.0;
        let aim = aim_at_opponent(&server);
        server.handle_fire(0, aim, now).unwrap();
        assert_eq!(server.phase(), MatchPhase::RoundOver);
        assert_eq!(server.player(0).kills, 1);
        assert_eq!(server.player(1).deaths, 1);
    }

    #[test]
    fn switching_mid_reload_cancels_it() {
        let (mut server, mut now) = in_progress(3);
        server.handle_fire(0, aim_away(), now).unwrap();
        server.handle_reload(0, now).unwrap();
        assert_eq!(server.player(0).loadout.reloading, Some(0));
        assert_eq!(
            server.handle_fire(0, aim_away(), now + 500),
            Err(ActionRejected::Reloading)
        );

        server.handle_switch_weapon(0, 1, now + 500).unwrap();
        assert_eq!(server.player(0).loadout.reloading, None);
        assert!(!server.timers.is_pending(TimerKey::Reload { player: 0, slot: 0 }));

        // Past the original reload deadline: rifle keeps its partial clip
        for _ in 0..200 {
            now += 16;
            server.tick(now);
        }
        assert_eq!(server.player(0).loadout.clip_ammo(), [29, 12]);
        assert_eq!(server.player(0).loadout.active, 1);
    }

    #[test]
    fn reload_completes_after_duration() {
        let (mut server, mut now) = in_progress(3);
        server.handle_fire(0, aim_away(), now).unwrap();
        server.handle_reload(0, now).unwrap();
        let done = now + 2000;
        while now < done {
            now += 16;
            server.tick(now);
        }
        assert_eq!(server.player(0).loadout.clip_ammo()[0], 30);
        assert_eq!(server.player(0).loadout.reloading, None);
    }

    #[test]
    fn reload_rejections() {
        let (mut server, now) = in_progress(3);
        assert_eq!(server.handle_reload(0, now), Err(ActionRejected::ClipFull));
        server.handle_fire(0, aim_away(), now).unwrap();
        server.handle_reload(0, now).unwrap();
        assert_eq!(
            server.handle_reload(0, now),
            Err(ActionRejected::AlreadyReloading)
        );
    }

    #[test]
    fn switch_rejections() {
        let (mut server, now) = in_progress(3);
        assert_eq!(
            server.handle_switch_weapon(0, 0, now),
            Err(ActionRejected::SameSlot(0))
        );
        assert_eq!(
            server.handle_switch_weapon(0, 5, now),
            Err(ActionRejected::InvalidSlot(5))
        );
    }

    #[test]
    fn ability_cooldown_then_recovers() {
        let (mut server, mut now) = in_progress(3);
        server.handle_use_ability(0, 0, now).unwrap();
        assert!(server.player(0).dash_until > now);
        assert!(matches!(
            server.handle_use_ability(0, 0, now),
            Err(ActionRejected::AbilityCooldown(_))
        ));
        assert_eq!(server.player(0).ability_cooldown_remaining(now + 1000), 3000);

        for _ in 0..249 {
            now += 16;
            server.tick(now);
        }
        assert!(matches!(
            server.handle_use_ability(0, 0, now),
            Err(ActionRejected::AbilityCooldown(16))
        ));
        now += 16;
        assert!(server.handle_use_ability(0, 0, now).is_ok());
    }

    #[test]
    fn ability_cooldown_ignores_missed_ticks() {
        let (mut server, mut now) = in_progress(3);
        server.handle_use_ability(0, 0, now).unwrap();
        // A single late tick covering the whole cooldown
        now += 4000;
        server.tick(now);
        assert!(server.handle_use_ability(0, 0, now).is_ok());
    }

    #[test]
    fn dash_allows_boosted_speed() {
        let (mut server, mut now) = in_progress(3);
        server.handle_use_ability(1, 0, now).unwrap();
        now += 16;
        server.tick(now);
        let p = server.player(1);
        assert!(p.velocity.xz().norm() > 11.25);
        assert_eq!(p.speed_violations, 0);
    }

    #[test]
    fn heal_restores_shield_first() {
        let mut settings = crate::game::r#match::tests::settings(3);
        settings.players[0].character = crate::ws::protocol::CharacterType::Medic;
        let mut server = MatchServer::new(
            settings,
            crate::game::map::MapDefinition::fallback("test"),
            true,
        );
        let mut now = 0;
        server.identify("p1", now).unwrap();
        server.identify("p2", now).unwrap();
        crate::game::r#match::tests::run_until(&mut server, &mut now, MatchPhase::InProgress);

        server.state.players[0].take_damage(100.0); // 0 shield, 75 health
        server.handle_use_ability(0, 0, now).unwrap();
        assert_eq!(server.player(0).shield, 50.0);
        assert_eq!(server.player(0).health, 75.0);
    }

    #[test]
    fn grapple_range_and_sight() {
        let (mut server, now) = in_progress(3);
        assert!(matches!(
            server.handle_fire_grapple(0, Vec3::new(0.0, 0.0, -60.0), now),
            Err(ActionRejected::OutOfRange(_))
        ));
        // Opponent stands between the eyes and the anchor
        assert_eq!(
            server.handle_fire_grapple(0, Vec3::new(0.0, 0.9, -12.0), now),
            Err(ActionRejected::NoLineOfSight)
        );
        assert!(server
            .handle_fire_grapple(0, Vec3::new(5.0, 0.0, 5.0), now)
            .is_ok());
        assert_eq!(
            server.handle_fire_grapple(0, Vec3::new(5.0, 0.0, 5.0), now),
            Err(ActionRejected::AlreadyGrappling)
        );
    }

    #[test]
    fn grapple_pulls_then_releases() {
        let (mut server, mut now) = in_progress(3);
        let start = server.player(0).position;
        server
            .handle_fire_grapple(0, Vec3::new(8.0, 0.0, 10.0), now)
            .unwrap();
        now += 16;
        server.tick(now);
        now += 16;
        server.tick(now);
        assert!(server.player(0).position.x > start.x);

        server.handle_release_grapple(0, now).unwrap();
        assert!(!server.player(0).grapple.active);
        assert_eq!(
            server.handle_release_grapple(0, now),
            Err(ActionRejected::NotGrappling)
        );
    }

    #[test]
    fn actions_rejected_outside_rounds() {
        let mut server = new_server(3);
        server.identify("p1", 0).unwrap();
        server.identify("p2", 0).unwrap();
        assert_eq!(server.phase(), MatchPhase::Countdown);
        assert_eq!(
            server.handle_fire(0, aim_away(), 0),
            Err(ActionRejected::NotInProgress)
        );
        // Dispatch swallows the rejection
        server.handle_client_msg(0, ClientMsg::Reload, 0);
        assert_eq!(server.player(0).loadout.reloading, None);
    }

    #[test]
    fn dead_players_cannot_act() {
        let (mut server, now) = in_progress(3);
        server.kill_player(1, None);
        assert_eq!(
            server.handle_fire(1, aim_away(), now),
            Err(ActionRejected::NotAlive)
        );
        assert_eq!(
            server.handle_throw_grenade(1, GrenadeType::Frag, aim_away(), now),
            Err(ActionRejected::NotAlive)
        );
    }
}
