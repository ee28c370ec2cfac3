//! Grenade lifecycle: throw, stick, detonate

use rapier3d::na::Vector3;
use rapier3d::prelude::RigidBodyHandle;
use tracing::debug;

use crate::ws::protocol::{GrenadeType, ServerMsg, Vec3};

use super::actions::ActionRejected;
use super::combat::{GrenadeEffect, GrenadeStats};
use super::movement::look_direction;
use super::physics::{eye_position, to_vector, to_wire, BodyOwner, GrenadeContact, RayHit};
use super::player::{grenade_index, PlayerSlot};
use super::r#match::{MatchServer, Recipient};
use super::timers::TimerKey;

pub type GrenadeId = u64;

pub const THROW_SPEED: f32 = 18.0;
/// Spawn distance in front of the thrower's eyes
const THROW_OFFSET: f32 = 0.8;
/// Flash line-of-sight tolerance near the victim
const FLASH_LOS_SLACK: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct GrenadeEntity {
    pub id: GrenadeId,
    pub grenade_type: GrenadeType,
    pub owner: PlayerSlot,
    pub body: RigidBodyHandle,
    pub thrown_at: u64,
    pub stuck: bool,
    /// Player carrying a stuck grenade and its offset from their body centre
    pub attached: Option<(PlayerSlot, Vector3<f32>)>,
}

impl MatchServer {
    pub(crate) fn handle_throw_grenade(
        &mut self,
        slot: PlayerSlot,
        grenade_type: GrenadeType,
        direction: Vec3,
        now: u64,
    ) -> Result<(), ActionRejected> {
        self.require_in_progress()?;
        self.require_alive(slot)?;

        let player = &self.state.players[slot];
        if player.grenade_count(grenade_type) == 0 {
            return Err(ActionRejected::NoGrenades(grenade_type));
        }
        let direction = if direction.is_finite() {
            to_vector(direction)
                .try_normalize(1.0e-6)
                .unwrap_or_else(|| look_direction(&player.orientation))
        } else {
            return Err(ActionRejected::InvalidVector);
        };
        let body = player.body.ok_or(ActionRejected::NotAlive)?;
        let center = self.physics.body_position(body).unwrap_or(player.position);
        let position = eye_position(center) + direction * THROW_OFFSET;
        let velocity = direction * THROW_SPEED;

        self.state.players[slot].grenades[grenade_index(grenade_type)] -= 1;

        let id = self.next_grenade_id;
        self.next_grenade_id += 1;
        let body = self.physics.create_grenade_body(id, slot, position, velocity);
        self.grenades.insert(
            id,
            GrenadeEntity {
                id,
                grenade_type,
                owner: slot,
                body,
                thrown_at: now,
                stuck: false,
                attached: None,
            },
        );
        let fuse = GrenadeStats::for_type(grenade_type).fuse_ms;
        self.timers.schedule(TimerKey::GrenadeFuse(id), now + fuse);

        debug!(player = %self.state.players[slot].id, grenade = id, ?grenade_type, "Grenade thrown");
        self.push(
            Recipient::All,
            ServerMsg::GrenadeThrown {
                id,
                grenade_type,
                owner_id: self.state.players[slot].id.clone(),
                position: to_wire(&position),
                velocity: to_wire(&velocity),
            },
        );
        Ok(())
    }

    /// Sticky grenades pin themselves on first contact and re-arm a short fuse.
    /// One that hits a player rides along with them.
    pub(crate) fn handle_grenade_contacts(&mut self, contacts: Vec<GrenadeContact>, now: u64) {
        for contact in contacts {
            let Some(grenade) = self.grenades.get_mut(&contact.grenade) else {
                continue;
            };
            if grenade.stuck || contact.other == BodyOwner::Player(grenade.owner) {
                continue;
            }
            let Some(stuck_fuse) = GrenadeStats::for_type(grenade.grenade_type).stuck_fuse_ms else {
                continue;
            };

            grenade.stuck = true;
            self.physics.stick_body(grenade.body);
            if let BodyOwner::Player(victim) = contact.other {
                let carrier = self.state.players[victim].body;
                let offset = carrier
                    .and_then(|body| self.physics.body_position(body))
                    .zip(self.physics.body_position(grenade.body))
                    .map(|(center, at)| at - center);
                grenade.attached = offset.map(|offset| (victim, offset));
            }

            let key = TimerKey::GrenadeFuse(grenade.id);
            let rearmed = now + stuck_fuse;
            let due = self.timers.due_at(key).map_or(rearmed, |d| d.min(rearmed));
            self.timers.schedule(key, due);
            debug!(grenade = grenade.id, other = ?contact.other, "Grenade stuck");
        }
    }

    /// Keep grenades stuck to a player at the same spot on their body
    pub(crate) fn follow_attached_grenades(&mut self) {
        for grenade in self.grenades.values() {
            let Some((carrier, offset)) = grenade.attached else {
                continue;
            };
            let Some(center) = self.state.players[carrier]
                .body
                .and_then(|body| self.physics.body_position(body))
            else {
                continue;
            };
            self.physics.set_body_position(grenade.body, center + offset);
        }
    }

    /// Resolve a grenade's effect at its current position and remove it
    pub(crate) fn detonate_grenade(&mut self, id: GrenadeId, now: u64) {
        let Some(grenade) = self.grenades.remove(&id) else {
            return;
        };
        self.timers.cancel(TimerKey::GrenadeFuse(id));
        let stats = GrenadeStats::for_type(grenade.grenade_type);
        let Some(position) = self.physics.body_position(grenade.body) else {
            return;
        };

        let mut victims: Vec<PlayerSlot> = self
            .physics
            .query_sphere_overlap(position, stats.radius)
            .into_iter()
            .filter_map(|(_, owner)| match owner {
                BodyOwner::Player(slot) => Some(slot),
                _ => None,
            })
            .filter(|&slot| self.state.players[slot].is_alive())
            .collect();
        victims.sort_unstable();
        victims.dedup();

        self.physics.remove_body(grenade.body);

        match stats.effect {
            GrenadeEffect::Damage(damage) => {
                for victim in victims {
                    self.apply_player_damage(Some(grenade.owner), victim, damage, position, now);
                }
            }
            GrenadeEffect::Flash(duration_ms) => {
                for victim in victims {
                    if self.flash_visible(position, victim) {
                        let player = &mut self.state.players[victim];
                        player.flashed_until = player.flashed_until.max(now + duration_ms);
                        debug!(player = %player.id, until = player.flashed_until, "Player flashed");
                    }
                }
            }
        }

        debug!(
            grenade = id,
            grenade_type = ?grenade.grenade_type,
            airborne_ms = now.saturating_sub(grenade.thrown_at),
            "Grenade exploded"
        );
        self.push(
            Recipient::All,
            ServerMsg::GrenadeExploded {
                id,
                grenade_type: grenade.grenade_type,
                position: to_wire(&position),
            },
        );
        self.check_round_end(now);
    }

    /// Unobstructed line from the detonation to the victim's eyes
    fn flash_visible(&self, origin: Vector3<f32>, victim: PlayerSlot) -> bool {
        let player = &self.state.players[victim];
        let eye = eye_position(player.position);
        let to_eye = eye - origin;
        let distance = to_eye.norm();
        if distance < 1.0e-3 {
            return true;
        }
        match self.physics.cast_ray(origin, to_eye, distance, false, None) {
            Some(RayHit {
                owner: BodyOwner::Player(slot),
                ..
            }) => slot == victim,
            Some(hit) => hit.distance >= distance - FLASH_LOS_SLACK,
            None => true,
        }
    }
}
