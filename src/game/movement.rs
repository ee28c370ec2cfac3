//! Movement validation - turns client inputs into bounded physics forces
//!
//! Clients only send intent (keys + look orientation). Every velocity change is
//! produced here, capped per input, and checked against a speed ceiling after
//! each step.

use rapier3d::na::{UnitQuaternion, Vector3};
use tracing::{debug, trace, warn};

use crate::util::time::tick_delta;
use crate::ws::protocol::{MatchPhase, MovementKeys, Quat};

use super::combat::CombatSystem;
use super::physics::PLAYER_MASS;
use super::player::{PlayerRecord, PlayerSlot};
use super::r#match::MatchServer;

pub const WALK_SPEED: f32 = 6.0;
pub const RUN_SPEED: f32 = 9.0;
/// Fraction of the velocity error corrected per second
pub const ACCELERATION: f32 = 10.0;
/// Steering authority while airborne
pub const AIR_CONTROL: f32 = 0.3;
/// Largest movement impulse one input may apply (N·s)
pub const MAX_MOVE_IMPULSE: f32 = 320.0;
pub const JUMP_SPEED: f32 = 7.0;
pub const JUMP_COOLDOWN_MS: u64 = 250;
/// Horizontal speed ceiling (run speed plus 25% tolerance)
pub const SPEED_CEILING: f32 = 11.25;
/// Ceiling while dashing or grappling
pub const BOOSTED_SPEED_CEILING: f32 = 28.0;
pub const DASH_SPEED: f32 = 18.0;
pub const DASH_WINDOW_MS: u64 = 400;
pub const GRAPPLE_MAX_RANGE: f32 = 40.0;
/// Grapple pull acceleration (m/s²)
pub const GRAPPLE_PULL: f32 = 30.0;
/// Grapple lets go once the body is this close to the anchor
pub const GRAPPLE_RELEASE_DISTANCE: f32 = 1.5;
pub const MAX_INPUT_DELTA: f32 = 0.1;

/// One validated movement input
#[derive(Debug, Clone, Copy)]
pub struct InputFrame {
    pub sequence: u32,
    /// Seconds, clamped to (0, MAX_INPUT_DELTA]
    pub delta_time: f32,
    pub keys: MovementKeys,
    pub look: UnitQuaternion<f32>,
}

impl InputFrame {
    pub fn from_wire(sequence: u32, delta_time: f32, keys: MovementKeys, look: Quat) -> Self {
        let delta_time = if delta_time.is_finite() && delta_time > 0.0 {
            delta_time.min(MAX_INPUT_DELTA)
        } else {
            tick_delta()
        };
        let look = if look.is_finite() {
            let q = rapier3d::na::Quaternion::new(look.w, look.x, look.y, look.z);
            UnitQuaternion::try_new(q, 1.0e-6).unwrap_or_else(UnitQuaternion::identity)
        } else {
            UnitQuaternion::identity()
        };
        Self {
            sequence,
            delta_time,
            keys,
            look,
        }
    }
}

/// Full look direction (forward is -Z)
pub fn look_direction(look: &UnitQuaternion<f32>) -> Vector3<f32> {
    look * Vector3::new(0.0, 0.0, -1.0)
}

/// Look direction flattened onto the ground plane
pub fn horizontal_forward(look: &UnitQuaternion<f32>) -> Vector3<f32> {
    let mut forward = look_direction(look);
    forward.y = 0.0;
    forward
        .try_normalize(1.0e-6)
        .unwrap_or_else(|| Vector3::new(0.0, 0.0, -1.0))
}

/// Target horizontal velocity for the held keys
pub fn desired_velocity(keys: &MovementKeys, look: &UnitQuaternion<f32>) -> Vector3<f32> {
    let forward = horizontal_forward(look);
    let right = Vector3::new(-forward.z, 0.0, forward.x);

    let mut wish = Vector3::zeros();
    if keys.forward {
        wish += forward;
    }
    if keys.back {
        wish -= forward;
    }
    if keys.right {
        wish += right;
    }
    if keys.left {
        wish -= right;
    }

    let speed = if keys.run { RUN_SPEED } else { WALK_SPEED };
    wish.try_normalize(1.0e-6)
        .map(|dir| dir * speed)
        .unwrap_or_else(Vector3::zeros)
}

/// Horizontal impulse steering `current` towards `desired`, capped in magnitude
pub fn movement_impulse(
    desired: Vector3<f32>,
    current: Vector3<f32>,
    delta_time: f32,
    grounded: bool,
) -> Vector3<f32> {
    let mut dv = desired - current;
    dv.y = 0.0;

    let control = if grounded { 1.0 } else { AIR_CONTROL };
    let blend = (ACCELERATION * delta_time).min(1.0);
    let impulse = dv * PLAYER_MASS * blend * control;

    let magnitude = impulse.norm();
    if magnitude > MAX_MOVE_IMPULSE {
        impulse * (MAX_MOVE_IMPULSE / magnitude)
    } else {
        impulse
    }
}

/// Horizontal velocity scaled down to `ceiling`, or None when already within it
pub fn clamp_horizontal_speed(velocity: Vector3<f32>, ceiling: f32) -> Option<Vector3<f32>> {
    let horizontal = (velocity.x * velocity.x + velocity.z * velocity.z).sqrt();
    if horizontal <= ceiling {
        return None;
    }
    let scale = ceiling / horizontal;
    Some(Vector3::new(velocity.x * scale, velocity.y, velocity.z * scale))
}

fn speed_ceiling(player: &PlayerRecord, now: u64) -> f32 {
    if player.grapple.active || now < player.dash_until {
        BOOSTED_SPEED_CEILING
    } else {
        SPEED_CEILING
    }
}

impl MatchServer {
    /// Apply one movement input. Returns false when the input was dropped.
    pub(crate) fn handle_input(&mut self, slot: PlayerSlot, frame: InputFrame, now: u64) -> bool {
        let in_progress = self.state.phase == MatchPhase::InProgress;
        let player = &mut self.state.players[slot];

        if !player.is_alive() {
            trace!(player = %player.id, seq = frame.sequence, "Input from inactive player dropped");
            return false;
        }
        if !player.accept_input(frame) {
            trace!(
                player = %player.id,
                seq = frame.sequence,
                last = player.last_input_seq,
                "Stale input dropped"
            );
            return false;
        }
        if !in_progress {
            return true;
        }

        let Some(body) = player.body else {
            return true;
        };
        let current = self.physics.body_velocity(body).unwrap_or(player.velocity);
        let grounded = player.grounded;

        let desired = desired_velocity(&frame.keys, &frame.look);
        let impulse = movement_impulse(desired, current, frame.delta_time, grounded);
        self.physics.apply_impulse(body, impulse);

        let jump_ready = player
            .last_jump_at
            .map_or(true, |at| now.saturating_sub(at) >= JUMP_COOLDOWN_MS);
        if frame.keys.jump && grounded && jump_ready {
            self.physics
                .apply_impulse(body, Vector3::new(0.0, PLAYER_MASS * JUMP_SPEED, 0.0));
            player.last_jump_at = Some(now);
            player.grounded = false;
        }

        self.enforce_speed_limit(slot, now);
        true
    }

    /// Clamp horizontal speed to the current ceiling, counting violations
    pub(crate) fn enforce_speed_limit(&mut self, slot: PlayerSlot, now: u64) {
        let player = &mut self.state.players[slot];
        let Some(body) = player.body else {
            return;
        };
        let Some(velocity) = self.physics.body_velocity(body) else {
            return;
        };

        let ceiling = speed_ceiling(player, now);
        if let Some(clamped) = clamp_horizontal_speed(velocity, ceiling) {
            self.physics.set_body_velocity(body, clamped);
            player.velocity = clamped;
            player.speed_violations += 1;
            warn!(
                player = %player.id,
                speed = velocity.xz().norm(),
                ceiling,
                violations = player.speed_violations,
                "Speed ceiling exceeded, velocity clamped"
            );
        }
    }

    /// Pull grappling players towards their anchors, releasing on arrival
    pub(crate) fn apply_grapple_pulls(&mut self, now: u64) {
        let dt = tick_delta();
        for player in self.state.players.iter_mut() {
            if !player.is_alive() || !player.grapple.active {
                continue;
            }
            let (Some(body), Some(target)) = (player.body, player.grapple.target) else {
                continue;
            };
            let Some(position) = self.physics.body_position(body) else {
                continue;
            };

            let to_target = target - position;
            let distance = to_target.norm();
            if distance <= GRAPPLE_RELEASE_DISTANCE {
                debug!(
                    player = %player.id,
                    held_ms = now.saturating_sub(player.grapple.started_at),
                    "Grapple reached anchor"
                );
                player.grapple = Default::default();
                continue;
            }
            let pull = to_target / distance * PLAYER_MASS * GRAPPLE_PULL * dt;
            self.physics.apply_impulse(body, pull);
        }
    }

    /// Copy post-step body state into the player records and recover spread
    pub(crate) fn sync_players_from_physics(&mut self, now: u64, elapsed_ms: u64) {
        let dt = elapsed_ms as f32 / 1000.0;
        for slot in 0..2 {
            let player = &mut self.state.players[slot];
            if !player.is_alive() {
                continue;
            }
            let stats = player.loadout.active_slot().stats();
            player.loadout.spread = CombatSystem::recover_spread(player.loadout.spread, &stats, dt);

            let Some(body) = player.body else {
                continue;
            };
            if let Some(position) = self.physics.body_position(body) {
                player.position = position;
            }
            if let Some(velocity) = self.physics.body_velocity(body) {
                player.velocity = velocity;
            }
            player.grounded = self.physics.is_grounded(body);

            self.enforce_speed_limit(slot, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::tests::in_progress;
    use std::f32::consts::FRAC_PI_2;

    fn keys_forward(run: bool) -> MovementKeys {
        MovementKeys {
            forward: true,
            run,
            ..Default::default()
        }
    }

    fn frame(sequence: u32, keys: MovementKeys) -> InputFrame {
        InputFrame {
            sequence,
            delta_time: 1.0 / 60.0,
            keys,
            look: UnitQuaternion::identity(),
        }
    }

    #[test]
    fn forward_follows_yaw() {
        let identity = horizontal_forward(&UnitQuaternion::identity());
        assert!((identity - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-5);

        // Yaw +90 degrees about Y turns -Z into -X
        let yawed = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2);
        let f = horizontal_forward(&yawed);
        assert!((f - Vector3::new(-1.0, 0.0, 0.0)).norm() < 1e-5);
    }

    #[test]
    fn pitch_does_not_slow_movement() {
        let pitched = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 1.2);
        let v = desired_velocity(&keys_forward(false), &pitched);
        assert!((v.norm() - WALK_SPEED).abs() < 1e-4);
        assert_eq!(v.y, 0.0);
    }

    #[test]
    fn diagonal_is_not_faster() {
        let keys = MovementKeys {
            forward: true,
            right: true,
            run: true,
            ..Default::default()
        };
        let v = desired_velocity(&keys, &UnitQuaternion::identity());
        assert!((v.norm() - RUN_SPEED).abs() < 1e-4);
        assert!(v.x > 0.0 && v.z < 0.0);
    }

    #[test]
    fn opposing_keys_cancel() {
        let keys = MovementKeys {
            forward: true,
            back: true,
            ..Default::default()
        };
        assert_eq!(
            desired_velocity(&keys, &UnitQuaternion::identity()),
            Vector3::zeros()
        );
    }

    #[test]
    fn impulse_is_capped() {
        let desired = Vector3::new(0.0, 0.0, -RUN_SPEED);
        let impulse = movement_impulse(desired, Vector3::new(0.0, 0.0, RUN_SPEED), 0.1, true);
        assert!((impulse.norm() - MAX_MOVE_IMPULSE).abs() < 1e-3);

        let small = movement_impulse(desired, Vector3::zeros(), 1.0 / 60.0, true);
        let expected = RUN_SPEED * PLAYER_MASS * (ACCELERATION / 60.0);
        assert!((small.norm() - expected).abs() < 1e-2);
    }

    #[test]
    fn air_control_is_reduced() {
        let desired = Vector3::new(WALK_SPEED, 0.0, 0.0);
        let ground = movement_impulse(desired, Vector3::zeros(), 1.0 / 60.0, true);
        let air = movement_impulse(desired, Vector3::zeros(), 1.0 / 60.0, false);
        assert!((air.norm() - ground.norm() * AIR_CONTROL).abs() < 1e-3);
    }

    #[test]
    fn clamp_keeps_vertical_velocity() {
        assert!(clamp_horizontal_speed(Vector3::new(3.0, -30.0, 4.0), SPEED_CEILING).is_none());
        let clamped = clamp_horizontal_speed(Vector3::new(30.0, 2.0, 40.0), 10.0).unwrap();
        assert!((clamped.xz().norm() - 10.0).abs() < 1e-4);
        assert_eq!(clamped.y, 2.0);
    }

    #[test]
    fn wire_frame_is_sanitised() {
        let f = InputFrame::from_wire(
            1,
            5.0,
            MovementKeys::default(),
            Quat {
                x: 0.0,
                y: 0.0,
                z: 0.0,
                w: 2.0,
            },
        );
        assert_eq!(f.delta_time, MAX_INPUT_DELTA);
        assert!((f.look.into_inner().norm() - 1.0).abs() < 1e-6);

        let nan = InputFrame::from_wire(
            2,
            f32::NAN,
            MovementKeys::default(),
            Quat {
                x: f32::NAN,
                ..Quat::IDENTITY
            },
        );
        assert!(nan.delta_time > 0.0);
        assert_eq!(nan.look, UnitQuaternion::identity());
    }

    #[test]
    fn duplicate_sequence_changes_nothing() {
        let (mut server, now) = in_progress(3);
        assert!(server.handle_input(0, frame(1, keys_forward(true)), now));
        let body = server.player(0).body.unwrap();
        let after_first = server.physics.body_velocity(body).unwrap();

        assert!(!server.handle_input(0, frame(1, keys_forward(true)), now));
        let after_dup = server.physics.body_velocity(body).unwrap();
        assert_eq!(after_first, after_dup);
        assert_eq!(server.player(0).last_input_seq, 1);
    }

    #[test]
    fn held_run_stays_under_ceiling() {
        // Slot 1 spawns on the -Z side and runs away from the opponent
        let (mut server, mut now) = in_progress(3);
        for seq in 1..=240 {
            server.handle_input(1, frame(seq, keys_forward(true)), now);
            now += 16;
            server.tick(now);
        }
        let p = server.player(1);
        assert!(p.velocity.xz().norm() <= SPEED_CEILING + 1e-3);
        assert!(p.velocity.xz().norm() > WALK_SPEED);
        assert_eq!(p.speed_violations, 0);
    }

    #[test]
    fn excess_velocity_is_clamped_and_counted() {
        let (mut server, now) = in_progress(3);
        let body = server.player(1).body.unwrap();
        server
            .physics
            .set_body_velocity(body, Vector3::new(40.0, 0.0, 0.0));
        server.enforce_speed_limit(1, now);
        let v = server.physics.body_velocity(body).unwrap();
        assert!((v.xz().norm() - SPEED_CEILING).abs() < 1e-3);
        assert_eq!(server.player(1).speed_violations, 1);
    }

    #[test]
    fn jump_needs_ground_and_cooldown() {
        let (mut server, now) = in_progress(3);
        assert!(server.player(0).grounded);
        let jump = MovementKeys {
            jump: true,
            ..Default::default()
        };
        server.handle_input(0, frame(1, jump), now);
        let body = server.player(0).body.unwrap();
        let vy = server.physics.body_velocity(body).unwrap().y;
        assert!(vy > JUMP_SPEED * 0.9);

        // Second press in the same tick is ignored
        server.handle_input(0, frame(2, jump), now + 1);
        let vy2 = server.physics.body_velocity(body).unwrap().y;
        assert!((vy2 - vy).abs() < 1e-4);
    }

    #[test]
    fn inputs_outside_a_round_are_acknowledged_without_force() {
        let mut server = crate::game::r#match::tests::new_server(3);
        server.identify("p1", 0).unwrap();
        // Not alive yet: dropped
        assert!(!server.handle_input(0, frame(1, keys_forward(false)), 0));
        assert_eq!(server.player(0).last_input_seq, 0);
    }
}
