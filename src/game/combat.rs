//! Combat system - weapon tables, grenade tables, damage resolution

use rand::Rng;
use rapier3d::na::{UnitQuaternion, Vector3};

use crate::ws::protocol::{GrenadeType, WeaponType};

/// Damage multiplier while damage amplification is active
pub const DAMAGE_AMP_FACTOR: f32 = 1.5;

/// Weapon stats per weapon type
#[derive(Debug, Clone, Copy)]
pub struct WeaponStats {
    /// Damage per pellet
    pub damage: f32,
    /// Minimum time between shots (ms)
    pub fire_interval_ms: u64,
    /// Clip capacity
    pub clip_size: u32,
    pub reload_ms: u64,
    /// Hitscan range (m)
    pub range: f32,
    /// Spread cone half-angle after a switch or full recovery (rad)
    pub base_spread: f32,
    pub spread_per_shot: f32,
    pub max_spread: f32,
    /// Spread recovery rate (rad/s)
    pub spread_recovery: f32,
    /// Rays per shot
    pub pellets: u32,
}

impl WeaponStats {
    pub fn for_type(weapon: WeaponType) -> Self {
        match weapon {
            WeaponType::Rifle => Self {
                damage: 18.0,
                fire_interval_ms: 100,
                clip_size: 30,
                reload_ms: 2000,
                range: 120.0,
                base_spread: 0.010,
                spread_per_shot: 0.004,
                max_spread: 0.060,
                spread_recovery: 0.10,
                pellets: 1,
            },
            WeaponType::Pistol => Self {
                damage: 25.0,
                fire_interval_ms: 250,
                clip_size: 12,
                reload_ms: 1500,
                range: 80.0,
                base_spread: 0.008,
                spread_per_shot: 0.010,
                max_spread: 0.050,
                spread_recovery: 0.12,
                pellets: 1,
            },
            WeaponType::Shotgun => Self {
                damage: 12.0,
                fire_interval_ms: 900,
                clip_size: 6,
                reload_ms: 2500,
                range: 30.0,
                base_spread: 0.060,
                spread_per_shot: 0.020,
                max_spread: 0.120,
                spread_recovery: 0.15,
                pellets: 8,
            },
            WeaponType::Sniper => Self {
                damage: 90.0,
                fire_interval_ms: 1200,
                clip_size: 5,
                reload_ms: 3000,
                range: 300.0,
                base_spread: 0.0,
                spread_per_shot: 0.050,
                max_spread: 0.100,
                spread_recovery: 0.20,
                pellets: 1,
            },
        }
    }
}

/// What a grenade does when it goes off
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GrenadeEffect {
    Damage(f32),
    /// Blind duration (ms)
    Flash(u64),
}

/// Grenade stats per grenade type
#[derive(Debug, Clone, Copy)]
pub struct GrenadeStats {
    pub fuse_ms: u64,
    /// Fuse re-armed when the grenade sticks to something
    pub stuck_fuse_ms: Option<u64>,
    pub radius: f32,
    pub effect: GrenadeEffect,
}

impl GrenadeStats {
    pub fn for_type(grenade: GrenadeType) -> Self {
        match grenade {
            GrenadeType::Frag => Self {
                fuse_ms: 2500,
                stuck_fuse_ms: None,
                radius: 6.0,
                effect: GrenadeEffect::Damage(80.0),
            },
            GrenadeType::Semtex => Self {
                fuse_ms: 3000,
                stuck_fuse_ms: Some(800),
                radius: 4.0,
                effect: GrenadeEffect::Damage(100.0),
            },
            GrenadeType::Flashbang => Self {
                fuse_ms: 1800,
                stuck_fuse_ms: None,
                radius: 12.0,
                effect: GrenadeEffect::Flash(2500),
            },
        }
    }
}

/// Outcome of applying damage to a shield/health pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageResult {
    pub shield: f32,
    pub health: f32,
    /// Damage actually removed from shield + health
    pub dealt: f32,
    pub killed: bool,
}

/// Combat system for damage and spread bookkeeping
pub struct CombatSystem;

impl CombatSystem {
    /// Apply damage shield first, remainder to health. Never goes negative.
    pub fn apply_damage(shield: f32, health: f32, damage: f32) -> DamageResult {
        let damage = damage.max(0.0);
        let absorbed = damage.min(shield);
        let new_shield = shield - absorbed;
        let to_health = (damage - absorbed).min(health);
        let new_health = health - to_health;
        DamageResult {
            shield: new_shield,
            health: new_health,
            dealt: absorbed + to_health,
            killed: new_health <= 0.0,
        }
    }

    /// Amplified damage if the amp window is still open at `now`
    pub fn calculate_damage(base_damage: f32, amp_until: u64, now: u64) -> f32 {
        if amp_until > now {
            base_damage * DAMAGE_AMP_FACTOR
        } else {
            base_damage
        }
    }

    /// Spread after one more shot
    pub fn spread_after_shot(current: f32, stats: &WeaponStats) -> f32 {
        (current + stats.spread_per_shot).min(stats.max_spread)
    }

    /// Spread after `dt` seconds of recovery
    pub fn recover_spread(current: f32, stats: &WeaponStats, dt: f32) -> f32 {
        (current - stats.spread_recovery * dt).max(stats.base_spread)
    }

    /// Deflect `dir` by a random angle of at most `spread` radians
    pub fn apply_spread<R: Rng>(dir: Vector3<f32>, spread: f32, rng: &mut R) -> Vector3<f32> {
        let Some(dir) = dir.try_normalize(1.0e-6) else {
            return dir;
        };
        if spread <= 0.0 {
            return dir;
        }

        // Any axis perpendicular to dir, rotated around dir by a random roll
        let helper = if dir.y.abs() < 0.9 {
            Vector3::y()
        } else {
            Vector3::x()
        };
        let perpendicular = dir.cross(&helper).normalize();
        let roll = UnitQuaternion::from_scaled_axis(dir * rng.gen_range(0.0..std::f32::consts::TAU));
        let axis = roll * perpendicular;

        let deflection = UnitQuaternion::from_scaled_axis(axis * rng.gen_range(0.0..=spread));
        deflection * dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn shield_absorbs_before_health() {
        // Scenario: shield 50, health 100, frag for 80
        let result = CombatSystem::apply_damage(50.0, 100.0, 80.0);
        assert_eq!(result.shield, 0.0);
        assert_eq!(result.health, 70.0);
        assert_eq!(result.dealt, 80.0);
        assert!(!result.killed);
    }

    #[test]
    fn partial_shield_hit_leaves_health_untouched() {
        let result = CombatSystem::apply_damage(50.0, 100.0, 20.0);
        assert_eq!(result.shield, 30.0);
        assert_eq!(result.health, 100.0);
    }

    #[test]
    fn overkill_clamps_at_zero() {
        let result = CombatSystem::apply_damage(10.0, 20.0, 500.0);
        assert_eq!(result.shield, 0.0);
        assert_eq!(result.health, 0.0);
        assert_eq!(result.dealt, 30.0);
        assert!(result.killed);
    }

    #[test]
    fn negative_damage_is_ignored() {
        let result = CombatSystem::apply_damage(10.0, 20.0, -5.0);
        assert_eq!(result.shield, 10.0);
        assert_eq!(result.health, 20.0);
    }

    #[test]
    fn amp_only_applies_inside_window() {
        assert_eq!(CombatSystem::calculate_damage(20.0, 1000, 999), 30.0);
        assert_eq!(CombatSystem::calculate_damage(20.0, 1000, 1000), 20.0);
    }

    #[test]
    fn spread_grows_and_recovers_within_bounds() {
        let stats = WeaponStats::for_type(WeaponType::Rifle);
        let mut spread = stats.base_spread;
        for _ in 0..100 {
            spread = CombatSystem::spread_after_shot(spread, &stats);
        }
        assert_eq!(spread, stats.max_spread);
        let recovered = CombatSystem::recover_spread(spread, &stats, 10.0);
        assert_eq!(recovered, stats.base_spread);
    }

    #[test]
    fn spread_direction_stays_inside_cone() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let dir = Vector3::new(0.0, 0.0, -1.0);
        for _ in 0..200 {
            let out = CombatSystem::apply_spread(dir, 0.05, &mut rng);
            assert!((out.norm() - 1.0).abs() < 1.0e-4);
            assert!(out.angle(&dir) <= 0.05 + 1.0e-4);
        }
    }

    #[test]
    fn zero_spread_keeps_direction() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dir = Vector3::new(0.0, 0.0, -2.0);
        let out = CombatSystem::apply_spread(dir, 0.0, &mut rng);
        assert!((out - Vector3::new(0.0, 0.0, -1.0)).norm() < 1.0e-6);
    }
}
