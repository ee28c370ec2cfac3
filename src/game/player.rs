//! Authoritative per-player state

use std::collections::VecDeque;

use rapier3d::na::{UnitQuaternion, Vector3};
use rapier3d::prelude::RigidBodyHandle;

use crate::config::PlayerConfig;
use crate::ws::protocol::{
    AbilityType, CharacterType, GrenadeCounts, GrenadeType, PlayerLifecycle, WeaponType,
};

use super::combat::{CombatSystem, DamageResult, WeaponStats};
use super::movement::InputFrame;

/// Index of a player within the match (0 or 1)
pub type PlayerSlot = usize;

/// Accepted inputs kept per player for reconciliation
pub const INPUT_HISTORY_CAPACITY: usize = 64;

/// Grenades of each type granted at the start of every round
pub const GRENADES_PER_ROUND: u8 = 1;

/// Fixed stat and ability profile per character
#[derive(Debug, Clone, Copy)]
pub struct CharacterProfile {
    pub max_health: f32,
    pub max_shield: f32,
    pub ability: AbilityType,
    pub ability_cooldown_ms: u64,
    pub weapons: [WeaponType; 2],
}

impl CharacterProfile {
    pub fn for_type(character: CharacterType) -> Self {
        match character {
            CharacterType::Vanguard => Self {
                max_health: 100.0,
                max_shield: 50.0,
                ability: AbilityType::Dash,
                ability_cooldown_ms: 4000,
                weapons: [WeaponType::Rifle, WeaponType::Pistol],
            },
            CharacterType::Medic => Self {
                max_health: 100.0,
                max_shield: 75.0,
                ability: AbilityType::Heal,
                ability_cooldown_ms: 12_000,
                weapons: [WeaponType::Shotgun, WeaponType::Pistol],
            },
            CharacterType::Striker => Self {
                max_health: 90.0,
                max_shield: 50.0,
                ability: AbilityType::DamageAmp,
                ability_cooldown_ms: 15_000,
                weapons: [WeaponType::Sniper, WeaponType::Pistol],
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WeaponSlot {
    pub weapon: WeaponType,
    pub ammo: u32,
}

impl WeaponSlot {
    pub fn full(weapon: WeaponType) -> Self {
        Self {
            weapon,
            ammo: WeaponStats::for_type(weapon).clip_size,
        }
    }

    pub fn stats(&self) -> WeaponStats {
        WeaponStats::for_type(self.weapon)
    }

    pub fn is_full(&self) -> bool {
        self.ammo >= self.stats().clip_size
    }

    pub fn refill(&mut self) {
        self.ammo = self.stats().clip_size;
    }
}

/// Two weapon slots, each keeping its own clip
#[derive(Debug, Clone)]
pub struct Loadout {
    pub slots: [WeaponSlot; 2],
    pub active: usize,
    /// Slot currently being reloaded
    pub reloading: Option<usize>,
    /// Current spread cone half-angle of the active weapon
    pub spread: f32,
    pub last_shot_at: Option<u64>,
}

impl Loadout {
    pub fn new(weapons: [WeaponType; 2]) -> Self {
        let slots = [WeaponSlot::full(weapons[0]), WeaponSlot::full(weapons[1])];
        Self {
            spread: slots[0].stats().base_spread,
            slots,
            active: 0,
            reloading: None,
            last_shot_at: None,
        }
    }

    pub fn active_slot(&self) -> &WeaponSlot {
        &self.slots[self.active]
    }

    pub fn active_slot_mut(&mut self) -> &mut WeaponSlot {
        &mut self.slots[self.active]
    }

    pub fn weapons(&self) -> [WeaponType; 2] {
        [self.slots[0].weapon, self.slots[1].weapon]
    }

    pub fn clip_ammo(&self) -> [u32; 2] {
        [self.slots[0].ammo, self.slots[1].ammo]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GrappleState {
    pub active: bool,
    pub target: Option<Vector3<f32>>,
    pub started_at: u64,
}

/// Most recent accepted inputs, oldest evicted first
#[derive(Debug, Clone, Default)]
pub struct InputHistory {
    frames: VecDeque<InputFrame>,
}

impl InputHistory {
    pub fn push(&mut self, frame: InputFrame) {
        if self.frames.len() == INPUT_HISTORY_CAPACITY {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    #[cfg(test)]
    pub fn get(&self, sequence: u32) -> Option<&InputFrame> {
        self.frames.iter().rev().find(|f| f.sequence == sequence)
    }

    #[cfg(test)]
    pub fn latest(&self) -> Option<&InputFrame> {
        self.frames.back()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Player state in a match (authoritative)
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: String,
    pub slot: PlayerSlot,
    pub character: CharacterType,
    pub profile: CharacterProfile,
    pub state: PlayerLifecycle,

    // Cached projection of the physics body
    pub body: Option<RigidBodyHandle>,
    pub position: Vector3<f32>,
    pub orientation: UnitQuaternion<f32>,
    pub velocity: Vector3<f32>,
    pub grounded: bool,

    // Combat
    pub health: f32,
    pub shield: f32,
    pub loadout: Loadout,
    pub grenades: [u8; 3],
    /// Ability can be used again from this time (ms)
    pub ability_ready_at: u64,
    pub grapple: GrappleState,
    pub damage_amp_until: u64,
    pub flashed_until: u64,
    pub dash_until: u64,

    // Input tracking
    pub last_input_seq: u32,
    pub input_history: InputHistory,
    pub last_jump_at: Option<u64>,
    pub speed_violations: u32,

    // Stats
    pub kills: u32,
    pub deaths: u32,
}

impl PlayerRecord {
    pub fn new(slot: PlayerSlot, config: &PlayerConfig) -> Self {
        let profile = CharacterProfile::for_type(config.character);
        Self {
            id: config.id.clone(),
            slot,
            character: config.character,
            profile,
            state: PlayerLifecycle::Waiting,
            body: None,
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            grounded: false,
            health: profile.max_health,
            shield: profile.max_shield,
            loadout: Loadout::new(profile.weapons),
            grenades: [GRENADES_PER_ROUND; 3],
            ability_ready_at: 0,
            grapple: GrappleState::default(),
            damage_amp_until: 0,
            flashed_until: 0,
            dash_until: 0,
            last_input_seq: 0,
            input_history: InputHistory::default(),
            last_jump_at: None,
            speed_violations: 0,
            kills: 0,
            deaths: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == PlayerLifecycle::Alive
    }

    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state,
            PlayerLifecycle::Waiting | PlayerLifecycle::Disconnected
        )
    }

    /// Restore every per-round resource to the character base
    pub fn reset_for_round(&mut self) {
        self.health = self.profile.max_health;
        self.shield = self.profile.max_shield;
        self.loadout = Loadout::new(self.profile.weapons);
        self.grenades = [GRENADES_PER_ROUND; 3];
        self.ability_ready_at = 0;
        self.grapple = GrappleState::default();
        self.damage_amp_until = 0;
        self.flashed_until = 0;
        self.dash_until = 0;
        self.last_jump_at = None;
    }

    pub fn ability_cooldown_remaining(&self, now: u64) -> u64 {
        self.ability_ready_at.saturating_sub(now)
    }

    /// Shield-first damage. Returns the applied result.
    pub fn take_damage(&mut self, damage: f32) -> DamageResult {
        let result = CombatSystem::apply_damage(self.shield, self.health, damage);
        self.shield = result.shield;
        self.health = result.health;
        result
    }

    /// Shield first, then health, both capped at the character maximums
    pub fn heal(&mut self, amount: f32) {
        let to_shield = amount.max(0.0).min(self.profile.max_shield - self.shield);
        self.shield += to_shield;
        let rest = amount.max(0.0) - to_shield;
        self.health = (self.health + rest).min(self.profile.max_health);
    }

    pub fn grenade_count(&self, grenade: GrenadeType) -> u8 {
        self.grenades[grenade_index(grenade)]
    }

    pub fn grenade_counts(&self) -> GrenadeCounts {
        GrenadeCounts {
            frag: self.grenades[0],
            semtex: self.grenades[1],
            flashbang: self.grenades[2],
        }
    }

    /// Record an input frame if it is newer than anything processed so far
    pub fn accept_input(&mut self, frame: InputFrame) -> bool {
        if frame.sequence <= self.last_input_seq {
            return false;
        }
        self.last_input_seq = frame.sequence;
        self.orientation = frame.look;
        self.input_history.push(frame);
        true
    }
}

pub fn grenade_index(grenade: GrenadeType) -> usize {
    match grenade {
        GrenadeType::Frag => 0,
        GrenadeType::Semtex => 1,
        GrenadeType::Flashbang => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::MovementKeys;

    fn record(character: CharacterType) -> PlayerRecord {
        PlayerRecord::new(0, &PlayerConfig::new("p1", character))
    }

    fn frame(sequence: u32) -> InputFrame {
        InputFrame {
            sequence,
            delta_time: 1.0 / 60.0,
            keys: MovementKeys::default(),
            look: UnitQuaternion::identity(),
        }
    }

    #[test]
    fn new_record_starts_full() {
        let p = record(CharacterType::Vanguard);
        assert_eq!(p.health, 100.0);
        assert_eq!(p.shield, 50.0);
        assert_eq!(p.loadout.clip_ammo(), [30, 12]);
        assert_eq!(p.grenades, [1, 1, 1]);
        assert_eq!(p.state, PlayerLifecycle::Waiting);
    }

    #[test]
    fn heal_fills_shield_then_health() {
        let mut p = record(CharacterType::Medic);
        p.take_damage(100.0);
        assert_eq!(p.shield, 0.0);
        assert_eq!(p.health, 75.0);
        p.heal(50.0);
        assert_eq!(p.shield, 50.0);
        assert_eq!(p.health, 75.0);
        p.heal(50.0);
        assert_eq!(p.shield, 75.0);
        assert_eq!(p.health, 100.0);
    }

    #[test]
    fn reset_restores_round_resources() {
        let mut p = record(CharacterType::Striker);
        p.take_damage(120.0);
        p.grenades = [0, 0, 0];
        p.loadout.slots[0].ammo = 0;
        p.loadout.active = 1;
        p.loadout.reloading = Some(1);
        p.ability_ready_at = 9000;
        p.grapple.active = true;
        p.kills = 2;

        p.reset_for_round();

        assert_eq!(p.health, p.profile.max_health);
        assert_eq!(p.shield, p.profile.max_shield);
        assert_eq!(p.grenades, [1, 1, 1]);
        assert_eq!(p.loadout.clip_ammo(), [5, 12]);
        assert_eq!(p.loadout.active, 0);
        assert_eq!(p.loadout.reloading, None);
        assert_eq!(p.ability_ready_at, 0);
        assert!(!p.grapple.active);
        // lifetime score survives the reset
        assert_eq!(p.kills, 2);
    }

    #[test]
    fn stale_and_duplicate_inputs_are_refused() {
        let mut p = record(CharacterType::Vanguard);
        assert!(p.accept_input(frame(10)));
        assert!(!p.accept_input(frame(8)));
        assert!(!p.accept_input(frame(10)));
        assert_eq!(p.last_input_seq, 10);
        // newer but out of order is fine
        assert!(p.accept_input(frame(12)));
        assert!(!p.accept_input(frame(11)));
        assert_eq!(p.input_history.len(), 2);
    }

    #[test]
    fn input_history_is_bounded() {
        let mut p = record(CharacterType::Vanguard);
        for seq in 1..=(INPUT_HISTORY_CAPACITY as u32 + 10) {
            p.accept_input(frame(seq));
        }
        assert_eq!(p.input_history.len(), INPUT_HISTORY_CAPACITY);
        assert!(p.input_history.get(1).is_none());
        assert_eq!(
            p.input_history.latest().map(|f| f.sequence),
            Some(INPUT_HISTORY_CAPACITY as u32 + 10)
        );
    }
}
