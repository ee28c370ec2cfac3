//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 3D vector on the wire (Y-up, forward = -Z)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Orientation quaternion on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Playable characters (fixed stat and ability profiles)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterType {
    /// Mobile rifleman with a dash
    Vanguard,
    /// Close range, self heal
    Medic,
    /// Long range, damage amplification
    Striker,
}

impl Default for CharacterType {
    fn default() -> Self {
        Self::Vanguard
    }
}

impl std::str::FromStr for CharacterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vanguard" => Ok(Self::Vanguard),
            "medic" => Ok(Self::Medic),
            "striker" => Ok(Self::Striker),
            other => Err(format!("unknown character type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponType {
    Rifle,
    Pistol,
    Shotgun,
    Sniper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrenadeType {
    Frag,
    Semtex,
    Flashbang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbilityType {
    Dash,
    Heal,
    DamageAmp,
}

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Waiting for both players to identify
    Waiting,
    /// Countdown before a round
    Countdown,
    /// Round in progress
    InProgress,
    /// Round finished, next round pending
    RoundOver,
    /// Match ended
    MatchOver,
}

/// Player lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerLifecycle {
    Waiting,
    Connected,
    Alive,
    Dead,
    Disconnected,
}

/// Movement keys held during an input frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementKeys {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
    pub run: bool,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// First message on a connection, binds it to a player slot
    Identify { player_id: String },

    /// Movement input for one client frame
    Input {
        /// Sequence number for client-side prediction reconciliation
        sequence: u32,
        /// Client frame time in seconds
        delta_time: f32,
        #[serde(default)]
        keys: MovementKeys,
        #[serde(default)]
        look_orientation: Quat,
    },

    Fire { aim_direction: Vec3 },

    SwitchWeapon { target_slot: usize },

    Reload,

    ThrowGrenade {
        grenade_type: GrenadeType,
        direction: Vec3,
    },

    UseAbility {
        #[serde(default)]
        slot: usize,
    },

    FireGrapple { target_point: Vec3 },

    ReleaseGrapple,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

impl ClientMsg {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMsg::Identify { .. } => "identify",
            ClientMsg::Input { .. } => "input",
            ClientMsg::Fire { .. } => "fire",
            ClientMsg::SwitchWeapon { .. } => "switch_weapon",
            ClientMsg::Reload => "reload",
            ClientMsg::ThrowGrenade { .. } => "throw_grenade",
            ClientMsg::UseAbility { .. } => "use_ability",
            ClientMsg::FireGrapple { .. } => "fire_grapple",
            ClientMsg::ReleaseGrapple => "release_grapple",
            ClientMsg::Ping { .. } => "ping",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Sent once after a successful identify
    Welcome {
        player_id: String,
        server_time: u64,
        snapshot: StateSnapshot,
    },

    /// Authoritative state (sent at regular intervals)
    StateSnapshot(StateSnapshot),

    HitConfirmed {
        shooter_id: String,
        victim_id: String,
        damage: f32,
        hit_point: Vec3,
    },

    PlayerDied {
        victim_id: String,
        killer_id: Option<String>,
    },

    GrenadeThrown {
        id: u64,
        grenade_type: GrenadeType,
        owner_id: String,
        position: Vec3,
        velocity: Vec3,
    },

    GrenadeExploded {
        id: u64,
        grenade_type: GrenadeType,
        position: Vec3,
    },

    AbilityUsed {
        player_id: String,
        ability_type: AbilityType,
    },

    /// Countdown before a round, once per second
    MatchCountdown { round: u32, seconds_remaining: u32 },

    RoundStarted { round: u32 },

    RoundOver {
        round: u32,
        winner_id: Option<String>,
        reason: RoundEndReason,
    },

    MatchOver { result: MatchResult },

    /// Error message, sent before the connection is closed
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        server_time: u64,
    },
}

/// Full match state as seen by one recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub server_tick: u64,
    pub match_phase: MatchPhase,
    pub map_id: String,
    pub round: u32,
    pub round_wins: BTreeMap<String, u32>,
    pub round_time_remaining_ms: u64,
    pub players: BTreeMap<String, PlayerSnapshot>,
}

/// Player state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub character: CharacterType,
    pub state: PlayerLifecycle,
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub grounded: bool,
    pub health: f32,
    pub shield: f32,
    pub weapons: [WeaponType; 2],
    pub active_weapon_slot: usize,
    pub reloading: bool,
    pub grenades: GrenadeCounts,
    pub ability: AbilityType,
    pub ability_cooldown_ms: u64,
    pub grapple: GrappleSnapshot,
    pub damage_amp_until: u64,
    pub flashed_until: u64,
    pub kills: u32,
    pub deaths: u32,
    /// Exact clip ammo per slot (owner only)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub clip_ammo: Option<[u32; 2]>,
    /// Last processed input sequence (owner only)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_processed_sequence: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrenadeCounts {
    pub frag: u8,
    pub semtex: u8,
    pub flashbang: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GrappleSnapshot {
    pub active: bool,
    pub target_point: Option<Vec3>,
    pub started_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundEndReason {
    Elimination,
    Timeout,
    Draw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchEndReason {
    RoundsWon,
    Forfeit,
}

/// Match result handed to the reporting collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: Uuid,
    pub map_id: String,
    pub winner_id: Option<String>,
    pub loser_id: Option<String>,
    pub reason: MatchEndReason,
    pub rounds_played: u32,
    pub players: Vec<PlayerResult>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerResult {
    pub player_id: String,
    pub character: CharacterType,
    pub kills: u32,
    pub deaths: u32,
    pub round_wins: u32,
}
