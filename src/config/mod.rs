//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use uuid::Uuid;

use crate::ws::protocol::CharacterType;

/// Identity and character for one of the two player slots
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerConfig {
    pub id: String,
    pub character: CharacterType,
}

impl PlayerConfig {
    pub fn new(id: impl Into<String>, character: CharacterType) -> Self {
        Self {
            id: id.into(),
            character,
        }
    }
}

/// Everything the match itself needs, separated from server plumbing
#[derive(Clone, Debug)]
pub struct MatchSettings {
    pub match_id: Uuid,
    pub seed: u64,
    pub map_id: String,
    pub players: [PlayerConfig; 2],
    /// Round wins needed to take the match
    pub rounds_to_win: u32,
    pub round_time_secs: u32,
    pub countdown_secs: u32,
}

impl MatchSettings {
    /// Settings with default timings for the given players
    #[cfg(test)]
    pub fn new(map_id: impl Into<String>, players: [PlayerConfig; 2]) -> Self {
        Self {
            match_id: Uuid::new_v4(),
            seed: 0,
            map_id: map_id.into(),
            players,
            rounds_to_win: 3,
            round_time_secs: 120,
            countdown_secs: 3,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human readable ones
    pub log_json: bool,

    /// Directory holding `<map_id>.json` map definitions
    pub map_dir: PathBuf,

    /// Optional endpoint receiving the final match result
    pub result_webhook_url: Option<String>,
    /// Allowed client origins for CORS (comma-separated), any if unset
    pub client_origin: Option<String>,

    pub settings: MatchSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let players = [player_from_env(1)?, player_from_env(2)?];
        if players[0].id == players[1].id {
            return Err(ConfigError::DuplicatePlayerId(players[0].id.clone()));
        }

        let match_id = match env::var("MATCH_ID") {
            Ok(raw) => parse_value("MATCH_ID", &raw)?,
            Err(_) => Uuid::new_v4(),
        };

        let settings = MatchSettings {
            match_id,
            seed: optional("MATCH_SEED")?.unwrap_or_else(rand::random),
            map_id: env::var("MAP_ID").unwrap_or_else(|_| "arena".to_string()),
            players,
            rounds_to_win: optional("ROUNDS_TO_WIN")?.unwrap_or(3),
            round_time_secs: optional("ROUND_TIME_SECS")?.unwrap_or(120),
            countdown_secs: optional("COUNTDOWN_SECS")?.unwrap_or(3),
        };
        if settings.rounds_to_win == 0 {
            return Err(ConfigError::Invalid {
                key: "ROUNDS_TO_WIN",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),

            map_dir: env::var("MAP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("maps")),

            result_webhook_url: env::var("RESULT_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
            client_origin: env::var("CLIENT_ORIGIN").ok().filter(|o| !o.is_empty()),

            settings,
        })
    }
}

fn player_from_env(n: u8) -> Result<PlayerConfig, ConfigError> {
    let (id_key, character_key) = match n {
        1 => ("PLAYER1_ID", "PLAYER1_CHARACTER"),
        _ => ("PLAYER2_ID", "PLAYER2_CHARACTER"),
    };

    let id = env::var(id_key).map_err(|_| ConfigError::Missing(id_key))?;
    if id.trim().is_empty() {
        return Err(ConfigError::Missing(id_key));
    }

    let character = match env::var(character_key) {
        Ok(raw) => parse_value(character_key, &raw)?,
        Err(_) => CharacterType::default(),
    };

    Ok(PlayerConfig::new(id.trim(), character))
}

fn optional<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Both player slots use the id {0:?}")]
    DuplicatePlayerId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_reports_key() {
        let err = parse_value::<u32>("ROUNDS_TO_WIN", "three").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ROUNDS_TO_WIN", .. }));
        assert_eq!(parse_value::<u32>("ROUNDS_TO_WIN", " 5 ").unwrap(), 5);
    }

    #[test]
    fn match_settings_defaults() {
        let settings = MatchSettings::new(
            "arena",
            [
                PlayerConfig::new("p1", CharacterType::Vanguard),
                PlayerConfig::new("p2", CharacterType::Medic),
            ],
        );
        assert_eq!(settings.rounds_to_win, 3);
        assert_eq!(settings.countdown_secs, 3);
        assert_eq!(settings.round_time_secs, 120);
    }
}
