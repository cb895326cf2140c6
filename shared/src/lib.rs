use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;

pub const LOBBY_CODE_LEN: usize = 6;
pub const LOBBY_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const MAX_HEALTH: u32 = 100;
pub const BASE_DAMAGE: u32 = 10;
pub const HIT_REWARD: u32 = 10;
pub const ELIMINATION_BONUS: u32 = 100;
pub const COUNTDOWN_TICKS: u32 = 5;

pub const HEALTH_PACK_CODE: &str = "POWERUP-HEALTH";
pub const HEALTH_PACK_THRESHOLD: u32 = 300;
pub const HEALTH_PACK_RESTORE: u32 = 50;
pub const DOUBLE_DAMAGE_CODE: &str = "POWERUP-DOUBLE";
pub const DOUBLE_DAMAGE_THRESHOLD: u32 = 500;
pub const DOUBLE_DAMAGE_MULTIPLIER: u32 = 2;
pub const DOUBLE_DAMAGE_DURATION_MS: u64 = 30_000;

/// Opaque per-connection handle assigned by the server.
pub type SessionId = u32;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Lifecycle stage of a lobby. Transitions are owned by the server's
/// state machine; clients only ever observe these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyPhase {
    Waiting,
    Starting,
    TagAssignment,
    Active,
    Finished,
}

/// How a connection participates in a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Player,
    Spectator,
}

/// What a scanned code is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    Combat,
    PowerUp,
}

/// Score-gated combat modifiers a player can claim by scanning the
/// matching power-up code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerUpKind {
    HealthPack,
    DoubleDamage,
}

impl PowerUpKind {
    /// Maps a scanned power-up code to its kind.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            HEALTH_PACK_CODE => Some(Self::HealthPack),
            DOUBLE_DAMAGE_CODE => Some(Self::DoubleDamage),
            _ => None,
        }
    }

    /// Score required per eligible claim of this kind.
    pub fn threshold(self) -> u32 {
        match self {
            Self::HealthPack => HEALTH_PACK_THRESHOLD,
            Self::DoubleDamage => DOUBLE_DAMAGE_THRESHOLD,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::HealthPack => "health pack",
            Self::DoubleDamage => "double damage",
        }
    }
}

/// Why a player left the set of living participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EliminationReason {
    Scan,
    Forfeit,
}

/// Public view of one participant, included in lobby snapshots.
/// Tag codes are never exposed to other clients; only whether one
/// has been claimed.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ParticipantInfo {
    pub id: SessionId,
    pub name: String,
    pub is_host: bool,
    pub is_ready: bool,
    pub health: u32,
    pub score: u32,
    pub eliminations: u32,
    pub is_alive: bool,
    pub has_tag_code: bool,
}

/// Full state of a lobby as broadcast to its room.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LobbySnapshot {
    pub code: String,
    pub phase: LobbyPhase,
    pub host: SessionId,
    pub capacity: u32,
    pub duration_minutes: u32,
    pub players: Vec<ParticipantInfo>,
    pub spectator_count: u32,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
}

/// One row of the lobby-discovery listing for spectators.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActiveLobbySummary {
    pub code: String,
    pub players_alive: u32,
    pub max_players: u32,
    pub time_left_ms: u64,
    pub spectator_count: u32,
}

/// Final standing of one participant.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RankedResult {
    pub rank: u32,
    pub id: SessionId,
    pub name: String,
    pub score: u32,
    pub eliminations: u32,
    pub is_alive: bool,
    pub survival_time_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FinalStats {
    pub duration_ms: u64,
    pub total_players: u32,
}

/// Wire protocol. Client-to-server requests first, then the server's
/// direct acknowledgements, then room-wide events.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    CreateLobby {
        capacity: u32,
        duration_minutes: u32,
        player_name: String,
    },
    JoinLobby {
        lobby_code: String,
        name: String,
        role: Role,
    },
    LeaveLobby,
    PlayerReady {
        ready: bool,
    },
    Forfeit,
    AssignTagCode {
        code: String,
    },
    Scan {
        target_code: String,
        scan_type: ScanType,
    },
    GetActiveLobbies,
    Disconnect,

    Connected {
        session_id: SessionId,
    },
    LobbyCreated {
        lobby: LobbySnapshot,
    },
    JoinAccepted {
        role: Role,
        lobby: LobbySnapshot,
    },
    JoinRejected {
        reason: String,
    },
    TagAssignAck {
        success: bool,
        player_name: Option<String>,
        message: Option<String>,
    },
    ScanAck {
        success: bool,
        target_name: Option<String>,
        points_earned: u32,
        new_score: u32,
        message: Option<String>,
    },
    PowerUpAck {
        success: bool,
        kind: Option<PowerUpKind>,
        points_needed: u32,
        message: Option<String>,
    },
    ActiveLobbies {
        lobbies: Vec<ActiveLobbySummary>,
    },
    Disconnected {
        reason: String,
    },

    PlayerJoined {
        lobby: LobbySnapshot,
    },
    PlayerLeft {
        lobby: LobbySnapshot,
    },
    LobbyUpdated {
        lobby: LobbySnapshot,
    },
    SpectatorJoined {
        name: String,
    },
    GameStarting,
    Countdown {
        n: u32,
    },
    CountdownCanceled,
    TagAssignmentPhase,
    TagAssignmentProgress {
        assigned: u32,
        total: u32,
    },
    GameStarted {
        start_time: u64,
        end_time: u64,
        duration_minutes: u32,
    },
    GameTimer {
        time_left_secs: u64,
        players_alive: u32,
    },
    PlayerDamaged {
        player_id: SessionId,
        health: u32,
        damage: u32,
        shooter_id: SessionId,
    },
    PlayerEliminated {
        player_id: SessionId,
        player_name: String,
        shooter_id: Option<SessionId>,
        reason: EliminationReason,
        is_last_eliminated: bool,
    },
    PowerUpExpired {
        kind: PowerUpKind,
    },
    GameEnded {
        results: Vec<RankedResult>,
        winner: RankedResult,
        final_stats: FinalStats,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_up_from_code() {
        assert_eq!(
            PowerUpKind::from_code("POWERUP-HEALTH"),
            Some(PowerUpKind::HealthPack)
        );
        assert_eq!(
            PowerUpKind::from_code("POWERUP-DOUBLE"),
            Some(PowerUpKind::DoubleDamage)
        );
        assert_eq!(PowerUpKind::from_code("POWERUP-NUKE"), None);
        assert_eq!(PowerUpKind::from_code(""), None);
    }

    #[test]
    fn test_power_up_thresholds() {
        assert_eq!(PowerUpKind::HealthPack.threshold(), HEALTH_PACK_THRESHOLD);
        assert_eq!(
            PowerUpKind::DoubleDamage.threshold(),
            DOUBLE_DAMAGE_THRESHOLD
        );
    }

    #[test]
    fn test_lobby_code_alphabet() {
        assert_eq!(LOBBY_CODE_ALPHABET.len(), 36);
        for c in LOBBY_CODE_ALPHABET {
            assert!(c.is_ascii_uppercase() || c.is_ascii_digit());
        }
    }

    #[test]
    fn test_packet_serialization_connect() {
        let packet = Packet::Connect { client_version: 1 };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Connect { client_version } => assert_eq!(client_version, 1),
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_create_lobby() {
        let packet = Packet::CreateLobby {
            capacity: 4,
            duration_minutes: 15,
            player_name: "Host".to_string(),
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::CreateLobby {
                capacity,
                duration_minutes,
                player_name,
            } => {
                assert_eq!(capacity, 4);
                assert_eq!(duration_minutes, 15);
                assert_eq!(player_name, "Host");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_scan() {
        let packet = Packet::Scan {
            target_code: "TAG-42".to_string(),
            scan_type: ScanType::Combat,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Scan {
                target_code,
                scan_type,
            } => {
                assert_eq!(target_code, "TAG-42");
                assert_eq!(scan_type, ScanType::Combat);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_game_ended() {
        let winner = RankedResult {
            rank: 1,
            id: 7,
            name: "Ada".to_string(),
            score: 250,
            eliminations: 2,
            is_alive: true,
            survival_time_ms: 60_000,
        };

        let packet = Packet::GameEnded {
            results: vec![winner.clone()],
            winner,
            final_stats: FinalStats {
                duration_ms: 60_000,
                total_players: 2,
            },
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::GameEnded {
                results,
                winner,
                final_stats,
            } => {
                assert_eq!(results.len(), 1);
                assert_eq!(winner.rank, 1);
                assert_eq!(winner.name, "Ada");
                assert_eq!(final_stats.total_players, 2);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_lobby_snapshot_roundtrip() {
        let snapshot = LobbySnapshot {
            code: "A1B2C3".to_string(),
            phase: LobbyPhase::Waiting,
            host: 1,
            capacity: 4,
            duration_minutes: 15,
            players: vec![ParticipantInfo {
                id: 1,
                name: "Host".to_string(),
                is_host: true,
                is_ready: false,
                health: MAX_HEALTH,
                score: 0,
                eliminations: 0,
                is_alive: true,
                has_tag_code: false,
            }],
            spectator_count: 0,
            start_time: None,
            end_time: None,
        };

        let packet = Packet::LobbyUpdated { lobby: snapshot };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::LobbyUpdated { lobby } => {
                assert_eq!(lobby.code, "A1B2C3");
                assert_eq!(lobby.phase, LobbyPhase::Waiting);
                assert_eq!(lobby.players.len(), 1);
                assert!(lobby.players[0].is_host);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_now_ms_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: later than 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }
}
