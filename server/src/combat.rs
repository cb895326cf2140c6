//! Combat and scoring engine
//!
//! Server-authoritative resolution of tag scans, power-up claims,
//! forfeits, and final rankings. Every function here validates before it
//! mutates: a rejected action leaves the lobby untouched and reports a
//! failure the gateway forwards verbatim to the requester.

use crate::lobby::{Lobby, PowerUpEffect};
use log::debug;
use shared::{
    FinalStats, LobbyPhase, PowerUpKind, RankedResult, SessionId, BASE_DAMAGE,
    DOUBLE_DAMAGE_DURATION_MS, DOUBLE_DAMAGE_MULTIPLIER, ELIMINATION_BONUS, HEALTH_PACK_RESTORE,
    HIT_REWARD, MAX_HEALTH,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("Game is not active")]
    GameNotActive,
    #[error("Scanner is not a player in this game")]
    ScannerNotFound,
    #[error("Eliminated players cannot scan")]
    ScannerEliminated,
    #[error("You cannot scan your own tag")]
    SelfScan,
    #[error("No player has claimed that tag code")]
    UnknownTagCode,
    #[error("Target is already eliminated")]
    TargetEliminated,
}

/// Result of a successful combat scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub target_id: SessionId,
    pub target_name: String,
    pub damage: u32,
    pub target_health: u32,
    pub points_earned: u32,
    pub scanner_score: u32,
    pub eliminated: bool,
}

/// Resolves a combat scan of `target_code` by `scanner_id`.
///
/// Damage is the base amount times the scanner's unexpired damage
/// multiplier. A hit that drops the target to zero health eliminates it
/// and credits the scanner with the elimination bonus.
pub fn resolve_scan(
    lobby: &mut Lobby,
    scanner_id: SessionId,
    target_code: &str,
    now: u64,
) -> Result<ScanOutcome, ScanError> {
    if lobby.phase != LobbyPhase::Active {
        return Err(ScanError::GameNotActive);
    }

    let scanner = lobby.player(scanner_id).ok_or(ScanError::ScannerNotFound)?;
    if !scanner.is_alive {
        return Err(ScanError::ScannerEliminated);
    }
    let multiplier = scanner.damage_multiplier(now);

    let target_id = lobby
        .find_by_tag_code(target_code.trim())
        .ok_or(ScanError::UnknownTagCode)?;
    if target_id == scanner_id {
        return Err(ScanError::SelfScan);
    }

    let damage = BASE_DAMAGE * multiplier;
    let (target_name, target_health, eliminated) = {
        let target = lobby.player_mut(target_id).ok_or(ScanError::UnknownTagCode)?;
        if !target.is_alive {
            return Err(ScanError::TargetEliminated);
        }

        target.health = target.health.saturating_sub(damage);
        let eliminated = target.health == 0;
        if eliminated {
            target.is_alive = false;
            target.eliminated_at = Some(now);
        }
        (target.name.clone(), target.health, eliminated)
    };

    let mut points_earned = HIT_REWARD;
    if eliminated {
        points_earned += ELIMINATION_BONUS;
    }

    // The scanner was validated above and removal cannot have interleaved.
    let scanner_score = {
        let scanner = lobby.player_mut(scanner_id).ok_or(ScanError::ScannerNotFound)?;
        scanner.score += points_earned;
        if eliminated {
            scanner.eliminations += 1;
        }
        scanner.score
    };

    debug!(
        "Lobby {}: session {} hit {} for {} ({} hp left)",
        lobby.code, scanner_id, target_name, damage, target_health
    );

    Ok(ScanOutcome {
        target_id,
        target_name,
        damage,
        target_health,
        points_earned,
        scanner_score,
        eliminated,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowerUpError {
    #[error("Game is not active")]
    GameNotActive,
    #[error("Player not found in lobby")]
    PlayerNotFound,
    #[error("Eliminated players cannot claim power-ups")]
    PlayerEliminated,
    #[error("Unknown power-up code")]
    UnknownCode,
    #[error("You need {needed} more points for the {label}")]
    NotEnoughPoints { needed: u32, label: &'static str },
}

/// Result of a successful power-up claim.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerUpOutcome {
    pub kind: PowerUpKind,
    /// Total claims of this kind by the player, after this one.
    pub claims: u32,
    /// Set for instant health restores.
    pub new_health: Option<u32>,
    /// Set for timed effects; the gateway schedules the expiry.
    pub effect: Option<PowerUpEffect>,
}

/// Claims the power-up identified by `code` for `player_id`.
///
/// A kind with threshold T may be claimed `floor(score / T)` times in
/// total; a claim beyond that is rejected with the points still needed
/// for the next one.
pub fn claim_power_up(
    lobby: &mut Lobby,
    player_id: SessionId,
    code: &str,
    now: u64,
) -> Result<PowerUpOutcome, PowerUpError> {
    if lobby.phase != LobbyPhase::Active {
        return Err(PowerUpError::GameNotActive);
    }
    let kind = PowerUpKind::from_code(code.trim()).ok_or(PowerUpError::UnknownCode)?;

    let claims = {
        let player = lobby.player(player_id).ok_or(PowerUpError::PlayerNotFound)?;
        if !player.is_alive {
            return Err(PowerUpError::PlayerEliminated);
        }

        let threshold = kind.threshold();
        let eligible = player.score / threshold;
        let claimed = player.power_up_claims.get(&kind).copied().unwrap_or(0);
        if claimed >= eligible {
            let needed = (claimed + 1) * threshold - player.score;
            return Err(PowerUpError::NotEnoughPoints {
                needed,
                label: kind.label(),
            });
        }
        claimed + 1
    };

    match kind {
        PowerUpKind::HealthPack => {
            let player = lobby
                .player_mut(player_id)
                .ok_or(PowerUpError::PlayerNotFound)?;
            *player.power_up_claims.entry(kind).or_insert(0) += 1;
            player.health = (player.health + HEALTH_PACK_RESTORE).min(MAX_HEALTH);
            Ok(PowerUpOutcome {
                kind,
                claims,
                new_health: Some(player.health),
                effect: None,
            })
        }
        PowerUpKind::DoubleDamage => {
            // Supersedes any earlier damage effect; its expiry task will
            // see a stale effect id and do nothing.
            let effect = PowerUpEffect {
                kind,
                multiplier: DOUBLE_DAMAGE_MULTIPLIER,
                expires_at: now + DOUBLE_DAMAGE_DURATION_MS,
                effect_id: lobby.next_effect_id(),
            };
            let player = lobby
                .player_mut(player_id)
                .ok_or(PowerUpError::PlayerNotFound)?;
            *player.power_up_claims.entry(kind).or_insert(0) += 1;
            player.damage_effect = Some(effect.clone());
            Ok(PowerUpOutcome {
                kind,
                claims,
                new_health: None,
                effect: Some(effect),
            })
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForfeitError {
    #[error("Game is not in progress")]
    GameNotInProgress,
    #[error("Player not found in lobby")]
    PlayerNotFound,
    #[error("Player is already eliminated")]
    AlreadyEliminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForfeitOutcome {
    pub player_name: String,
}

/// An elimination with no shooter. Valid from tag assignment onward so
/// a player who refuses to claim a tag can still bow out.
pub fn forfeit(
    lobby: &mut Lobby,
    player_id: SessionId,
    now: u64,
) -> Result<ForfeitOutcome, ForfeitError> {
    if !matches!(lobby.phase, LobbyPhase::TagAssignment | LobbyPhase::Active) {
        return Err(ForfeitError::GameNotInProgress);
    }
    let player = lobby.player_mut(player_id).ok_or(ForfeitError::PlayerNotFound)?;
    if !player.is_alive {
        return Err(ForfeitError::AlreadyEliminated);
    }

    player.is_alive = false;
    player.eliminated_at = Some(now);

    Ok(ForfeitOutcome {
        player_name: player.name.clone(),
    })
}

/// Ranks every participant: survivors first, then by score, with
/// survival time measured from game start to elimination (or game end).
pub fn compute_results(lobby: &Lobby, game_end: u64) -> (Vec<RankedResult>, FinalStats) {
    let start = lobby.start_time.unwrap_or(game_end);

    let mut results: Vec<RankedResult> = lobby
        .players()
        .map(|p| RankedResult {
            rank: 0,
            id: p.id,
            name: p.name.clone(),
            score: p.score,
            eliminations: p.eliminations,
            is_alive: p.is_alive,
            survival_time_ms: p.eliminated_at.unwrap_or(game_end).saturating_sub(start),
        })
        .collect();

    results.sort_by(|a, b| {
        b.is_alive
            .cmp(&a.is_alive)
            .then(b.score.cmp(&a.score))
            .then(a.id.cmp(&b.id))
    });
    for (index, result) in results.iter_mut().enumerate() {
        result.rank = index as u32 + 1;
    }

    let stats = FinalStats {
        duration_ms: game_end.saturating_sub(start),
        total_players: lobby.player_count(),
    };

    (results, stats)
}
