//! Lobby store and lifecycle state machine
//!
//! A lobby groups players and spectators under a six-character code and
//! walks them through the match lifecycle:
//!
//! ```text
//! waiting -> starting -> tag-assignment -> active -> finished
//!              |  ^
//!              v  |
//!            (countdown cancel)
//! ```
//!
//! All transition authority lives here. The network layer reports what
//! happened (a ready toggle, a timer tick, a departure) and this module
//! decides whether the phase moves. Timer tasks are owned by the lobby
//! and guarded by an epoch counter so a cancelled timer can never fire a
//! transition after cancellation.

use log::info;
use rand::Rng;
use shared::{
    LobbyPhase, LobbySnapshot, ParticipantInfo, PowerUpKind, SessionId, ActiveLobbySummary,
    LOBBY_CODE_ALPHABET, LOBBY_CODE_LEN, COUNTDOWN_TICKS, MAX_HEALTH,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::task::JoinHandle;

/// A timed combat modifier installed on a participant.
///
/// `effect_id` ties the effect to its expiry task: a superseding claim
/// installs a new id, and the stale task's expiry is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerUpEffect {
    pub kind: PowerUpKind,
    pub multiplier: u32,
    pub expires_at: u64,
    pub effect_id: u64,
}

/// One player or the combat-relevant state of one.
///
/// Owned exclusively by its lobby; spectators are tracked as bare
/// session ids since they carry no combat state.
#[derive(Debug)]
pub struct Participant {
    pub id: SessionId,
    pub name: String,
    pub is_host: bool,
    pub is_ready: bool,
    pub health: u32,
    pub score: u32,
    pub eliminations: u32,
    pub is_alive: bool,
    pub eliminated_at: Option<u64>,
    pub tag_code: Option<String>,
    pub damage_effect: Option<PowerUpEffect>,
    pub power_up_claims: HashMap<PowerUpKind, u32>,
}

impl Participant {
    fn new(id: SessionId, name: String, is_host: bool) -> Self {
        Self {
            id,
            name,
            is_host,
            is_ready: false,
            health: MAX_HEALTH,
            score: 0,
            eliminations: 0,
            is_alive: true,
            eliminated_at: None,
            tag_code: None,
            damage_effect: None,
            power_up_claims: HashMap::new(),
        }
    }

    /// Resets combat state at the start of tag assignment.
    pub fn reset_for_game(&mut self) {
        self.health = MAX_HEALTH;
        self.score = 0;
        self.eliminations = 0;
        self.is_alive = true;
        self.eliminated_at = None;
        self.tag_code = None;
        self.damage_effect = None;
        self.power_up_claims.clear();
    }

    /// Damage multiplier from an unexpired damage power-up, or 1.
    pub fn damage_multiplier(&self, now: u64) -> u32 {
        match &self.damage_effect {
            Some(effect) if effect.expires_at > now => effect.multiplier,
            _ => 1,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id,
            name: self.name.clone(),
            is_host: self.is_host,
            is_ready: self.is_ready,
            health: self.health,
            score: self.score,
            eliminations: self.eliminations,
            is_alive: self.is_alive,
            has_tag_code: self.tag_code.is_some(),
        }
    }
}

/// When the all-ready check is allowed to launch the countdown.
///
/// Defaults to requiring a full lobby; `AtLeast` lets a lobby start
/// short-handed once everyone present is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    FullLobby,
    AtLeast(u32),
}

impl StartPolicy {
    /// Minimum player count required before the countdown may start.
    pub fn required_players(&self, capacity: u32) -> u32 {
        match *self {
            StartPolicy::FullLobby => capacity,
            // A match below two players is never viable.
            StartPolicy::AtLeast(n) => n.max(2).min(capacity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LobbyConfig {
    pub capacity: u32,
    pub duration_minutes: u32,
    pub start_policy: StartPolicy,
    /// Whether spectators receive tag-assignment progress events.
    pub spectators_see_assignment: bool,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            duration_minutes: 15,
            start_policy: StartPolicy::FullLobby,
            spectators_see_assignment: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("Lobby is full")]
    Full,
    #[error("Game already in progress")]
    GameInProgress,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagClaimError {
    #[error("Tag assignment is not in progress")]
    WrongPhase,
    #[error("Player not found in lobby")]
    UnknownPlayer,
    #[error("Eliminated players cannot claim a tag code")]
    Eliminated,
    #[error("Tag code is empty")]
    EmptyCode,
    #[error("Tag code already claimed by another player")]
    CodeTaken,
}

/// Handle to a live countdown or game-timer task.
#[derive(Debug)]
pub struct TimerHandle {
    pub epoch: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn new(epoch: u64, task: JoinHandle<()>) -> Self {
        Self { epoch, task }
    }

    fn cancel(self) {
        self.task.abort();
    }
}

/// Outcome of removing a participant from a lobby.
#[derive(Debug)]
pub struct ParticipantRemoval {
    pub was_player: bool,
    pub name: Option<String>,
    pub new_host: Option<SessionId>,
}

/// A game session: players, spectators, configuration, phase, timers.
#[derive(Debug)]
pub struct Lobby {
    pub code: String,
    pub host: SessionId,
    players: HashMap<SessionId, Participant>,
    spectators: HashSet<SessionId>,
    pub config: LobbyConfig,
    pub phase: LobbyPhase,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    /// Bumped on every timer cancellation; in-flight ticks carrying an
    /// older epoch are discarded by the event loop.
    timer_epoch: u64,
    countdown_timer: Option<TimerHandle>,
    game_timer: Option<TimerHandle>,
    countdown_remaining: u32,
    next_effect_id: u64,
}

impl Lobby {
    pub fn new(code: String, host: SessionId, host_name: String, config: LobbyConfig) -> Self {
        let host_name = if host_name.trim().is_empty() {
            "Host".to_string()
        } else {
            host_name.trim().to_string()
        };
        let mut players = HashMap::new();
        players.insert(host, Participant::new(host, host_name, true));
        Self {
            code,
            host,
            players,
            spectators: HashSet::new(),
            config,
            phase: LobbyPhase::Waiting,
            start_time: None,
            end_time: None,
            timer_epoch: 0,
            countdown_timer: None,
            game_timer: None,
            countdown_remaining: 0,
            next_effect_id: 0,
        }
    }

    // ---- membership ----------------------------------------------------

    /// Adds a player, de-duplicating the display name by suffixing.
    ///
    /// Joins are only accepted while the lobby is waiting and below
    /// capacity.
    pub fn add_player(&mut self, id: SessionId, requested_name: &str) -> Result<(), JoinError> {
        if self.phase != LobbyPhase::Waiting {
            return Err(JoinError::GameInProgress);
        }
        if self.players.len() as u32 >= self.config.capacity {
            return Err(JoinError::Full);
        }

        let name = self.unique_name(requested_name);
        self.players.insert(id, Participant::new(id, name, false));
        Ok(())
    }

    pub fn add_spectator(&mut self, id: SessionId) {
        self.spectators.insert(id);
    }

    /// Removes a participant (player or spectator), reassigning the host
    /// if the departing player held it. The lobby may be left empty;
    /// destruction is the store's call.
    pub fn remove_participant(&mut self, id: SessionId) -> Option<ParticipantRemoval> {
        if self.spectators.remove(&id) {
            return Some(ParticipantRemoval {
                was_player: false,
                name: None,
                new_host: None,
            });
        }

        let removed = self.players.remove(&id)?;
        let mut new_host = None;

        if self.host == id {
            if let Some(next) = self.players.keys().min().copied() {
                self.host = next;
                if let Some(player) = self.players.get_mut(&next) {
                    player.is_host = true;
                }
                new_host = Some(next);
            }
        }

        Some(ParticipantRemoval {
            was_player: true,
            name: Some(removed.name),
            new_host,
        })
    }

    fn unique_name(&self, requested: &str) -> String {
        let base = if requested.trim().is_empty() {
            format!("Player{}", self.players.len() + 1)
        } else {
            requested.trim().to_string()
        };

        let taken = |candidate: &str| {
            self.players
                .values()
                .any(|p| p.name.eq_ignore_ascii_case(candidate))
        };

        if !taken(&base) {
            return base;
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{}-{}", base, suffix);
            if !taken(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }

    pub fn player(&self, id: SessionId) -> Option<&Participant> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: SessionId) -> Option<&mut Participant> {
        self.players.get_mut(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Participant> {
        self.players.values()
    }

    pub fn player_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.players.keys().copied()
    }

    pub fn spectator_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.spectators.iter().copied()
    }

    /// Every session joined to this lobby's room, players and spectators.
    pub fn member_ids(&self) -> Vec<SessionId> {
        self.players
            .keys()
            .chain(self.spectators.iter())
            .copied()
            .collect()
    }

    pub fn player_count(&self) -> u32 {
        self.players.len() as u32
    }

    pub fn alive_count(&self) -> u32 {
        self.players.values().filter(|p| p.is_alive).count() as u32
    }

    pub fn spectator_count(&self) -> u32 {
        self.spectators.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Finds the participant holding a claimed tag code, dead or alive.
    pub fn find_by_tag_code(&self, code: &str) -> Option<SessionId> {
        self.players
            .values()
            .find(|p| p.tag_code.as_deref() == Some(code))
            .map(|p| p.id)
    }

    // ---- ready check and countdown -------------------------------------

    pub fn set_ready(&mut self, id: SessionId, ready: bool) -> bool {
        match self.players.get_mut(&id) {
            Some(player) => {
                player.is_ready = ready;
                true
            }
            None => false,
        }
    }

    /// All current players ready and the start policy satisfied.
    pub fn ready_to_start(&self) -> bool {
        let required = self.config.start_policy.required_players(self.config.capacity);
        !self.players.is_empty()
            && self.player_count() >= required
            && self.players.values().all(|p| p.is_ready)
    }

    /// `waiting -> starting`. Idempotent: a lobby already counting down
    /// is left untouched and `false` is returned, so re-evaluating the
    /// ready condition can never start a second timer.
    pub fn try_begin_starting(&mut self) -> bool {
        if self.phase != LobbyPhase::Waiting || !self.ready_to_start() {
            return false;
        }
        self.phase = LobbyPhase::Starting;
        self.countdown_remaining = COUNTDOWN_TICKS;
        info!("Lobby {} starting countdown", self.code);
        true
    }

    /// `starting -> waiting`. Cancels the countdown timer and bumps the
    /// epoch so an already-queued tick is discarded.
    pub fn cancel_countdown(&mut self) -> bool {
        if self.phase != LobbyPhase::Starting {
            return false;
        }
        self.timer_epoch += 1;
        if let Some(timer) = self.countdown_timer.take() {
            timer.cancel();
        }
        self.phase = LobbyPhase::Waiting;
        self.countdown_remaining = 0;
        info!("Lobby {} countdown canceled", self.code);
        true
    }

    /// Advances the countdown by one tick, returning the value to
    /// broadcast (4, 3, 2, 1, 0). Returns `None` outside `starting`.
    pub fn countdown_tick(&mut self) -> Option<u32> {
        if self.phase != LobbyPhase::Starting || self.countdown_remaining == 0 {
            return None;
        }
        self.countdown_remaining -= 1;
        Some(self.countdown_remaining)
    }

    // ---- tag assignment ------------------------------------------------

    /// `starting -> tag-assignment`. Resets every player's combat state.
    pub fn begin_tag_assignment(&mut self) -> bool {
        if self.phase != LobbyPhase::Starting {
            return false;
        }
        self.timer_epoch += 1;
        if let Some(timer) = self.countdown_timer.take() {
            timer.cancel();
        }
        for player in self.players.values_mut() {
            player.reset_for_game();
        }
        self.phase = LobbyPhase::TagAssignment;
        info!("Lobby {} entering tag assignment", self.code);
        true
    }

    /// Claims a tag code for a player. Re-claiming replaces the player's
    /// own code; a code held by anyone else is rejected.
    ///
    /// Returns the updated `(assigned, total)` progress.
    pub fn claim_tag_code(
        &mut self,
        id: SessionId,
        code: &str,
    ) -> Result<(u32, u32), TagClaimError> {
        if self.phase != LobbyPhase::TagAssignment {
            return Err(TagClaimError::WrongPhase);
        }
        let code = code.trim();
        if code.is_empty() {
            return Err(TagClaimError::EmptyCode);
        }
        if let Some(holder) = self.find_by_tag_code(code) {
            if holder != id {
                return Err(TagClaimError::CodeTaken);
            }
        }

        let player = self.players.get_mut(&id).ok_or(TagClaimError::UnknownPlayer)?;
        if !player.is_alive {
            return Err(TagClaimError::Eliminated);
        }
        player.tag_code = Some(code.to_string());

        Ok(self.assignment_progress())
    }

    /// Tag-claim progress over living players.
    pub fn assignment_progress(&self) -> (u32, u32) {
        let assigned = self
            .players
            .values()
            .filter(|p| p.is_alive && p.tag_code.is_some())
            .count() as u32;
        (assigned, self.alive_count())
    }

    pub fn assignment_complete(&self) -> bool {
        let (assigned, total) = self.assignment_progress();
        total > 0 && assigned == total
    }

    // ---- active game ---------------------------------------------------

    /// `tag-assignment -> active`. Stamps the match window.
    pub fn begin_active(&mut self, now: u64) -> bool {
        if self.phase != LobbyPhase::TagAssignment {
            return false;
        }
        self.phase = LobbyPhase::Active;
        self.start_time = Some(now);
        self.end_time = Some(now + u64::from(self.config.duration_minutes) * 60_000);
        info!("Lobby {} game started", self.code);
        true
    }

    /// Remaining match time computed from the stored end time.
    pub fn time_left_ms(&self, now: u64) -> u64 {
        self.end_time.map_or(0, |end| end.saturating_sub(now))
    }

    /// Any phase `-> finished`. Cancels both timers. Terminal.
    pub fn finish(&mut self) -> bool {
        if self.phase == LobbyPhase::Finished {
            return false;
        }
        self.cancel_timers();
        self.phase = LobbyPhase::Finished;
        info!("Lobby {} finished", self.code);
        true
    }

    /// A lobby mid-match that can no longer produce a result.
    pub fn below_viable_player_count(&self) -> bool {
        matches!(self.phase, LobbyPhase::TagAssignment | LobbyPhase::Active)
            && self.player_count() < 2
    }

    // ---- timers --------------------------------------------------------

    pub fn timer_epoch(&self) -> u64 {
        self.timer_epoch
    }

    /// Starts a new timer generation. Any prior handles must have been
    /// cancelled by the transition that got us here.
    pub fn next_timer_epoch(&mut self) -> u64 {
        self.timer_epoch += 1;
        self.timer_epoch
    }

    pub fn set_countdown_timer(&mut self, handle: TimerHandle) {
        debug_assert!(self.countdown_timer.is_none());
        self.countdown_timer = Some(handle);
    }

    pub fn set_game_timer(&mut self, handle: TimerHandle) {
        debug_assert!(self.game_timer.is_none());
        self.game_timer = Some(handle);
    }

    pub fn has_countdown_timer(&self) -> bool {
        self.countdown_timer.is_some()
    }

    pub fn has_game_timer(&self) -> bool {
        self.game_timer.is_some()
    }

    /// Cancels whatever timers are live and invalidates queued ticks.
    pub fn cancel_timers(&mut self) {
        self.timer_epoch += 1;
        if let Some(timer) = self.countdown_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.game_timer.take() {
            timer.cancel();
        }
    }

    /// Allocates an id for a timed power-up effect.
    pub fn next_effect_id(&mut self) -> u64 {
        self.next_effect_id += 1;
        self.next_effect_id
    }

    // ---- snapshots -----------------------------------------------------

    pub fn snapshot(&self) -> LobbySnapshot {
        let mut players: Vec<ParticipantInfo> =
            self.players.values().map(Participant::info).collect();
        players.sort_by_key(|p| p.id);

        LobbySnapshot {
            code: self.code.clone(),
            phase: self.phase,
            host: self.host,
            capacity: self.config.capacity,
            duration_minutes: self.config.duration_minutes,
            players,
            spectator_count: self.spectator_count(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Outcome of removing a participant through the store.
#[derive(Debug)]
pub struct StoreRemoval {
    pub lobby_code: String,
    pub was_player: bool,
    pub name: Option<String>,
    pub new_host: Option<SessionId>,
    pub lobby_destroyed: bool,
    /// Spectators left behind by a destroyed lobby; the gateway clears
    /// their membership.
    pub orphaned_spectators: Vec<SessionId>,
}

/// All live lobbies, keyed by code.
///
/// Created once at process start and owned by the event loop; there are
/// no ambient singletons.
#[derive(Default)]
pub struct LobbyStore {
    lobbies: HashMap<String, Lobby>,
}

impl LobbyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lobby with a fresh collision-checked code and the
    /// creator installed as host.
    pub fn create(
        &mut self,
        host: SessionId,
        host_name: &str,
        config: LobbyConfig,
    ) -> &mut Lobby {
        let code = self.generate_code();
        info!("Lobby {} created by session {}", code, host);
        let lobby = Lobby::new(code.clone(), host, host_name.to_string(), config);
        self.lobbies.entry(code).or_insert(lobby)
    }

    fn generate_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: String = (0..LOBBY_CODE_LEN)
                .map(|_| LOBBY_CODE_ALPHABET[rng.gen_range(0..LOBBY_CODE_ALPHABET.len())] as char)
                .collect();
            if !self.lobbies.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn get(&self, code: &str) -> Option<&Lobby> {
        self.lobbies.get(code)
    }

    pub fn get_mut(&mut self, code: &str) -> Option<&mut Lobby> {
        self.lobbies.get_mut(code)
    }

    /// Removes a lobby outright, cancelling its timers.
    pub fn remove(&mut self, code: &str) -> Option<Lobby> {
        let mut lobby = self.lobbies.remove(code)?;
        lobby.cancel_timers();
        info!("Lobby {} destroyed", code);
        Some(lobby)
    }

    /// Removes a participant from its lobby, handling host reassignment
    /// and destroying the lobby once no players remain.
    pub fn remove_participant(&mut self, code: &str, id: SessionId) -> Option<StoreRemoval> {
        let lobby = self.lobbies.get_mut(code)?;
        let removal = lobby.remove_participant(id)?;

        let mut destroyed = false;
        let mut orphaned = Vec::new();
        if lobby.is_empty() {
            orphaned = lobby.spectator_ids().collect();
            destroyed = true;
            self.remove(code);
        }

        Some(StoreRemoval {
            lobby_code: code.to_string(),
            was_player: removal.was_player,
            name: removal.name,
            new_host: removal.new_host,
            lobby_destroyed: destroyed,
            orphaned_spectators: orphaned,
        })
    }

    /// Finds the lobby a session belongs to, as player or spectator.
    /// Used when the session record is already gone (timeout sweep).
    pub fn find_code_for(&self, id: SessionId) -> Option<String> {
        self.lobbies
            .values()
            .find(|l| l.player(id).is_some() || l.spectator_ids().any(|s| s == id))
            .map(|l| l.code.clone())
    }

    /// Lobby-discovery listing: every active lobby with remaining time
    /// computed from its stored end time.
    pub fn active_summaries(&self, now: u64) -> Vec<ActiveLobbySummary> {
        let mut summaries: Vec<ActiveLobbySummary> = self
            .lobbies
            .values()
            .filter(|l| l.phase == LobbyPhase::Active && !l.is_empty())
            .map(|l| ActiveLobbySummary {
                code: l.code.clone(),
                players_alive: l.alive_count(),
                max_players: l.config.capacity,
                time_left_ms: l.time_left_ms(now),
                spectator_count: l.spectator_count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.code.cmp(&b.code));
        summaries
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }
}
