//! Server network layer: UDP transport, request dispatch, and room broadcast

use crate::combat;
use crate::lobby::{LobbyConfig, LobbyStore, TimerHandle};
use crate::session::SessionRegistry;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    now_ms, EliminationReason, LobbyPhase, Packet, PowerUpKind, Role, ScanType, SessionId,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Messages sent from background tasks to the main event loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    SessionTimeout {
        session_id: SessionId,
    },
    CountdownTick {
        lobby_code: String,
        epoch: u64,
    },
    GameTimerTick {
        lobby_code: String,
        epoch: u64,
    },
    PowerUpExpiry {
        lobby_code: String,
        player_id: SessionId,
        effect_id: u64,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the event loop to the network sender task
#[derive(Debug)]
pub enum GameMessage {
    Send {
        packet: Packet,
        addr: SocketAddr,
    },
    Broadcast {
        packet: Packet,
        addrs: Vec<SocketAddr>,
    },
}

/// What to do after a lobby mutation, decided inside the borrow scope
/// and executed once it ends.
enum FollowUp {
    None,
    CountdownStarted,
    CountdownCanceled,
    StartActiveGame,
    FinishGame,
}

/// Main server: owns the lobby store and serializes every lobby
/// mutation through its event loop.
///
/// The session registry is shared with the timeout checker behind a
/// read-write lock; lobbies are owned exclusively by the loop, so
/// concurrent actions on one lobby cannot race on health, score, or
/// phase. Socket writes happen on the sender task, never inside a
/// handler.
pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<SessionRegistry>>,
    lobbies: LobbyStore,
    session_timeout: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        session_timeout: Duration,
        max_sessions: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            sessions: Arc::new(RwLock::new(SessionRegistry::new(
                max_sessions,
                session_timeout,
            ))),
            lobbies: LobbyStore::new(),
            session_timeout,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    /// Address the server socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the task that continuously listens for incoming datagrams
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::Send { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::Broadcast { packet, addrs } => {
                        for addr in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns the task that sweeps silent sessions
    async fn spawn_timeout_checker(&self) {
        let sessions = Arc::clone(&self.sessions);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut sessions_guard = sessions.write().await;
                    sessions_guard.check_timeouts()
                };

                for session_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::SessionTimeout { session_id }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    async fn send(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::Send { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    async fn send_to_session(&self, session_id: SessionId, packet: Packet) {
        let addr = {
            let sessions = self.sessions.read().await;
            sessions.addr_of(session_id)
        };
        if let Some(addr) = addr {
            self.send(packet, addr).await;
        }
    }

    /// Queues a room broadcast. Recipient addresses are resolved here,
    /// in the event loop, so the sender task never touches lobby state.
    async fn broadcast_ids(
        &self,
        packet: Packet,
        recipients: Vec<SessionId>,
        exclude: Option<SessionId>,
    ) {
        let addrs = {
            let sessions = self.sessions.read().await;
            sessions.addrs_of(recipients.into_iter().filter(|id| Some(*id) != exclude))
        };
        if addrs.is_empty() {
            return;
        }
        if let Err(e) = self.game_tx.send(GameMessage::Broadcast { packet, addrs }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    async fn lobby_code_of(&self, session_id: SessionId) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).and_then(|s| s.lobby_code.clone())
    }

    // ---- request dispatch ----------------------------------------------

    /// Routes one decoded packet. Requests other than `Connect` are
    /// attributed to the session registered for the source address and
    /// refresh its liveness; packets from unknown addresses are dropped.
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Packet::Connect { client_version } = &packet {
            self.handle_connect(addr, *client_version).await;
            return;
        }

        let session_id = {
            let mut sessions = self.sessions.write().await;
            sessions.touch_by_addr(addr)
        };
        let Some(session_id) = session_id else {
            debug!("Dropping packet from unregistered address {}", addr);
            return;
        };

        match packet {
            Packet::CreateLobby {
                capacity,
                duration_minutes,
                player_name,
            } => {
                self.handle_create_lobby(session_id, capacity, duration_minutes, &player_name)
                    .await;
            }
            Packet::JoinLobby {
                lobby_code,
                name,
                role,
            } => {
                self.handle_join_lobby(session_id, &lobby_code, &name, role)
                    .await;
            }
            Packet::LeaveLobby => {
                self.remove_from_lobby(session_id).await;
            }
            Packet::PlayerReady { ready } => {
                self.handle_player_ready(session_id, ready).await;
            }
            Packet::Forfeit => {
                self.handle_forfeit(session_id).await;
            }
            Packet::AssignTagCode { code } => {
                self.handle_assign_tag(session_id, &code).await;
            }
            Packet::Scan {
                target_code,
                scan_type,
            } => {
                self.handle_scan(session_id, &target_code, scan_type).await;
            }
            Packet::GetActiveLobbies => {
                self.handle_get_active_lobbies(session_id).await;
            }
            Packet::Disconnect => {
                self.remove_from_lobby(session_id).await;
                let mut sessions = self.sessions.write().await;
                sessions.remove(session_id);
            }
            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_connect(&mut self, addr: SocketAddr, client_version: u32) {
        info!(
            "Client connecting from {} (version: {})",
            addr, client_version
        );
        if client_version != PROTOCOL_VERSION {
            warn!(
                "Client at {} speaks protocol {} (server: {})",
                addr, client_version, PROTOCOL_VERSION
            );
        }

        // A reconnect from the same address replaces the old session.
        let existing = {
            let sessions = self.sessions.read().await;
            sessions.find_by_addr(addr)
        };
        if let Some(existing_id) = existing {
            info!("Removing existing session {} from {}", existing_id, addr);
            self.remove_from_lobby(existing_id).await;
            let mut sessions = self.sessions.write().await;
            sessions.remove(existing_id);
        }

        let session_id = {
            let mut sessions = self.sessions.write().await;
            sessions.register(addr)
        };

        match session_id {
            Some(session_id) => {
                self.send(Packet::Connected { session_id }, addr).await;
            }
            None => {
                let response = Packet::Disconnected {
                    reason: "Server full".to_string(),
                };
                self.send(response, addr).await;
            }
        }
    }

    async fn handle_create_lobby(
        &mut self,
        session_id: SessionId,
        capacity: u32,
        duration_minutes: u32,
        player_name: &str,
    ) {
        // Creating implies leaving whatever lobby the session is in.
        self.remove_from_lobby(session_id).await;

        let config = LobbyConfig {
            capacity: capacity.clamp(2, 16),
            duration_minutes: duration_minutes.clamp(1, 180),
            ..LobbyConfig::default()
        };

        let (code, snapshot) = {
            let lobby = self.lobbies.create(session_id, player_name, config);
            (lobby.code.clone(), lobby.snapshot())
        };

        {
            let mut sessions = self.sessions.write().await;
            sessions.set_lobby(session_id, code, Role::Player);
        }

        self.send_to_session(session_id, Packet::LobbyCreated { lobby: snapshot })
            .await;
    }

    async fn handle_join_lobby(
        &mut self,
        session_id: SessionId,
        lobby_code: &str,
        name: &str,
        role: Role,
    ) {
        self.remove_from_lobby(session_id).await;

        let code = lobby_code.trim().to_uppercase();
        if self.lobbies.get(&code).is_none() {
            self.send_to_session(
                session_id,
                Packet::JoinRejected {
                    reason: "Lobby not found".to_string(),
                },
            )
            .await;
            return;
        }

        match role {
            Role::Spectator => {
                let (members, snapshot) = {
                    let Some(lobby) = self.lobbies.get_mut(&code) else {
                        return;
                    };
                    lobby.add_spectator(session_id);
                    (lobby.member_ids(), lobby.snapshot())
                };

                {
                    let mut sessions = self.sessions.write().await;
                    sessions.set_lobby(session_id, code.clone(), Role::Spectator);
                }

                info!("Session {} joined lobby {} as spectator", session_id, code);
                self.send_to_session(
                    session_id,
                    Packet::JoinAccepted {
                        role: Role::Spectator,
                        lobby: snapshot,
                    },
                )
                .await;
                let display = if name.trim().is_empty() {
                    "Spectator".to_string()
                } else {
                    name.trim().to_string()
                };
                self.broadcast_ids(
                    Packet::SpectatorJoined { name: display },
                    members,
                    Some(session_id),
                )
                .await;
            }
            Role::Player => {
                let result = {
                    let Some(lobby) = self.lobbies.get_mut(&code) else {
                        return;
                    };
                    lobby
                        .add_player(session_id, name)
                        .map(|()| (lobby.member_ids(), lobby.snapshot()))
                };

                match result {
                    Ok((members, snapshot)) => {
                        {
                            let mut sessions = self.sessions.write().await;
                            sessions.set_lobby(session_id, code.clone(), Role::Player);
                        }

                        info!("Session {} joined lobby {} as player", session_id, code);
                        self.send_to_session(
                            session_id,
                            Packet::JoinAccepted {
                                role: Role::Player,
                                lobby: snapshot.clone(),
                            },
                        )
                        .await;
                        self.broadcast_ids(
                            Packet::PlayerJoined { lobby: snapshot },
                            members,
                            Some(session_id),
                        )
                        .await;
                    }
                    Err(e) => {
                        self.send_to_session(
                            session_id,
                            Packet::JoinRejected {
                                reason: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn handle_player_ready(&mut self, session_id: SessionId, ready: bool) {
        let Some(code) = self.lobby_code_of(session_id).await else {
            return;
        };

        let (members, snapshot, follow_up) = {
            let Some(lobby) = self.lobbies.get_mut(&code) else {
                return;
            };
            // Ready toggles are meaningless once the match is underway.
            if !matches!(lobby.phase, LobbyPhase::Waiting | LobbyPhase::Starting) {
                return;
            }
            if !lobby.set_ready(session_id, ready) {
                return;
            }

            let follow_up = if !ready && lobby.cancel_countdown() {
                FollowUp::CountdownCanceled
            } else if lobby.try_begin_starting() {
                FollowUp::CountdownStarted
            } else {
                FollowUp::None
            };
            (lobby.member_ids(), lobby.snapshot(), follow_up)
        };

        self.broadcast_ids(
            Packet::LobbyUpdated { lobby: snapshot },
            members.clone(),
            None,
        )
        .await;

        match follow_up {
            FollowUp::CountdownCanceled => {
                self.broadcast_ids(Packet::CountdownCanceled, members, None)
                    .await;
            }
            FollowUp::CountdownStarted => {
                self.broadcast_ids(Packet::GameStarting, members, None).await;
                self.spawn_countdown(&code);
            }
            _ => {}
        }
    }

    async fn handle_forfeit(&mut self, session_id: SessionId) {
        let Some(code) = self.lobby_code_of(session_id).await else {
            return;
        };
        let now = now_ms();

        let result = {
            let Some(lobby) = self.lobbies.get_mut(&code) else {
                return;
            };
            combat::forfeit(lobby, session_id, now)
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Forfeit rejected for session {}: {}", session_id, e);
                return;
            }
        };

        let (members, snapshot, is_last, follow_up) = {
            let Some(lobby) = self.lobbies.get(&code) else {
                return;
            };
            let alive = lobby.alive_count();
            let is_last = lobby.phase == LobbyPhase::Active && alive <= 1;
            let follow_up = match lobby.phase {
                LobbyPhase::Active if alive <= 1 => FollowUp::FinishGame,
                LobbyPhase::TagAssignment if alive <= 1 => FollowUp::FinishGame,
                LobbyPhase::TagAssignment if lobby.assignment_complete() => {
                    FollowUp::StartActiveGame
                }
                _ => FollowUp::None,
            };
            (lobby.member_ids(), lobby.snapshot(), is_last, follow_up)
        };

        self.broadcast_ids(
            Packet::PlayerEliminated {
                player_id: session_id,
                player_name: outcome.player_name,
                shooter_id: None,
                reason: EliminationReason::Forfeit,
                is_last_eliminated: is_last,
            },
            members.clone(),
            None,
        )
        .await;

        match follow_up {
            FollowUp::FinishGame => self.finish_game(&code, now).await,
            FollowUp::StartActiveGame => self.start_active_game(&code).await,
            _ => {
                self.broadcast_ids(Packet::LobbyUpdated { lobby: snapshot }, members, None)
                    .await;
            }
        }
    }

    async fn handle_assign_tag(&mut self, session_id: SessionId, code: &str) {
        let Some(lobby_code) = self.lobby_code_of(session_id).await else {
            self.send_to_session(
                session_id,
                Packet::TagAssignAck {
                    success: false,
                    player_name: None,
                    message: Some("You are not in a game".to_string()),
                },
            )
            .await;
            return;
        };

        let result = {
            let Some(lobby) = self.lobbies.get_mut(&lobby_code) else {
                return;
            };
            lobby.claim_tag_code(session_id, code)
        };

        match result {
            Ok((assigned, total)) => {
                let (player_name, recipients, complete) = {
                    let Some(lobby) = self.lobbies.get(&lobby_code) else {
                        return;
                    };
                    let player_name = lobby
                        .player(session_id)
                        .map(|p| p.name.clone())
                        .unwrap_or_default();
                    let recipients = if lobby.config.spectators_see_assignment {
                        lobby.member_ids()
                    } else {
                        lobby.player_ids().collect()
                    };
                    (player_name, recipients, lobby.assignment_complete())
                };

                self.send_to_session(
                    session_id,
                    Packet::TagAssignAck {
                        success: true,
                        player_name: Some(player_name),
                        message: None,
                    },
                )
                .await;
                self.broadcast_ids(
                    Packet::TagAssignmentProgress { assigned, total },
                    recipients,
                    None,
                )
                .await;

                if complete {
                    self.start_active_game(&lobby_code).await;
                }
            }
            Err(e) => {
                self.send_to_session(
                    session_id,
                    Packet::TagAssignAck {
                        success: false,
                        player_name: None,
                        message: Some(e.to_string()),
                    },
                )
                .await;
            }
        }
    }

    async fn handle_scan(&mut self, session_id: SessionId, target_code: &str, scan_type: ScanType) {
        match scan_type {
            ScanType::Combat => self.handle_combat_scan(session_id, target_code).await,
            ScanType::PowerUp => self.handle_power_up_scan(session_id, target_code).await,
        }
    }

    async fn handle_combat_scan(&mut self, session_id: SessionId, target_code: &str) {
        let now = now_ms();
        let Some(code) = self.lobby_code_of(session_id).await else {
            self.send_to_session(
                session_id,
                Packet::ScanAck {
                    success: false,
                    target_name: None,
                    points_earned: 0,
                    new_score: 0,
                    message: Some("You are not in a game".to_string()),
                },
            )
            .await;
            return;
        };

        let result = {
            let Some(lobby) = self.lobbies.get_mut(&code) else {
                return;
            };
            combat::resolve_scan(lobby, session_id, target_code, now)
        };

        match result {
            Ok(outcome) => {
                self.send_to_session(
                    session_id,
                    Packet::ScanAck {
                        success: true,
                        target_name: Some(outcome.target_name.clone()),
                        points_earned: outcome.points_earned,
                        new_score: outcome.scanner_score,
                        message: None,
                    },
                )
                .await;

                let (members, snapshot, alive) = {
                    let Some(lobby) = self.lobbies.get(&code) else {
                        return;
                    };
                    (lobby.member_ids(), lobby.snapshot(), lobby.alive_count())
                };

                if outcome.eliminated {
                    let is_last = alive <= 1;
                    self.broadcast_ids(
                        Packet::PlayerEliminated {
                            player_id: outcome.target_id,
                            player_name: outcome.target_name,
                            shooter_id: Some(session_id),
                            reason: EliminationReason::Scan,
                            is_last_eliminated: is_last,
                        },
                        members.clone(),
                        None,
                    )
                    .await;

                    if is_last {
                        self.finish_game(&code, now).await;
                    } else {
                        self.broadcast_ids(
                            Packet::LobbyUpdated { lobby: snapshot },
                            members,
                            None,
                        )
                        .await;
                    }
                } else {
                    self.broadcast_ids(
                        Packet::PlayerDamaged {
                            player_id: outcome.target_id,
                            health: outcome.target_health,
                            damage: outcome.damage,
                            shooter_id: session_id,
                        },
                        members.clone(),
                        None,
                    )
                    .await;
                    self.broadcast_ids(Packet::LobbyUpdated { lobby: snapshot }, members, None)
                        .await;
                }
            }
            Err(e) => {
                self.send_to_session(
                    session_id,
                    Packet::ScanAck {
                        success: false,
                        target_name: None,
                        points_earned: 0,
                        new_score: 0,
                        message: Some(e.to_string()),
                    },
                )
                .await;
            }
        }
    }

    async fn handle_power_up_scan(&mut self, session_id: SessionId, target_code: &str) {
        let now = now_ms();
        let Some(code) = self.lobby_code_of(session_id).await else {
            self.send_to_session(
                session_id,
                Packet::PowerUpAck {
                    success: false,
                    kind: None,
                    points_needed: 0,
                    message: Some("You are not in a game".to_string()),
                },
            )
            .await;
            return;
        };

        let result = {
            let Some(lobby) = self.lobbies.get_mut(&code) else {
                return;
            };
            combat::claim_power_up(lobby, session_id, target_code, now)
        };

        match result {
            Ok(outcome) => {
                self.send_to_session(
                    session_id,
                    Packet::PowerUpAck {
                        success: true,
                        kind: Some(outcome.kind),
                        points_needed: 0,
                        message: None,
                    },
                )
                .await;

                if let Some(effect) = &outcome.effect {
                    self.spawn_power_up_expiry(
                        &code,
                        session_id,
                        effect.effect_id,
                        effect.expires_at,
                    );
                }

                // Health changes are visible lobby state.
                if outcome.new_health.is_some() {
                    let (members, snapshot) = {
                        let Some(lobby) = self.lobbies.get(&code) else {
                            return;
                        };
                        (lobby.member_ids(), lobby.snapshot())
                    };
                    self.broadcast_ids(Packet::LobbyUpdated { lobby: snapshot }, members, None)
                        .await;
                }
            }
            Err(e) => {
                let points_needed = match &e {
                    combat::PowerUpError::NotEnoughPoints { needed, .. } => *needed,
                    _ => 0,
                };
                self.send_to_session(
                    session_id,
                    Packet::PowerUpAck {
                        success: false,
                        kind: PowerUpKind::from_code(target_code.trim()),
                        points_needed,
                        message: Some(e.to_string()),
                    },
                )
                .await;
            }
        }
    }

    async fn handle_get_active_lobbies(&mut self, session_id: SessionId) {
        let lobbies = self.lobbies.active_summaries(now_ms());
        self.send_to_session(session_id, Packet::ActiveLobbies { lobbies })
            .await;
    }

    // ---- departures ----------------------------------------------------

    /// Removes a session from its lobby (if any) and runs the
    /// post-removal state machine checks.
    async fn remove_from_lobby(&mut self, session_id: SessionId) {
        let code = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(session_id).and_then(|s| {
                s.role = None;
                s.lobby_code.take()
            })
        };
        let Some(code) = code else {
            return;
        };
        self.depart_lobby(&code, session_id).await;
    }

    /// A timed-out session has already been dropped from the registry;
    /// its lobby membership is found by scanning the store.
    async fn handle_session_timeout(&mut self, session_id: SessionId) {
        info!("Session {} timed out", session_id);
        if let Some(code) = self.lobbies.find_code_for(session_id) {
            self.depart_lobby(&code, session_id).await;
        }
    }

    /// Shared departure path: removes the participant, announces it,
    /// and re-evaluates the state machine (countdown break, viability,
    /// completed tag assignment).
    async fn depart_lobby(&mut self, code: &str, session_id: SessionId) {
        let Some(removal) = self.lobbies.remove_participant(code, session_id) else {
            return;
        };
        info!("Session {} left lobby {}", session_id, code);

        if removal.lobby_destroyed {
            let mut sessions = self.sessions.write().await;
            for orphan in &removal.orphaned_spectators {
                sessions.clear_lobby(*orphan);
            }
            return;
        }

        let (members, snapshot, follow_up) = {
            let Some(lobby) = self.lobbies.get_mut(code) else {
                return;
            };
            let follow_up = match lobby.phase {
                LobbyPhase::Starting if !lobby.ready_to_start() => {
                    lobby.cancel_countdown();
                    FollowUp::CountdownCanceled
                }
                LobbyPhase::TagAssignment | LobbyPhase::Active
                    if lobby.below_viable_player_count() || lobby.alive_count() <= 1 =>
                {
                    FollowUp::FinishGame
                }
                LobbyPhase::TagAssignment if lobby.assignment_complete() => {
                    FollowUp::StartActiveGame
                }
                _ => FollowUp::None,
            };
            (lobby.member_ids(), lobby.snapshot(), follow_up)
        };

        let packet = if removal.was_player {
            Packet::PlayerLeft { lobby: snapshot }
        } else {
            Packet::LobbyUpdated { lobby: snapshot }
        };
        self.broadcast_ids(packet, members.clone(), None).await;

        match follow_up {
            FollowUp::CountdownCanceled => {
                self.broadcast_ids(Packet::CountdownCanceled, members, None)
                    .await;
            }
            FollowUp::FinishGame => self.finish_game(code, now_ms()).await,
            FollowUp::StartActiveGame => self.start_active_game(code).await,
            _ => {}
        }
    }

    // ---- timers and transitions ----------------------------------------

    /// Starts the 1 Hz countdown task for a lobby entering `starting`.
    fn spawn_countdown(&mut self, code: &str) {
        let Some(lobby) = self.lobbies.get_mut(code) else {
            return;
        };
        let epoch = lobby.next_timer_epoch();
        let server_tx = self.server_tx.clone();
        let lobby_code = code.to_string();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if server_tx
                    .send(ServerMessage::CountdownTick {
                        lobby_code: lobby_code.clone(),
                        epoch,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        lobby.set_countdown_timer(TimerHandle::new(epoch, task));
    }

    /// Starts the 1 Hz game timer for a lobby entering `active`.
    fn spawn_game_timer(&mut self, code: &str) {
        let Some(lobby) = self.lobbies.get_mut(code) else {
            return;
        };
        let epoch = lobby.next_timer_epoch();
        let server_tx = self.server_tx.clone();
        let lobby_code = code.to_string();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                if server_tx
                    .send(ServerMessage::GameTimerTick {
                        lobby_code: lobby_code.clone(),
                        epoch,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        lobby.set_game_timer(TimerHandle::new(epoch, task));
    }

    /// Schedules the one-shot expiry for a timed power-up effect.
    fn spawn_power_up_expiry(
        &self,
        code: &str,
        player_id: SessionId,
        effect_id: u64,
        expires_at: u64,
    ) {
        let server_tx = self.server_tx.clone();
        let lobby_code = code.to_string();
        let delay = Duration::from_millis(expires_at.saturating_sub(now_ms()));

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = server_tx.send(ServerMessage::PowerUpExpiry {
                lobby_code,
                player_id,
                effect_id,
            });
        });
    }

    /// One countdown tick. Ticks from a cancelled timer carry a stale
    /// epoch and are discarded here, which is what makes cancellation
    /// race-free.
    async fn handle_countdown_tick(&mut self, code: &str, epoch: u64) {
        let (members, n, advanced) = {
            let Some(lobby) = self.lobbies.get_mut(code) else {
                return;
            };
            if lobby.timer_epoch() != epoch {
                debug!("Discarding stale countdown tick for lobby {}", code);
                return;
            }
            let Some(n) = lobby.countdown_tick() else {
                return;
            };
            let advanced = n == 0 && lobby.begin_tag_assignment();
            (lobby.member_ids(), n, advanced)
        };

        self.broadcast_ids(Packet::Countdown { n }, members.clone(), None)
            .await;
        if advanced {
            self.broadcast_ids(Packet::TagAssignmentPhase, members, None)
                .await;
        }
    }

    /// One game-timer tick: broadcast remaining time, or finish on
    /// expiry.
    async fn handle_game_tick(&mut self, code: &str, epoch: u64) {
        let now = now_ms();
        let (members, time_left_ms, players_alive) = {
            let Some(lobby) = self.lobbies.get_mut(code) else {
                return;
            };
            if lobby.timer_epoch() != epoch {
                debug!("Discarding stale game tick for lobby {}", code);
                return;
            }
            if lobby.phase != LobbyPhase::Active {
                return;
            }
            (
                lobby.member_ids(),
                lobby.time_left_ms(now),
                lobby.alive_count(),
            )
        };

        if time_left_ms == 0 {
            self.finish_game(code, now).await;
        } else {
            self.broadcast_ids(
                Packet::GameTimer {
                    time_left_secs: (time_left_ms + 999) / 1000,
                    players_alive,
                },
                members,
                None,
            )
            .await;
        }
    }

    /// A timed power-up ran out. Ignored if the effect was superseded in
    /// the meantime (the installed effect id no longer matches).
    async fn handle_power_up_expiry(&mut self, code: &str, player_id: SessionId, effect_id: u64) {
        let expired_kind = {
            let Some(lobby) = self.lobbies.get_mut(code) else {
                return;
            };
            let Some(player) = lobby.player_mut(player_id) else {
                return;
            };
            match &player.damage_effect {
                Some(effect) if effect.effect_id == effect_id => {
                    let kind = effect.kind;
                    player.damage_effect = None;
                    Some(kind)
                }
                _ => None,
            }
        };

        if let Some(kind) = expired_kind {
            self.send_to_session(player_id, Packet::PowerUpExpired { kind })
                .await;
        }
    }

    /// `tag-assignment -> active`: stamps the match window, announces
    /// it, and starts the game timer.
    async fn start_active_game(&mut self, code: &str) {
        let now = now_ms();
        let (members, packet) = {
            let Some(lobby) = self.lobbies.get_mut(code) else {
                return;
            };
            if !lobby.begin_active(now) {
                return;
            }
            (
                lobby.member_ids(),
                Packet::GameStarted {
                    start_time: now,
                    end_time: lobby.end_time.unwrap_or(now),
                    duration_minutes: lobby.config.duration_minutes,
                },
            )
        };

        self.broadcast_ids(packet, members, None).await;
        self.spawn_game_timer(code);
    }

    /// Terminal transition: cancels timers, computes rankings, and
    /// broadcasts the results exactly once.
    async fn finish_game(&mut self, code: &str, now: u64) {
        let (members, results, final_stats) = {
            let Some(lobby) = self.lobbies.get_mut(code) else {
                return;
            };
            if !lobby.finish() {
                return;
            }
            let (results, final_stats) = combat::compute_results(lobby, now);
            (lobby.member_ids(), results, final_stats)
        };

        let Some(winner) = results.first().cloned() else {
            return;
        };

        self.broadcast_ids(
            Packet::GameEnded {
                results,
                winner,
                final_stats,
            },
            members,
            None,
        )
        .await;
    }

    // ---- main loop -----------------------------------------------------

    /// Main event loop coordinating all operations.
    ///
    /// Every lobby mutation happens here, one message at a time; the
    /// receiver, sender, timeout, and timer tasks only ever communicate
    /// through the channels.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        info!(
            "Server started (session timeout {:?})",
            self.session_timeout
        );

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                ServerMessage::SessionTimeout { session_id } => {
                    self.handle_session_timeout(session_id).await;
                }
                ServerMessage::CountdownTick { lobby_code, epoch } => {
                    self.handle_countdown_tick(&lobby_code, epoch).await;
                }
                ServerMessage::GameTimerTick { lobby_code, epoch } => {
                    self.handle_game_tick(&lobby_code, epoch).await;
                }
                ServerMessage::PowerUpExpiry {
                    lobby_code,
                    player_id,
                    effect_id,
                } => {
                    self.handle_power_up_expiry(&lobby_code, player_id, effect_id)
                        .await;
                }
                ServerMessage::Shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::COUNTDOWN_TICKS;

    async fn test_server() -> Server {
        Server::new("127.0.0.1:0", Duration::from_secs(30), 16)
            .await
            .expect("bind test server")
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Drains every outbound message queued so far.
    fn drain(server: &mut Server) -> Vec<GameMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = server.game_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn connect(server: &mut Server, a: SocketAddr) -> SessionId {
        server
            .handle_packet(
                Packet::Connect {
                    client_version: PROTOCOL_VERSION,
                },
                a,
            )
            .await;
        for msg in drain(server) {
            if let GameMessage::Send {
                packet: Packet::Connected { session_id },
                addr,
            } = msg
            {
                if addr == a {
                    return session_id;
                }
            }
        }
        panic!("No Connected ack for {}", a);
    }

    async fn assign_tag(server: &mut Server, a: SocketAddr, tag: &str) {
        server
            .handle_packet(
                Packet::AssignTagCode {
                    code: tag.to_string(),
                },
                a,
            )
            .await;
    }

    /// Two connected players in one capacity-2, one-minute lobby;
    /// returns the lobby code and both session ids.
    async fn two_player_lobby(server: &mut Server) -> (String, SessionId, SessionId) {
        let a1 = addr(40001);
        let a2 = addr(40002);
        let host = connect(server, a1).await;
        let guest = connect(server, a2).await;

        server
            .handle_packet(
                Packet::CreateLobby {
                    capacity: 2,
                    duration_minutes: 1,
                    player_name: "Ada".to_string(),
                },
                a1,
            )
            .await;
        let code = {
            let sessions = server.sessions.read().await;
            sessions.get(host).unwrap().lobby_code.clone().unwrap()
        };

        server
            .handle_packet(
                Packet::JoinLobby {
                    lobby_code: code.clone(),
                    name: "Bea".to_string(),
                    role: Role::Player,
                },
                a2,
            )
            .await;
        drain(server);

        (code, host, guest)
    }

    async fn ready_both(server: &mut Server) {
        server
            .handle_packet(Packet::PlayerReady { ready: true }, addr(40001))
            .await;
        server
            .handle_packet(Packet::PlayerReady { ready: true }, addr(40002))
            .await;
    }

    /// Runs the countdown to completion by delivering ticks with the
    /// live epoch.
    async fn run_countdown(server: &mut Server, code: &str) {
        let epoch = server.lobbies.get(code).unwrap().timer_epoch();
        for _ in 0..COUNTDOWN_TICKS {
            server.handle_countdown_tick(code, epoch).await;
        }
    }

    /// Drives a two-player lobby all the way into the active phase.
    async fn active_two_player_lobby(server: &mut Server) -> (String, SessionId, SessionId) {
        let (code, host, guest) = two_player_lobby(server).await;
        ready_both(server).await;
        run_countdown(server, &code).await;
        assign_tag(server, addr(40001), "TAG-A").await;
        assign_tag(server, addr(40002), "TAG-B").await;
        drain(server);
        (code, host, guest)
    }

    #[tokio::test]
    async fn test_connect_registers_and_acks() {
        let mut server = test_server().await;
        let id = connect(&mut server, addr(40001)).await;
        assert_eq!(id, 1);

        let sessions = server.sessions.read().await;
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_address_packets_dropped() {
        let mut server = test_server().await;
        server
            .handle_packet(Packet::PlayerReady { ready: true }, addr(40009))
            .await;
        assert!(drain(&mut server).is_empty());
    }

    #[tokio::test]
    async fn test_create_and_join_lobby() {
        let mut server = test_server().await;
        let (code, host, guest) = two_player_lobby(&mut server).await;

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::Waiting);
        assert_eq!(lobby.player_count(), 2);
        assert_eq!(lobby.host, host);
        assert!(lobby.player(guest).is_some());
    }

    #[tokio::test]
    async fn test_join_full_lobby_rejected() {
        let mut server = test_server().await;
        let (code, _, _) = two_player_lobby(&mut server).await;

        let a3 = addr(40003);
        connect(&mut server, a3).await;
        drain(&mut server);
        server
            .handle_packet(
                Packet::JoinLobby {
                    lobby_code: code,
                    name: "Cal".to_string(),
                    role: Role::Player,
                },
                a3,
            )
            .await;

        let rejected = drain(&mut server).into_iter().any(|m| {
            matches!(
                m,
                GameMessage::Send {
                    packet: Packet::JoinRejected { .. },
                    ..
                }
            )
        });
        assert!(rejected);
    }

    #[tokio::test]
    async fn test_join_unknown_lobby_rejected() {
        let mut server = test_server().await;
        let a1 = addr(40001);
        connect(&mut server, a1).await;
        drain(&mut server);

        server
            .handle_packet(
                Packet::JoinLobby {
                    lobby_code: "ZZZZZZ".to_string(),
                    name: "Ada".to_string(),
                    role: Role::Player,
                },
                a1,
            )
            .await;

        let reasons: Vec<String> = drain(&mut server)
            .into_iter()
            .filter_map(|m| match m {
                GameMessage::Send {
                    packet: Packet::JoinRejected { reason },
                    ..
                } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["Lobby not found".to_string()]);
    }

    #[tokio::test]
    async fn test_all_ready_starts_single_countdown() {
        let mut server = test_server().await;
        let (code, _, _) = two_player_lobby(&mut server).await;
        ready_both(&mut server).await;

        {
            let lobby = server.lobbies.get(&code).unwrap();
            assert_eq!(lobby.phase, LobbyPhase::Starting);
            assert!(lobby.has_countdown_timer());
        }

        // A redundant ready toggle must not restart the countdown.
        let epoch = server.lobbies.get(&code).unwrap().timer_epoch();
        server
            .handle_packet(Packet::PlayerReady { ready: true }, addr(40001))
            .await;
        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::Starting);
        assert_eq!(lobby.timer_epoch(), epoch);
    }

    #[tokio::test]
    async fn test_unready_cancels_countdown() {
        let mut server = test_server().await;
        let (code, _, _) = two_player_lobby(&mut server).await;
        ready_both(&mut server).await;
        drain(&mut server);

        server
            .handle_packet(Packet::PlayerReady { ready: false }, addr(40002))
            .await;

        {
            let lobby = server.lobbies.get(&code).unwrap();
            assert_eq!(lobby.phase, LobbyPhase::Waiting);
            assert!(!lobby.has_countdown_timer());
        }

        let canceled = drain(&mut server).into_iter().any(|m| {
            matches!(
                m,
                GameMessage::Broadcast {
                    packet: Packet::CountdownCanceled,
                    ..
                }
            )
        });
        assert!(canceled);
    }

    #[tokio::test]
    async fn test_stale_countdown_tick_never_fires_transition() {
        let mut server = test_server().await;
        let (code, _, _) = two_player_lobby(&mut server).await;
        ready_both(&mut server).await;

        let stale_epoch = server.lobbies.get(&code).unwrap().timer_epoch();
        // Two ticks land, then the countdown is cancelled.
        server.handle_countdown_tick(&code, stale_epoch).await;
        server.handle_countdown_tick(&code, stale_epoch).await;
        server
            .handle_packet(Packet::PlayerReady { ready: false }, addr(40002))
            .await;
        drain(&mut server);

        // Ticks already queued under the old epoch arrive afterwards.
        for _ in 0..COUNTDOWN_TICKS {
            server.handle_countdown_tick(&code, stale_epoch).await;
        }

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::Waiting);
        assert!(drain(&mut server).is_empty());
    }

    #[tokio::test]
    async fn test_countdown_reaches_tag_assignment() {
        let mut server = test_server().await;
        let (code, _, _) = two_player_lobby(&mut server).await;
        ready_both(&mut server).await;
        drain(&mut server);

        run_countdown(&mut server, &code).await;

        let ticks: Vec<u32> = drain(&mut server)
            .into_iter()
            .filter_map(|m| match m {
                GameMessage::Broadcast {
                    packet: Packet::Countdown { n },
                    ..
                } => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![4, 3, 2, 1, 0]);

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::TagAssignment);
        assert!(!lobby.has_countdown_timer());
    }

    #[tokio::test]
    async fn test_full_match_to_game_ended() {
        let mut server = test_server().await;
        let (code, host, guest) = two_player_lobby(&mut server).await;
        ready_both(&mut server).await;
        run_countdown(&mut server, &code).await;

        assign_tag(&mut server, addr(40001), "TAG-A").await;
        assign_tag(&mut server, addr(40002), "TAG-B").await;
        {
            let lobby = server.lobbies.get(&code).unwrap();
            assert_eq!(lobby.phase, LobbyPhase::Active);
            assert!(lobby.has_game_timer());
        }
        drain(&mut server);

        // Ten hits from the host eliminate the guest and end the game.
        for _ in 0..10 {
            server
                .handle_packet(
                    Packet::Scan {
                        target_code: "TAG-B".to_string(),
                        scan_type: ScanType::Combat,
                    },
                    addr(40001),
                )
                .await;
        }

        {
            let lobby = server.lobbies.get(&code).unwrap();
            assert_eq!(lobby.phase, LobbyPhase::Finished);
            assert!(!lobby.has_game_timer());
        }

        let messages = drain(&mut server);
        let eliminated = messages.iter().any(|m| {
            matches!(
                m,
                GameMessage::Broadcast {
                    packet: Packet::PlayerEliminated {
                        player_id,
                        shooter_id: Some(shooter),
                        is_last_eliminated: true,
                        ..
                    },
                    ..
                } if *player_id == guest && *shooter == host
            )
        });
        assert!(eliminated);

        let winner_names: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                GameMessage::Broadcast {
                    packet: Packet::GameEnded { winner, .. },
                    ..
                } => Some(winner.name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(winner_names, vec!["Ada".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_before_game_fails_without_mutation() {
        let mut server = test_server().await;
        let (code, _, _) = two_player_lobby(&mut server).await;
        drain(&mut server);

        server
            .handle_packet(
                Packet::Scan {
                    target_code: "TAG-B".to_string(),
                    scan_type: ScanType::Combat,
                },
                addr(40001),
            )
            .await;

        let failed = drain(&mut server).into_iter().any(|m| {
            matches!(
                m,
                GameMessage::Send {
                    packet: Packet::ScanAck { success: false, .. },
                    ..
                }
            )
        });
        assert!(failed);
        let lobby = server.lobbies.get(&code).unwrap();
        assert!(lobby.players().all(|p| p.health == 100));
    }

    #[tokio::test]
    async fn test_leave_during_countdown_cancels() {
        let mut server = test_server().await;
        let (code, _, guest) = two_player_lobby(&mut server).await;
        ready_both(&mut server).await;
        drain(&mut server);

        server.handle_packet(Packet::LeaveLobby, addr(40002)).await;

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::Waiting);
        assert!(lobby.player(guest).is_none());
        assert!(!lobby.has_countdown_timer());
    }

    #[tokio::test]
    async fn test_disconnect_mid_game_finishes_lobby() {
        let mut server = test_server().await;
        let (code, _, _) = active_two_player_lobby(&mut server).await;

        server.handle_packet(Packet::Disconnect, addr(40002)).await;

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::Finished);
        let ended = drain(&mut server).into_iter().any(|m| {
            matches!(
                m,
                GameMessage::Broadcast {
                    packet: Packet::GameEnded { .. },
                    ..
                }
            )
        });
        assert!(ended);
    }

    #[tokio::test]
    async fn test_session_timeout_runs_departure_flow() {
        let mut server = test_server().await;
        let (code, _, guest) = two_player_lobby(&mut server).await;
        drain(&mut server);

        // The sweeper removes the registry record before the loop hears
        // about it.
        {
            let mut sessions = server.sessions.write().await;
            sessions.remove(guest);
        }
        server.handle_session_timeout(guest).await;

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.player_count(), 1);
        assert!(lobby.player(guest).is_none());

        let left = drain(&mut server).into_iter().any(|m| {
            matches!(
                m,
                GameMessage::Broadcast {
                    packet: Packet::PlayerLeft { .. },
                    ..
                }
            )
        });
        assert!(left);
    }

    #[tokio::test]
    async fn test_last_player_leaving_destroys_lobby() {
        let mut server = test_server().await;
        let a1 = addr(40001);
        connect(&mut server, a1).await;
        server
            .handle_packet(
                Packet::CreateLobby {
                    capacity: 2,
                    duration_minutes: 1,
                    player_name: "Ada".to_string(),
                },
                a1,
            )
            .await;
        assert_eq!(server.lobbies.len(), 1);

        server.handle_packet(Packet::LeaveLobby, a1).await;
        assert!(server.lobbies.is_empty());
    }

    #[tokio::test]
    async fn test_forfeit_eliminates_and_ends_two_player_game() {
        let mut server = test_server().await;
        let (code, _, guest) = active_two_player_lobby(&mut server).await;

        server.handle_packet(Packet::Forfeit, addr(40002)).await;

        let lobby = server.lobbies.get(&code).unwrap();
        assert_eq!(lobby.phase, LobbyPhase::Finished);

        let messages = drain(&mut server);
        let forfeited = messages.iter().any(|m| {
            matches!(
                m,
                GameMessage::Broadcast {
                    packet: Packet::PlayerEliminated {
                        player_id,
                        shooter_id: None,
                        reason: EliminationReason::Forfeit,
                        ..
                    },
                    ..
                } if *player_id == guest
            )
        });
        assert!(forfeited);
    }

    #[tokio::test]
    async fn test_spectator_join_and_discovery() {
        let mut server = test_server().await;
        let (code, _, _) = active_two_player_lobby(&mut server).await;

        let a3 = addr(40003);
        connect(&mut server, a3).await;
        server
            .handle_packet(
                Packet::JoinLobby {
                    lobby_code: code.clone(),
                    name: "Eve".to_string(),
                    role: Role::Spectator,
                },
                a3,
            )
            .await;
        drain(&mut server);

        assert_eq!(server.lobbies.get(&code).unwrap().spectator_count(), 1);

        server.handle_packet(Packet::GetActiveLobbies, a3).await;
        let listings: Vec<Vec<shared::ActiveLobbySummary>> = drain(&mut server)
            .into_iter()
            .filter_map(|m| match m {
                GameMessage::Send {
                    packet: Packet::ActiveLobbies { lobbies },
                    ..
                } => Some(lobbies),
                _ => None,
            })
            .collect();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].len(), 1);
        assert_eq!(listings[0][0].code, code);
        assert_eq!(listings[0][0].players_alive, 2);
        assert_eq!(listings[0][0].spectator_count, 1);
        assert!(listings[0][0].time_left_ms <= 60_000);
    }

    #[tokio::test]
    async fn test_power_up_expiry_respects_supersession() {
        let mut server = test_server().await;
        let (code, host, _) = active_two_player_lobby(&mut server).await;

        server
            .lobbies
            .get_mut(&code)
            .unwrap()
            .player_mut(host)
            .unwrap()
            .score = 1000;

        server
            .handle_packet(
                Packet::Scan {
                    target_code: "POWERUP-DOUBLE".to_string(),
                    scan_type: ScanType::PowerUp,
                },
                addr(40001),
            )
            .await;
        let first_id = server
            .lobbies
            .get(&code)
            .unwrap()
            .player(host)
            .unwrap()
            .damage_effect
            .clone()
            .unwrap()
            .effect_id;

        server
            .handle_packet(
                Packet::Scan {
                    target_code: "POWERUP-DOUBLE".to_string(),
                    scan_type: ScanType::PowerUp,
                },
                addr(40001),
            )
            .await;
        drain(&mut server);

        // The stale expiry must not strip the superseding effect.
        server.handle_power_up_expiry(&code, host, first_id).await;
        assert!(server
            .lobbies
            .get(&code)
            .unwrap()
            .player(host)
            .unwrap()
            .damage_effect
            .is_some());
        assert!(drain(&mut server).is_empty());
    }

    #[tokio::test]
    async fn test_power_up_rejected_below_threshold() {
        let mut server = test_server().await;
        let (code, host, _) = active_two_player_lobby(&mut server).await;
        server
            .lobbies
            .get_mut(&code)
            .unwrap()
            .player_mut(host)
            .unwrap()
            .score = 499;

        server
            .handle_packet(
                Packet::Scan {
                    target_code: "POWERUP-DOUBLE".to_string(),
                    scan_type: ScanType::PowerUp,
                },
                addr(40001),
            )
            .await;

        let acks: Vec<(bool, u32)> = drain(&mut server)
            .into_iter()
            .filter_map(|m| match m {
                GameMessage::Send {
                    packet:
                        Packet::PowerUpAck {
                            success,
                            points_needed,
                            ..
                        },
                    ..
                } => Some((success, points_needed)),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![(false, 1)]);
    }

    #[tokio::test]
    async fn test_game_tick_expiry_finishes() {
        let mut server = test_server().await;
        let (code, _, _) = active_two_player_lobby(&mut server).await;

        // Force the window into the past, then deliver a tick.
        let epoch = {
            let lobby = server.lobbies.get_mut(&code).unwrap();
            lobby.end_time = Some(now_ms().saturating_sub(1));
            lobby.timer_epoch()
        };
        server.handle_game_tick(&code, epoch).await;

        assert_eq!(
            server.lobbies.get(&code).unwrap().phase,
            LobbyPhase::Finished
        );
        let ended = drain(&mut server).into_iter().any(|m| {
            matches!(
                m,
                GameMessage::Broadcast {
                    packet: Packet::GameEnded { .. },
                    ..
                }
            )
        });
        assert!(ended);
    }
}
