//! Server dispatcher.
//!
//! Ties together session state machines, the room registry (durable rooms
//! and membership), the message store (ordered durable logs), the live
//! connection registry, and presence. Pure event-in, actions-out: the
//! runtime feeds [`SessionEvent`]s and executes the returned
//! [`ServerAction`]s, so the whole coordination core runs single-threaded
//! and deterministic under test.
//!
//! Ordering: all events are processed one at a time, so two chat messages
//! accepted for the same room are sequenced and broadcast in that order. A
//! message is only broadcast after its append to the log succeeded.

use std::collections::HashMap;

use palaver_core::{
    ClientEvent, ServerEvent, Session, SessionConfig, SessionError,
    env::Environment,
};

use crate::{
    message_store::MessageStore,
    presence::PresencePublisher,
    registry::ConnectionRegistry,
    rooms::{DEFAULT_ROOM, RoomError, RoomRegistry},
    server_error::ServerError,
    storage::{Storage, StorageError},
};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-session configuration (naming deadline)
    pub session: SessionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { session: SessionConfig::default(), max_connections: 10_000 }
    }
}

/// Events the dispatcher processes.
///
/// Produced by the runtime (production transport or tests).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new connection was accepted
    Connected {
        /// Unique session ID assigned by the runtime
        session_id: u64,
    },

    /// A decoded event arrived from a client
    EventReceived {
        /// Session that sent the event
        session_id: u64,
        /// The received event
        event: ClientEvent,
    },

    /// A connection was closed (by peer or error)
    Disconnected {
        /// Session that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for deadline checking
    Tick,
}

/// Actions the dispatcher produces.
///
/// Executed by runtime-specific code.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerAction {
    /// Send an event to a specific session
    SendToSession {
        /// Target session ID
        session_id: u64,
        /// Event to send
        event: ServerEvent,
    },

    /// Broadcast an event to all live sessions in a room
    BroadcastToRoom {
        /// Target room name
        room: String,
        /// Event to broadcast
        event: ServerEvent,
        /// Optional session to exclude (typically the originator)
        exclude_session: Option<u64>,
    },

    /// Broadcast an event to every live session
    BroadcastAll {
        /// Event to broadcast
        event: ServerEvent,
    },

    /// Close a connection
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },
}

/// Action-based server dispatcher.
pub struct ServerDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Session state machines (session_id → Session)
    sessions: HashMap<u64, Session<E::Instant>>,
    /// Live room occupancy and display-name index
    registry: ConnectionRegistry,
    /// Durable rooms and membership
    rooms: RoomRegistry<S>,
    /// Ordered durable message logs
    messages: MessageStore<S>,
    /// Presence event builder
    presence: PresencePublisher,
    /// Environment (time, RNG)
    env: E,
    /// Configuration
    config: DispatcherConfig,
}

impl<E, S> ServerDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    /// Create a dispatcher, ensuring the default room exists.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from default-room creation.
    pub fn new(env: E, storage: S, config: DispatcherConfig) -> Result<Self, ServerError> {
        let rooms = RoomRegistry::new(storage.clone());
        rooms.ensure_default(env.wall_clock_secs())?;

        Ok(Self {
            sessions: HashMap::new(),
            registry: ConnectionRegistry::new(),
            rooms,
            messages: MessageStore::new(storage),
            presence: PresencePublisher::new(),
            env,
            config,
        })
    }

    /// Process one event and return the actions to execute.
    ///
    /// This is the dispatcher's single entry point.
    pub fn process_event(&mut self, event: SessionEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            SessionEvent::Connected { session_id } => self.handle_connected(session_id),
            SessionEvent::EventReceived { session_id, event } => {
                self.handle_client_event(session_id, event)
            },
            SessionEvent::Disconnected { session_id, reason } => {
                self.handle_disconnected(session_id, &reason)
            },
            SessionEvent::Tick => self.handle_tick(),
        }
    }

    /// Handle a new connection.
    ///
    /// The client immediately receives the room catalog and the name
    /// prompt.
    fn handle_connected(&mut self, session_id: u64) -> Result<Vec<ServerAction>, ServerError> {
        if self.sessions.len() >= self.config.max_connections {
            return Ok(vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }]);
        }

        let now = self.env.now();
        self.sessions.insert(session_id, Session::new(session_id, now, self.config.session.clone()));

        tracing::debug!(session_id, "connection accepted");

        Ok(vec![
            ServerAction::SendToSession {
                session_id,
                event: self.presence.room_list(self.rooms.room_names()?),
            },
            ServerAction::SendToSession { session_id, event: ServerEvent::ChooseName },
        ])
    }

    /// Handle a decoded client event.
    fn handle_client_event(
        &mut self,
        session_id: u64,
        event: ClientEvent,
    ) -> Result<Vec<ServerAction>, ServerError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(ServerError::SessionNotFound(session_id));
        }

        match event {
            ClientEvent::ChooseName { name } => self.handle_choose_name(session_id, &name),
            ClientEvent::JoinRoom { room } => self.place_in_room(session_id, &room),
            ClientEvent::CreateRoom { room } => self.handle_create_room(session_id, &room),
            ClientEvent::ChatMessage { text } => self.handle_chat_message(session_id, &text),
        }
    }

    /// Validate and claim a display name, then place the session in the
    /// default room.
    ///
    /// Rejections re-prompt the client; the session stays `New` and may try
    /// again until its naming deadline.
    fn handle_choose_name(
        &mut self,
        session_id: u64,
        name: &str,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let trimmed = name.trim();

        // Uniqueness among live sessions, checked before the state
        // transition so a rejected name leaves the session untouched
        if !trimmed.is_empty() && self.registry.name_taken(trimmed) {
            return Ok(vec![
                self.error_to(session_id, &format!("name already in use: {trimmed}")),
                ServerAction::SendToSession { session_id, event: ServerEvent::ChooseName },
            ]);
        }

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ServerError::SessionNotFound(session_id))?;

        let canonical = match session.assign_name(name) {
            Ok(canonical) => canonical,
            Err(e @ SessionError::InvalidName { .. }) => {
                return Ok(vec![self.error_to(session_id, &e.to_string()), ServerAction::SendToSession {
                    session_id,
                    event: ServerEvent::ChooseName,
                }]);
            },
            Err(e) => return Ok(vec![self.error_to(session_id, &e.to_string())]),
        };

        self.registry.claim_name(&canonical, session_id);
        tracing::info!(session_id, name = %canonical, "display name assigned");

        // Every named session lands in the default room
        self.place_in_room(session_id, DEFAULT_ROOM)
    }

    /// Move a session into a room, updating durable membership and live
    /// occupancy, and notifying both rooms.
    fn place_in_room(
        &mut self,
        session_id: u64,
        room: &str,
    ) -> Result<Vec<ServerAction>, ServerError> {
        if !self.rooms.exists(room)? {
            return Ok(vec![self.error_to(session_id, &format!("room not found: {room}"))]);
        }

        let (name, prev) = {
            let session = self
                .sessions
                .get(&session_id)
                .ok_or(ServerError::SessionNotFound(session_id))?;

            let Some(name) = session.name().map(str::to_string) else {
                return Ok(vec![self.error_to(session_id, "choose a name first")]);
            };

            // Re-joining the current room changes nothing
            if session.room() == Some(room) {
                return Ok(vec![ServerAction::SendToSession {
                    session_id,
                    event: ServerEvent::CurrentRoom { name: room.to_string() },
                }]);
            }

            (name, session.room().map(str::to_string))
        };

        // Durable membership first: a storage failure aborts the join with
        // the session, the live index, and the store still agreeing on the
        // old room
        self.rooms.add_member(room, &name)?;
        if let Some(prev) = &prev {
            if let Err(e) = self.rooms.remove_member(prev, &name) {
                if let Err(undo) = self.rooms.remove_member(room, &name) {
                    tracing::error!(room = %room, error = %undo, "membership rollback failed");
                }
                return Err(e.into());
            }
        }

        // Cannot fail past this point: the name guard above means the
        // session is Named or InRoom
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ServerError::SessionNotFound(session_id))?;
        let vacated = session.enter_room(room)?;
        self.registry.enter(session_id, room);

        tracing::info!(session_id, name = %name, room = %room, "joined room");

        let mut actions = vec![
            ServerAction::SendToSession {
                session_id,
                event: ServerEvent::CurrentRoom { name: room.to_string() },
            },
            ServerAction::SendToSession {
                session_id,
                event: ServerEvent::ChatHistory {
                    room: room.to_string(),
                    messages: self.messages.recent(room)?,
                },
            },
            ServerAction::BroadcastToRoom {
                room: room.to_string(),
                event: self.presence.user_list(self.rooms.members(room)?),
                exclude_session: None,
            },
            ServerAction::BroadcastToRoom {
                room: room.to_string(),
                event: self.presence.join_notice(&name),
                exclude_session: None,
            },
        ];

        if let Some(prev) = vacated {
            actions.push(ServerAction::BroadcastToRoom {
                room: prev.clone(),
                event: self.presence.user_list(self.rooms.members(&prev)?),
                exclude_session: None,
            });
            actions.push(ServerAction::BroadcastToRoom {
                room: prev,
                event: self.presence.leave_notice(&name),
                exclude_session: None,
            });
        }

        Ok(actions)
    }

    /// Create a room and announce the refreshed catalog to everyone.
    ///
    /// The creator does not move; joining is a separate request.
    fn handle_create_room(
        &mut self,
        session_id: u64,
        room: &str,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let named = self
            .sessions
            .get(&session_id)
            .ok_or(ServerError::SessionNotFound(session_id))?
            .name()
            .is_some();
        if !named {
            return Ok(vec![self.error_to(session_id, "choose a name first")]);
        }

        match self.rooms.create(room, self.env.wall_clock_secs()) {
            Ok((name, true)) => {
                tracing::info!(session_id, room = %name, "room created");
                Ok(vec![ServerAction::BroadcastAll {
                    event: self.presence.room_list(self.rooms.room_names()?),
                }])
            },
            Ok((name, false)) => {
                // Create is idempotent: an existing room is a quiet no-op
                tracing::debug!(session_id, room = %name, "room already exists");
                Ok(Vec::new())
            },
            Err(e @ RoomError::InvalidName { .. }) => {
                Ok(vec![self.error_to(session_id, &e.to_string())])
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a chat message and broadcast it to its room.
    ///
    /// The broadcast only happens after the append is durable. A sequence
    /// conflict (counter drift after a crash or concurrent writer) is
    /// retried once; the store reseeds itself from the log in between.
    fn handle_chat_message(
        &mut self,
        session_id: u64,
        text: &str,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let (room, author) = {
            let session = self
                .sessions
                .get(&session_id)
                .ok_or(ServerError::SessionNotFound(session_id))?;

            let room = match session.chat_room() {
                Ok(room) => room.to_string(),
                Err(e) => return Ok(vec![self.error_to(session_id, &e.to_string())]),
            };
            let Some(author) = session.name().map(str::to_string) else {
                return Ok(vec![self.error_to(session_id, "choose a name first")]);
            };
            (room, author)
        };

        let time = format_clock(self.env.wall_clock_secs());

        let mut result = self.messages.append(&room, &author, text, &time);
        if matches!(result, Err(StorageError::Conflict { .. })) {
            result = self.messages.append(&room, &author, text, &time);
        }

        match result {
            Ok(record) => Ok(vec![ServerAction::BroadcastToRoom {
                room,
                event: ServerEvent::ChatMessage { text: record.formatted() },
                exclude_session: None,
            }]),
            Err(e) => {
                tracing::error!(session_id, room = %room, error = %e, "message append failed");
                Ok(vec![self.error_to(session_id, "message could not be delivered")])
            },
        }
    }

    /// Handle a connection being closed.
    ///
    /// Idempotent: duplicate close signals for the same session produce no
    /// second departure notice.
    fn handle_disconnected(
        &mut self,
        session_id: u64,
        reason: &str,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return Ok(Vec::new());
        };

        let name = session.name().map(str::to_string);
        let vacated = session.disconnect();

        self.registry.leave(session_id);
        if let Some(name) = &name {
            self.registry.release_name(name);
        }

        tracing::info!(session_id, reason, "connection closed");

        let mut actions = Vec::new();
        if let (Some(room), Some(name)) = (vacated, name) {
            self.rooms.remove_member(&room, &name)?;
            actions.push(ServerAction::BroadcastToRoom {
                room: room.clone(),
                event: self.presence.user_list(self.rooms.members(&room)?),
                exclude_session: None,
            });
            actions.push(ServerAction::BroadcastToRoom {
                room,
                event: self.presence.leave_notice(&name),
                exclude_session: None,
            });
        }

        Ok(actions)
    }

    /// Periodic deadline check.
    ///
    /// Sessions that never chose a name past their deadline are closed;
    /// the runtime follows up with a `Disconnected` event.
    fn handle_tick(&mut self) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();

        let overdue: Vec<u64> = self
            .sessions
            .iter()
            .filter_map(|(id, session)| session.check_name_timeout(now).map(|_| *id))
            .collect();

        let mut actions = Vec::new();
        for session_id in overdue {
            tracing::debug!(session_id, "naming deadline exceeded");
            actions.push(ServerAction::CloseConnection {
                session_id,
                reason: "no display name chosen in time".to_string(),
            });
        }

        Ok(actions)
    }

    fn error_to(&self, session_id: u64, message: &str) -> ServerAction {
        ServerAction::SendToSession {
            session_id,
            event: ServerEvent::Error { message: message.to_string() },
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session is known to the dispatcher.
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Live session IDs currently in a room.
    pub fn sessions_in_room(&self, room: &str) -> impl Iterator<Item = u64> + '_ {
        self.registry.sessions_in_room(room)
    }
}

impl<E, S> std::fmt::Debug for ServerDriver<E, S>
where
    E: Environment,
    S: Storage,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver").field("session_count", &self.sessions.len()).finish()
    }
}

/// Render a unix timestamp as wall-clock `HH:MM` (UTC).
fn format_clock(secs: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_else(|| "00:00".to_string())
}
