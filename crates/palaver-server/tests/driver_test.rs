//! End-to-end dispatcher scenarios over in-memory storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use palaver_core::{ClientEvent, MessageRecord, ServerEvent, env::Environment};
use palaver_server::{
    DispatcherConfig, MemoryStorage, ServerAction, ServerDriver, SessionEvent, Storage,
    StorageError,
};

#[derive(Clone)]
struct TestEnv {
    wall_secs: u64,
}

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(42);
    }

    fn wall_clock_secs(&self) -> u64 {
        self.wall_secs
    }
}

fn driver_over(
    storage: MemoryStorage,
) -> ServerDriver<TestEnv, MemoryStorage> {
    // 34200s past midnight = 09:30 UTC
    let env = TestEnv { wall_secs: 34_200 };
    ServerDriver::new(env, storage, DispatcherConfig::default()).expect("driver init failed")
}

fn connect_and_name<S: Storage>(driver: &mut ServerDriver<TestEnv, S>, id: u64, name: &str) {
    driver.process_event(SessionEvent::Connected { session_id: id }).expect("connect failed");
    driver
        .process_event(SessionEvent::EventReceived {
            session_id: id,
            event: ClientEvent::ChooseName { name: name.to_string() },
        })
        .expect("naming failed");
}

fn client<S: Storage>(
    driver: &mut ServerDriver<TestEnv, S>,
    id: u64,
    event: ClientEvent,
) -> Vec<ServerAction> {
    driver
        .process_event(SessionEvent::EventReceived { session_id: id, event })
        .expect("event processing failed")
}

/// Every chat broadcast a room saw, in order.
fn room_chats(actions: &[ServerAction], room: &str) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            ServerAction::BroadcastToRoom {
                room: r,
                event: ServerEvent::ChatMessage { text },
                ..
            } if r == room => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn two_users_chat_in_order() {
    let mut driver = driver_over(MemoryStorage::new());
    connect_and_name(&mut driver, 1, "Alice");
    connect_and_name(&mut driver, 2, "Bob");

    let mut all = Vec::new();
    all.extend(client(&mut driver, 1, ClientEvent::ChatMessage { text: "first".to_string() }));
    all.extend(client(&mut driver, 2, ClientEvent::ChatMessage { text: "second".to_string() }));
    all.extend(client(&mut driver, 1, ClientEvent::ChatMessage { text: "third".to_string() }));

    assert_eq!(room_chats(&all, "Main"), vec![
        "09:30 - Alice: first".to_string(),
        "09:30 - Bob: second".to_string(),
        "09:30 - Alice: third".to_string(),
    ]);
}

#[test]
fn messages_route_only_to_current_room() {
    let mut driver = driver_over(MemoryStorage::new());
    connect_and_name(&mut driver, 1, "Alice");
    connect_and_name(&mut driver, 2, "Bob");

    client(&mut driver, 1, ClientEvent::CreateRoom { room: "Sports".to_string() });
    client(&mut driver, 1, ClientEvent::JoinRoom { room: "Sports".to_string() });

    let actions = client(&mut driver, 1, ClientEvent::ChatMessage { text: "goal!".to_string() });

    assert_eq!(room_chats(&actions, "Sports"), vec!["09:30 - Alice: goal!".to_string()]);
    assert!(room_chats(&actions, "Main").is_empty());
}

#[test]
fn room_switch_updates_presence_on_both_sides() {
    let mut driver = driver_over(MemoryStorage::new());
    connect_and_name(&mut driver, 1, "Alice");
    connect_and_name(&mut driver, 2, "Bob");

    client(&mut driver, 1, ClientEvent::CreateRoom { room: "Sports".to_string() });
    let actions = client(&mut driver, 1, ClientEvent::JoinRoom { room: "Sports".to_string() });

    assert!(actions.contains(&ServerAction::BroadcastToRoom {
        room: "Main".to_string(),
        event: ServerEvent::UserList { names: vec!["Bob".to_string()] },
        exclude_session: None,
    }));
    assert!(actions.contains(&ServerAction::BroadcastToRoom {
        room: "Sports".to_string(),
        event: ServerEvent::UserList { names: vec!["Alice".to_string()] },
        exclude_session: None,
    }));

    let in_main: Vec<_> = driver.sessions_in_room("Main").collect();
    let in_sports: Vec<_> = driver.sessions_in_room("Sports").collect();
    assert_eq!(in_main, vec![2]);
    assert_eq!(in_sports, vec![1]);
}

#[test]
fn history_survives_dispatcher_restart() {
    let storage = MemoryStorage::new();

    {
        let mut driver = driver_over(storage.clone());
        connect_and_name(&mut driver, 1, "Alice");
        client(&mut driver, 1, ClientEvent::CreateRoom { room: "Sports".to_string() });
        client(&mut driver, 1, ClientEvent::JoinRoom { room: "Sports".to_string() });
        client(&mut driver, 1, ClientEvent::ChatMessage { text: "before restart".to_string() });
        driver
            .process_event(SessionEvent::Disconnected {
                session_id: 1,
                reason: "shutdown".to_string(),
            })
            .expect("disconnect failed");
    }

    // New dispatcher over the same storage: rooms and history come back
    let mut driver = driver_over(storage);
    let actions = driver
        .process_event(SessionEvent::Connected { session_id: 2 })
        .expect("connect failed");

    assert!(actions.contains(&ServerAction::SendToSession {
        session_id: 2,
        event: ServerEvent::RoomList { names: vec!["Main".to_string(), "Sports".to_string()] },
    }));

    client(&mut driver, 2, ClientEvent::ChooseName { name: "Bob".to_string() });
    let actions = client(&mut driver, 2, ClientEvent::JoinRoom { room: "Sports".to_string() });

    let history = actions
        .iter()
        .find_map(|a| match a {
            ServerAction::SendToSession {
                event: ServerEvent::ChatHistory { messages, .. },
                ..
            } => Some(messages.clone()),
            _ => None,
        })
        .expect("join should replay history");

    assert_eq!(history.len(), 1);
    assert_eq!(history[0].formatted(), "09:30 - Alice: before restart");
    assert_eq!(history[0].seq, 0);

    // And sequencing resumes without gaps
    let chats = client(&mut driver, 2, ClientEvent::ChatMessage { text: "after".to_string() });
    assert_eq!(room_chats(&chats, "Sports"), vec!["09:30 - Bob: after".to_string()]);
}

#[test]
fn unnamed_session_cannot_join_create_or_chat_into_rooms() {
    let mut driver = driver_over(MemoryStorage::new());
    driver.process_event(SessionEvent::Connected { session_id: 1 }).expect("connect failed");

    let actions = client(&mut driver, 1, ClientEvent::JoinRoom { room: "Main".to_string() });
    assert!(matches!(
        actions[0],
        ServerAction::SendToSession { session_id: 1, event: ServerEvent::Error { .. } }
    ));

    let actions = client(&mut driver, 1, ClientEvent::CreateRoom { room: "Sports".to_string() });
    assert!(matches!(
        actions[0],
        ServerAction::SendToSession { session_id: 1, event: ServerEvent::Error { .. } }
    ));

    let actions = client(&mut driver, 1, ClientEvent::ChatMessage { text: "hi".to_string() });
    assert!(matches!(
        actions[0],
        ServerAction::SendToSession { session_id: 1, event: ServerEvent::Error { .. } }
    ));

    // Nothing was persisted for the rejected chat
    connect_and_name(&mut driver, 2, "Alice");
    let actions = client(&mut driver, 2, ClientEvent::JoinRoom { room: "Main".to_string() });
    assert!(actions.iter().all(|a| !matches!(
        a,
        ServerAction::SendToSession { event: ServerEvent::ChatHistory { messages, .. }, .. }
            if !messages.is_empty()
    )));
}

/// Delegates to [`MemoryStorage`] but fails member writes while armed.
#[derive(Clone)]
struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: Arc<AtomicBool>,
}

impl FlakyStorage {
    fn new() -> Self {
        Self { inner: MemoryStorage::new(), fail_writes: Arc::new(AtomicBool::new(false)) }
    }

    fn fail_member_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected fault".to_string()));
        }
        Ok(())
    }
}

impl Storage for FlakyStorage {
    fn create_room(&self, name: &str, created_at_secs: u64) -> Result<bool, StorageError> {
        self.inner.create_room(name, created_at_secs)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_rooms()
    }

    fn room_members(&self, name: &str) -> Result<Option<Vec<String>>, StorageError> {
        self.inner.room_members(name)
    }

    fn add_member(&self, room: &str, user: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.add_member(room, user)
    }

    fn remove_member(&self, room: &str, user: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.remove_member(room, user)
    }

    fn store_message(
        &self,
        room: &str,
        seq: u64,
        message: &MessageRecord,
    ) -> Result<(), StorageError> {
        self.inner.store_message(room, seq, message)
    }

    fn latest_seq(&self, room: &str) -> Result<Option<u64>, StorageError> {
        self.inner.latest_seq(room)
    }

    fn load_messages(
        &self,
        room: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.inner.load_messages(room, from, limit)
    }
}

#[test]
fn failed_join_leaves_session_consistently_in_old_room() {
    let storage = FlakyStorage::new();
    let env = TestEnv { wall_secs: 34_200 };
    let mut driver = ServerDriver::new(env, storage.clone(), DispatcherConfig::default())
        .expect("driver init failed");

    connect_and_name(&mut driver, 1, "Alice");
    client(&mut driver, 1, ClientEvent::CreateRoom { room: "Sports".to_string() });

    storage.fail_member_writes(true);
    let result = driver.process_event(SessionEvent::EventReceived {
        session_id: 1,
        event: ClientEvent::JoinRoom { room: "Sports".to_string() },
    });
    assert!(result.is_err());
    storage.fail_member_writes(false);

    // The aborted join left nothing half-moved: the live index, the session
    // and the durable member sets all still agree on the old room
    let in_main: Vec<_> = driver.sessions_in_room("Main").collect();
    assert_eq!(in_main, vec![1]);
    assert!(driver.sessions_in_room("Sports").next().is_none());
    assert_eq!(storage.room_members("Main").expect("members failed"), Some(vec![
        "Alice".to_string()
    ]));
    assert_eq!(storage.room_members("Sports").expect("members failed"), Some(Vec::new()));

    // Chat still routes to the room the session never left
    let actions = client(&mut driver, 1, ClientEvent::ChatMessage { text: "still here".to_string() });
    assert_eq!(room_chats(&actions, "Main"), vec!["09:30 - Alice: still here".to_string()]);
    assert!(room_chats(&actions, "Sports").is_empty());
}

#[test]
fn departure_notice_sent_exactly_once() {
    let mut driver = driver_over(MemoryStorage::new());
    connect_and_name(&mut driver, 1, "Alice");
    connect_and_name(&mut driver, 2, "Bob");

    let first = driver
        .process_event(SessionEvent::Disconnected {
            session_id: 1,
            reason: "peer closed".to_string(),
        })
        .expect("disconnect failed");
    let second = driver
        .process_event(SessionEvent::Disconnected {
            session_id: 1,
            reason: "peer closed".to_string(),
        })
        .expect("disconnect failed");

    assert_eq!(room_chats(&first, "Main"), vec!["Alice has left the room.".to_string()]);
    assert!(second.is_empty());

    // Roster no longer lists Alice
    assert!(first.contains(&ServerAction::BroadcastToRoom {
        room: "Main".to_string(),
        event: ServerEvent::UserList { names: vec!["Bob".to_string()] },
        exclude_session: None,
    }));
}
