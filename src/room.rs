//! Room and room registry
//!
//! A room is a named broadcast group holding non-owning back-references to
//! its member sessions. The registry guarantees at most one room instance
//! per normalized name, however many callers race to create it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::session::ClientSession;
use crate::types::ClientId;

/// Named broadcast group
///
/// Members are weak references: the server owns sessions, and a session
/// outlives its room membership. The room lock covers membership mutation
/// and the broadcast iteration only; delivery is a fire-and-forget enqueue
/// into each recipient's own mailbox.
pub struct Room {
    name: String,
    members: Mutex<HashMap<ClientId, Weak<ClientSession>>>,
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a session to the room
    pub fn enter(&self, session: &Arc<ClientSession>) {
        self.members
            .lock()
            .insert(session.id(), Arc::downgrade(session));
    }

    /// Remove a session from the room
    pub fn leave(&self, session: &ClientSession) {
        self.members.lock().remove(&session.id());
    }

    /// Broadcast a message to every member except the sender
    ///
    /// Successive posts serialize on the room lock, so one poster's messages
    /// arrive in order at every recipient. A slow recipient cannot stall the
    /// broadcast: the enqueue never blocks.
    pub fn post(&self, sender: &ClientSession, message: &str) {
        let formatted = Self::format_message(&self.name, sender.name(), message);
        let members = self.members.lock();
        debug!(
            "Posting from {} to {} other members of room {}",
            sender.name(),
            members.len().saturating_sub(1),
            self.name
        );
        for (id, member) in members.iter() {
            if *id == sender.id() {
                continue;
            }
            if let Some(receiver) = member.upgrade() {
                receiver.post_room_message(formatted.clone(), &self.name);
            }
        }
    }

    /// Wire format of a broadcast message
    ///
    /// A bare line separator passes through unformatted.
    pub fn format_message(room: &str, sender: &str, message: &str) -> String {
        if message == "\n" {
            message.to_string()
        } else {
            format!("[{room}]{sender} says {message}")
        }
    }
}

/// Mapping from normalized room name to room
///
/// Owned by one `ChatServer` instance, never a process-wide singleton.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Return the room with the given name, creating it atomically if absent
    ///
    /// The name is trimmed first. Concurrent callers with the same
    /// normalized name all observe the identical room instance.
    pub fn get_or_create_room(&self, name: &str) -> Arc<Room> {
        let key = name.trim();
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get(key) {
            return room.clone();
        }
        let room = Arc::new(Room::new(key.to_string()));
        rooms.insert(key.to_string(), room.clone());
        debug!("Room {} created", key);
        room
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message() {
        assert_eq!(
            Room::format_message("test", "client-1", "abcd"),
            "[test]client-1 says abcd"
        );
    }

    #[test]
    fn test_format_bare_separator_passes_through() {
        assert_eq!(Room::format_message("test", "client-1", "\n"), "\n");
    }

    #[test]
    fn test_get_or_create_room_normalizes_name() {
        let registry = RoomRegistry::new();
        let a = registry.get_or_create_room("test");
        let b = registry.get_or_create_room("  test \n");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "test");
    }

    #[tokio::test]
    async fn test_concurrent_creators_observe_one_room_instance() {
        let registry = Arc::new(RoomRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.get_or_create_room("test") },
            ));
        }

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }

        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
    }
}
