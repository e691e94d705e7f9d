//! Session registry
//!
//! Process-local tables: session identity plus the room index. Each
//! gateway process owns its registry exclusively; the cross-process
//! view lives in the state store's session mirror.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gateway::protocol::ServerEvent;
use crate::models::SessionInfo;

struct SessionHandle {
    info: SessionInfo,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: SessionInfo, sender: mpsc::UnboundedSender<ServerEvent>) {
        self.sessions
            .write()
            .insert(info.session_id, SessionHandle { info, sender });
    }

    pub fn remove(&self, session_id: Uuid) -> Option<SessionInfo> {
        let handle = self.sessions.write().remove(&session_id)?;
        if let Some(auction_id) = handle.info.auction_id {
            self.leave_room(auction_id, session_id);
        }
        Some(handle.info)
    }

    pub fn info(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|handle| handle.info.clone())
    }

    /// Move the session into a room (or out of all rooms with `None`).
    pub fn set_room(&self, session_id: Uuid, auction_id: Option<Uuid>) {
        let previous = {
            let mut sessions = self.sessions.write();
            let Some(handle) = sessions.get_mut(&session_id) else {
                return;
            };
            std::mem::replace(&mut handle.info.auction_id, auction_id)
        };
        if let Some(previous) = previous {
            self.leave_room(previous, session_id);
        }
        if let Some(auction_id) = auction_id {
            self.rooms
                .write()
                .entry(auction_id)
                .or_default()
                .insert(session_id);
        }
    }

    fn leave_room(&self, auction_id: Uuid, session_id: Uuid) {
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(&auction_id) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(&auction_id);
            }
        }
    }

    pub fn room_members(&self, auction_id: Uuid) -> Vec<Uuid> {
        self.rooms
            .read()
            .get(&auction_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Deliver to one session. Returns false when the session is gone
    /// or its channel is closed.
    pub fn send_to(&self, session_id: Uuid, event: ServerEvent) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(&session_id) {
            Some(handle) => handle.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver to every session in a room, optionally skipping one.
    pub fn broadcast_room(&self, auction_id: Uuid, event: &ServerEvent, skip: Option<Uuid>) {
        let members = self.room_members(auction_id);
        let sessions = self.sessions.read();
        for member in members {
            if Some(member) == skip {
                continue;
            }
            if let Some(handle) = sessions.get(&member) {
                let _ = handle.sender.send(event.clone());
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(registry: &SessionRegistry) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = SessionInfo::new(Uuid::new_v4(), Uuid::new_v4(), "user".into(), 0);
        let id = info.session_id;
        registry.insert(info, tx);
        (id, rx)
    }

    #[test]
    fn broadcast_skips_the_named_session() {
        let registry = SessionRegistry::new();
        let auction_id = Uuid::new_v4();
        let (s1, mut rx1) = session(&registry);
        let (s2, mut rx2) = session(&registry);
        registry.set_room(s1, Some(auction_id));
        registry.set_room(s2, Some(auction_id));

        registry.broadcast_room(
            auction_id,
            &ServerEvent::Pong { timestamp: 1 },
            Some(s1),
        );
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn switching_rooms_leaves_the_previous_one() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session(&registry);
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());

        registry.set_room(s, Some(room_a));
        registry.set_room(s, Some(room_b));
        assert!(registry.room_members(room_a).is_empty());
        assert_eq!(registry.room_members(room_b), vec![s]);

        registry.set_room(s, None);
        assert!(registry.room_members(room_b).is_empty());
    }

    #[test]
    fn removal_cleans_the_room_index() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session(&registry);
        let room = Uuid::new_v4();
        registry.set_room(s, Some(room));

        let info = registry.remove(s).unwrap();
        assert_eq!(info.auction_id, Some(room));
        assert!(registry.room_members(room).is_empty());
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.send_to(s, ServerEvent::Pong { timestamp: 1 }));
    }
}
