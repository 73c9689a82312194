//! Server state management for the signaling server
//!
//! This module owns room membership and the mapping from connections to the
//! membership they hold. Every membership change on a room happens under that
//! room's own mutex; the directory and session index are concurrent maps that
//! only need atomic insert and remove.

use crate::connection::{Connection, ConnectionId};
use crate::error::SignalingError;
use dashmap::DashMap;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use videoroom_protocol::PeerSummary;

/// Room identifier
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier the server hands to a member on join
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberId(String);

impl MemberId {
    /// A fresh, globally unique id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MemberId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A client that joined a room
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub connection: Connection,
}

impl Member {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.to_string(),
            name: self.name.clone(),
        }
    }
}

/// Members currently in one named room
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashMap<MemberId, Member>,
    /// Set once the room has been emptied and unlinked from the directory
    retired: bool,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
            retired: false,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Insert a member, replacing any member with the same id
    pub fn add_member(&mut self, member: Member) {
        self.members.insert(member.id.clone(), member);
    }

    pub fn remove_member(&mut self, member_id: &str) -> Option<Member> {
        self.members.remove(member_id)
    }

    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members.get(member_id)
    }

    /// Copy of the current members, detached from later changes
    pub fn snapshot_members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// A room shared between the directory and the connections inside it
pub type SharedRoom = Arc<Mutex<Room>>;

/// Lock a room. A panic while holding the lock cannot leave the member map
/// half-written, so a poisoned guard is still usable.
pub fn lock_room(room: &SharedRoom) -> MutexGuard<'_, Room> {
    room.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map of live rooms. Every room in it has at least one member.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomId, SharedRoom>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the room registered under `room_id`, creating it if needed.
    ///
    /// Two callers racing on an unseen id get the same room.
    pub fn get_or_create_room(&self, room_id: &RoomId) -> SharedRoom {
        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                debug!(%room_id, "creating room");
                Arc::new(Mutex::new(Room::new(room_id.clone())))
            })
            .value()
            .clone()
    }

    pub fn get_room(&self, room_id: &RoomId) -> Option<SharedRoom> {
        self.rooms.get(room_id).map(|room| room.value().clone())
    }

    /// Unlink `room` if it has no members left.
    ///
    /// `guard` must be the held lock of `room`, taken for the removal that may
    /// have emptied it, so the emptiness check and the unlink are one step.
    /// Returns whether the room was removed.
    pub fn delete_if_empty(&self, room: &SharedRoom, guard: &mut Room) -> bool {
        if !guard.is_empty() {
            return false;
        }
        guard.retired = true;
        self.rooms
            .remove_if(guard.id(), |_, current| Arc::ptr_eq(current, room))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// The membership a connection holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub member_id: MemberId,
    pub room_id: RoomId,
}

/// Map from connection to its session
#[derive(Debug, Default)]
pub struct SessionIndex {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session, returning any stale one it replaced
    pub fn bind(&self, session: Session) -> Option<Session> {
        self.sessions.insert(session.connection_id, session)
    }

    /// Remove and return the session; a second call returns `None`
    pub fn unbind(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions
            .remove(&connection_id)
            .map(|(_, session)| session)
    }

    pub fn lookup(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions
            .get(&connection_id)
            .map(|session| session.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    pub member_id: MemberId,
    /// Members present just before the new member was inserted
    pub peers: Vec<Member>,
}

/// Result of a leave that removed a member
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub member: Member,
    /// Members still in the room after the removal
    pub remaining: Vec<Member>,
    /// Whether the removal emptied the room and it was deleted
    pub room_deleted: bool,
}

struct InnerState {
    directory: RoomDirectory,
    sessions: SessionIndex,
    room_capacity: NonZeroUsize,
    next_connection_id: AtomicU64,
}

/// The server context shared by every connection
///
/// Cloning is cheap; all clones see the same rooms and sessions.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<InnerState>,
}

impl ServerState {
    /// Create an empty state whose rooms admit at most `room_capacity` members
    pub fn new(room_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(InnerState {
                directory: RoomDirectory::new(),
                sessions: SessionIndex::new(),
                room_capacity,
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn room_capacity(&self) -> NonZeroUsize {
        self.inner.room_capacity
    }

    /// Allocate an id for a newly accepted connection
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add `connection` to `room_id` as a new member named `name`.
    ///
    /// The capacity check, peer snapshot, insertion and session binding all
    /// happen under the room's lock.
    pub fn join(
        &self,
        room_id: RoomId,
        name: String,
        connection: &Connection,
    ) -> Result<JoinOutcome, SignalingError> {
        loop {
            let room = self.inner.directory.get_or_create_room(&room_id);
            let mut guard = lock_room(&room);

            // Emptied and unlinked after we looked it up; a new room will be created
            if guard.is_retired() {
                continue;
            }

            if guard.member_count() >= self.inner.room_capacity.get() {
                return Err(SignalingError::RoomFull);
            }

            let member_id = MemberId::generate();
            let peers = guard.snapshot_members();
            guard.add_member(Member {
                id: member_id.clone(),
                name,
                connection: connection.clone(),
            });
            self.inner.sessions.bind(Session {
                connection_id: connection.id(),
                member_id: member_id.clone(),
                room_id: room_id.clone(),
            });

            return Ok(JoinOutcome {
                room_id,
                member_id,
                peers,
            });
        }
    }

    /// Drop the membership held by `connection_id`, if any.
    ///
    /// Safe to call any number of times; only the first call after a join
    /// returns an outcome.
    pub fn leave(&self, connection_id: ConnectionId) -> Option<LeaveOutcome> {
        let session = self.inner.sessions.unbind(connection_id)?;
        let room = self.inner.directory.get_room(&session.room_id)?;

        let mut guard = lock_room(&room);
        let member = guard.remove_member(session.member_id.as_str())?;
        let room_deleted = self.inner.directory.delete_if_empty(&room, &mut guard);
        let remaining = guard.snapshot_members();
        drop(guard);

        if room_deleted {
            info!(room_id = %session.room_id, "room removed (empty)");
        }

        Some(LeaveOutcome {
            room_id: session.room_id,
            member,
            remaining,
            room_deleted,
        })
    }

    /// Resolve a signal from `connection_id` to member `to` of the same room.
    ///
    /// Returns the sender's member id and the target's connection. The target
    /// is looked up at call time, never cached.
    pub fn route(
        &self,
        connection_id: ConnectionId,
        to: &str,
    ) -> Result<(MemberId, Connection), SignalingError> {
        let session = self
            .inner
            .sessions
            .lookup(connection_id)
            .ok_or(SignalingError::NotJoined)?;
        let room = self
            .inner
            .directory
            .get_room(&session.room_id)
            .ok_or(SignalingError::RoomNotFound)?;

        let guard = lock_room(&room);
        let target = guard.member(to).ok_or(SignalingError::TargetNotFound)?;
        Ok((session.member_id, target.connection.clone()))
    }

    /// Current members of a room, or `None` if no such room exists
    pub fn room_members(&self, room_id: &RoomId) -> Option<Vec<Member>> {
        let room = self.inner.directory.get_room(room_id)?;
        let guard = lock_room(&room);
        Some(guard.snapshot_members())
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.inner
            .directory
            .get_room(room_id)
            .map_or(0, |room| {
                let guard = lock_room(&room);
                guard.member_count()
            })
    }

    pub fn room_count(&self) -> usize {
        self.inner.directory.len()
    }

    pub fn session(&self, connection_id: ConnectionId) -> Option<Session> {
        self.inner.sessions.lookup(connection_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("rooms", &self.room_count())
            .field("sessions", &self.session_count())
            .field("room_capacity", &self.inner.room_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use std::collections::HashSet;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn state(capacity: usize) -> ServerState {
        ServerState::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn connection(state: &ServerState) -> (Connection, UnboundedReceiver<Outbound>) {
        Connection::channel(state.next_connection_id())
    }

    fn member(name: &str) -> Member {
        let (conn, _rx) = Connection::channel(ConnectionId(0));
        Member {
            id: MemberId::generate(),
            name: name.to_string(),
            connection: conn,
        }
    }

    #[test]
    fn room_add_remove_and_snapshot() {
        let mut room = Room::new(RoomId::from("r1"));
        assert!(room.is_empty());

        let alice = member("Alice");
        let alice_id = alice.id.clone();
        room.add_member(alice);
        room.add_member(member("Bob"));
        assert_eq!(room.member_count(), 2);

        let snapshot = room.snapshot_members();
        room.add_member(member("Carol"));
        assert_eq!(snapshot.len(), 2);

        let removed = room.remove_member(alice_id.as_str()).unwrap();
        assert_eq!(removed.name, "Alice");
        assert!(room.remove_member(alice_id.as_str()).is_none());
        assert_eq!(room.member_count(), 2);
    }

    #[test]
    fn room_add_overwrites_same_id() {
        let mut room = Room::new(RoomId::from("r1"));
        let first = member("Alice");
        let mut second = member("Alice again");
        second.id = first.id.clone();
        room.add_member(first);
        room.add_member(second);
        assert_eq!(room.member_count(), 1);
        assert_eq!(room.snapshot_members()[0].name, "Alice again");
    }

    #[test]
    fn directory_returns_same_room_for_same_id() {
        let directory = RoomDirectory::new();
        let a = directory.get_or_create_room(&RoomId::from("r1"));
        let b = directory.get_or_create_room(&RoomId::from("r1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(directory.len(), 1);
        assert!(directory.get_room(&RoomId::from("r2")).is_none());
    }

    #[test]
    fn directory_deletes_only_empty_rooms() {
        let directory = RoomDirectory::new();
        let room_id = RoomId::from("r1");
        let room = directory.get_or_create_room(&room_id);

        let m = member("Alice");
        let id = m.id.clone();
        {
            let mut guard = lock_room(&room);
            guard.add_member(m);
            assert!(!directory.delete_if_empty(&room, &mut guard));
        }
        assert_eq!(directory.len(), 1);

        let mut guard = lock_room(&room);
        guard.remove_member(id.as_str());
        assert!(directory.delete_if_empty(&room, &mut guard));
        assert!(guard.is_retired());
        drop(guard);
        assert!(directory.is_empty());
    }

    #[test]
    fn session_unbind_is_idempotent() {
        let sessions = SessionIndex::new();
        let session = Session {
            connection_id: ConnectionId(7),
            member_id: MemberId::generate(),
            room_id: RoomId::from("r1"),
        };
        assert!(sessions.bind(session.clone()).is_none());
        assert_eq!(sessions.lookup(ConnectionId(7)), Some(session.clone()));
        assert_eq!(sessions.unbind(ConnectionId(7)), Some(session));
        assert!(sessions.unbind(ConnectionId(7)).is_none());
        assert!(sessions.lookup(ConnectionId(7)).is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn join_snapshots_peers_before_insert() {
        let state = state(6);
        let room_id = RoomId::from("r1");
        let (a, _a_rx) = connection(&state);
        let (b, _b_rx) = connection(&state);

        let first = state.join(room_id.clone(), "Alice".into(), &a).unwrap();
        assert!(first.peers.is_empty());

        let second = state.join(room_id.clone(), "Bob".into(), &b).unwrap();
        assert_eq!(second.peers.len(), 1);
        assert_eq!(second.peers[0].id, first.member_id);
        assert_eq!(second.peers[0].name, "Alice");
        assert_ne!(first.member_id, second.member_id);

        assert_eq!(state.member_count(&room_id), 2);
        assert_eq!(state.session_count(), 2);
        assert_eq!(state.session(b.id()).unwrap().member_id, second.member_id);
    }

    #[test]
    fn join_rejects_beyond_capacity() {
        let state = state(6);
        let room_id = RoomId::from("full");
        let mut receivers = Vec::new();
        for i in 0..6 {
            let (conn, rx) = connection(&state);
            receivers.push(rx);
            state.join(room_id.clone(), format!("p{i}"), &conn).unwrap();
        }

        let (late, _rx) = connection(&state);
        let err = state.join(room_id.clone(), "late".into(), &late).unwrap_err();
        assert_eq!(err, SignalingError::RoomFull);
        assert_eq!(state.member_count(&room_id), 6);
        assert!(state.session(late.id()).is_none());
    }

    #[test]
    fn concurrent_joins_never_exceed_capacity() {
        let state = state(6);
        let room_id = RoomId::from("race");

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let state = state.clone();
                let room_id = room_id.clone();
                std::thread::spawn(move || {
                    let (conn, rx) = connection(&state);
                    let result = state.join(room_id, format!("p{i}"), &conn);
                    (result.is_ok(), rx)
                })
            })
            .collect();

        let joined = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|(ok, _)| *ok)
            .count();
        assert_eq!(joined, 6);
        assert_eq!(state.member_count(&room_id), 6);
        assert_eq!(state.room_count(), 1);
    }

    #[test]
    fn leave_removes_member_and_empty_room() {
        let state = state(6);
        let room_id = RoomId::from("r1");
        let (a, _a_rx) = connection(&state);
        let (b, _b_rx) = connection(&state);
        let a_join = state.join(room_id.clone(), "Alice".into(), &a).unwrap();
        let b_join = state.join(room_id.clone(), "Bob".into(), &b).unwrap();

        let left = state.leave(b.id()).unwrap();
        assert_eq!(left.member.id, b_join.member_id);
        assert!(!left.room_deleted);
        assert_eq!(left.remaining.len(), 1);
        assert_eq!(left.remaining[0].id, a_join.member_id);
        assert!(state.leave(b.id()).is_none());

        let left = state.leave(a.id()).unwrap();
        assert!(left.room_deleted);
        assert!(left.remaining.is_empty());
        assert_eq!(state.room_count(), 0);
        assert!(state.room_members(&room_id).is_none());
    }

    #[test]
    fn deleted_room_is_recreated_clean() {
        let state = state(6);
        let room_id = RoomId::from("again");
        let (a, _a_rx) = connection(&state);
        state.join(room_id.clone(), "Alice".into(), &a).unwrap();
        state.leave(a.id()).unwrap();

        let (b, _b_rx) = connection(&state);
        let outcome = state.join(room_id.clone(), "Bob".into(), &b).unwrap();
        assert!(outcome.peers.is_empty());
        assert_eq!(state.member_count(&room_id), 1);
    }

    #[test]
    fn join_skips_retired_room() {
        let state = state(6);
        let room_id = RoomId::from("retired");
        let (a, _a_rx) = connection(&state);
        state.join(room_id.clone(), "Alice".into(), &a).unwrap();

        // Hold on to the room as a joiner that looked it up before the leave would
        let stale = state.inner.directory.get_room(&room_id).unwrap();
        state.leave(a.id()).unwrap();
        assert!(lock_room(&stale).is_retired());

        let (b, _b_rx) = connection(&state);
        state.join(room_id.clone(), "Bob".into(), &b).unwrap();
        let live = state.inner.directory.get_room(&room_id).unwrap();
        assert!(!Arc::ptr_eq(&stale, &live));
        assert_eq!(lock_room(&live).member_count(), 1);
        assert!(lock_room(&stale).is_empty());
    }

    #[test]
    fn route_resolves_target_in_same_room() {
        let state = state(6);
        let (a, _a_rx) = connection(&state);
        let (b, _b_rx) = connection(&state);
        let (c, _c_rx) = connection(&state);
        let a_join = state.join(RoomId::from("r1"), "Alice".into(), &a).unwrap();
        let b_join = state.join(RoomId::from("r1"), "Bob".into(), &b).unwrap();
        let c_join = state.join(RoomId::from("r2"), "Carol".into(), &c).unwrap();

        let (from, target) = state.route(b.id(), a_join.member_id.as_str()).unwrap();
        assert_eq!(from, b_join.member_id);
        assert_eq!(target.id(), a.id());

        assert_eq!(
            state.route(b.id(), c_join.member_id.as_str()).unwrap_err(),
            SignalingError::TargetNotFound
        );
        assert_eq!(
            state.route(ConnectionId(999), a_join.member_id.as_str()).unwrap_err(),
            SignalingError::NotJoined
        );

        state.leave(a.id()).unwrap();
        assert_eq!(
            state.route(b.id(), a_join.member_id.as_str()).unwrap_err(),
            SignalingError::TargetNotFound
        );
    }

    #[test]
    fn member_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| MemberId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
