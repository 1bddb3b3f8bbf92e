//! Room membership and broadcast fan-out.
//!
//! The router owns the room map and a per-user reverse index. Fan-out
//! resolves each member's live connections through the registry, applies
//! filter predicates per candidate, and reports per-send outcomes without
//! ever aborting a batch on one bad connection.

use crate::connection::{ConnectionStatus, UserId};
use crate::events::{Event, EventBus};
use crate::filter::{matches_all, FilterExpr};
use crate::registry::ConnectionRegistry;
use crate::room::{validate_room_id, Room, RoomId, RoomKind, RoomSettings};
use courier_protocol::{codec, Envelope};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    InvalidRoomId(&'static str),

    /// Room not found.
    #[error("Room not found: {0}")]
    NotFound(RoomId),

    /// Room already exists.
    #[error("Room already exists: {0}")]
    AlreadyExists(RoomId),

    /// Member cap reached.
    #[error("Room is full: {0}")]
    Full(RoomId),

    /// The user is banned from the room.
    #[error("Banned from room: {0}")]
    Banned(RoomId),

    /// Private room and no standing invitation.
    #[error("Room requires an invitation: {0}")]
    InvitationRequired(RoomId),

    /// The user is not a member.
    #[error("Not a member of room: {0}")]
    PermissionDenied(RoomId),

    /// Per-user or room-wide rate window exhausted.
    #[error("Rate limit exceeded in room: {0}")]
    RateLimitExceeded(RoomId),

    /// Payload larger than the room allows.
    #[error("Message exceeds limit of {0} bytes")]
    MessageTooLarge(usize),
}

/// Counts reported by a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Candidate connections after filters and exclusions.
    pub attempted: usize,
    /// Sends that completed.
    pub succeeded: usize,
    /// Sends that errored (logged, never propagated).
    pub failed: usize,
}

/// Router statistics.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Number of rooms.
    pub rooms: usize,
    /// Sum of member counts across rooms.
    pub total_members: usize,
}

/// The room router.
pub struct RoomRouter {
    /// Rooms indexed by id.
    rooms: DashMap<RoomId, Room>,
    /// Reverse index: user id -> rooms joined.
    memberships: DashMap<UserId, DashSet<RoomId>>,
    registry: Arc<ConnectionRegistry>,
    events: EventBus,
}

impl RoomRouter {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, events: EventBus) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            registry,
            events,
        }
    }

    /// Create a room.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRoomId` or `AlreadyExists`.
    pub fn create_room(
        &self,
        id: &str,
        kind: RoomKind,
        settings: RoomSettings,
    ) -> Result<(), RoomError> {
        validate_room_id(id).map_err(RoomError::InvalidRoomId)?;

        match self.rooms.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RoomError::AlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Room::new(id, kind, settings));
                info!(room = %id, ?kind, "Room created");
                self.events.emit(Event::RoomCreated {
                    room_id: id.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Delete a room, clearing every membership.
    ///
    /// Returns `false` if the room did not exist.
    pub fn delete_room(&self, id: &str) -> bool {
        let Some((_, room)) = self.rooms.remove(id) else {
            return false;
        };
        for user_id in &room.members {
            self.forget_membership(user_id, id);
        }
        info!(room = %id, members = room.members.len(), "Room deleted");
        true
    }

    /// Grant a standing invitation. Consumed when the user joins.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the room does not exist.
    pub fn invite(&self, room_id: &str, user_id: &str) -> Result<(), RoomError> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        room.invited.insert(user_id.to_string());
        debug!(room = %room_id, user = %user_id, "Invitation granted");
        Ok(())
    }

    /// Ban a user, evicting them if they are a member.
    ///
    /// Returns whether the user was evicted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the room does not exist.
    pub fn ban(&self, room_id: &str, user_id: &str) -> Result<bool, RoomError> {
        let evicted = {
            let mut room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
            room.banned.insert(user_id.to_string());
            room.invited.remove(user_id);
            let evicted = room.members.remove(user_id);
            if evicted {
                room.forget_rate(user_id);
            }
            evicted
        };

        if evicted {
            self.forget_membership(user_id, room_id);
            info!(room = %room_id, user = %user_id, "User banned and evicted");
            self.events.emit(Event::RoomLeft {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(evicted)
    }

    /// Evict a user without banning them.
    ///
    /// Returns whether the user was a member.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the room does not exist.
    pub fn kick(&self, room_id: &str, user_id: &str) -> Result<bool, RoomError> {
        let evicted = {
            let mut room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
            let evicted = room.members.remove(user_id);
            if evicted {
                room.forget_rate(user_id);
            }
            evicted
        };

        if evicted {
            self.forget_membership(user_id, room_id);
            debug!(room = %room_id, user = %user_id, "User kicked");
            self.events.emit(Event::RoomLeft {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(evicted)
    }

    /// Add a user to a room. Joining a room you are already in is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Banned`, `Full`, or `InvitationRequired`; none
    /// of these mutate membership.
    pub fn join(&self, room_id: &str, user_id: &str) -> Result<(), RoomError> {
        {
            let mut room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;

            if room.is_banned(user_id) {
                return Err(RoomError::Banned(room_id.to_string()));
            }
            if room.is_member(user_id) {
                return Ok(());
            }
            if room.is_full() {
                return Err(RoomError::Full(room_id.to_string()));
            }
            if room.kind == RoomKind::Private && !room.is_invited(user_id) {
                return Err(RoomError::InvitationRequired(room_id.to_string()));
            }

            room.members.insert(user_id.to_string());
            room.invited.remove(user_id);
        }

        self.memberships
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());

        debug!(room = %room_id, user = %user_id, "User joined room");
        self.events.emit(Event::RoomJoined {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Remove a user from a room.
    ///
    /// Idempotent: returns `false` (and changes nothing) when the user is
    /// not a member or the room does not exist.
    pub fn leave(&self, room_id: &str, user_id: &str) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                let removed = room.members.remove(user_id);
                if removed {
                    room.forget_rate(user_id);
                }
                removed
            }
            None => false,
        };

        if removed {
            self.forget_membership(user_id, room_id);
            debug!(room = %room_id, user = %user_id, "User left room");
            self.events.emit(Event::RoomLeft {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        removed
    }

    /// Check whether a member may publish `payload_len` bytes right now.
    ///
    /// A pass records the send in both rate windows and counts as user
    /// activity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `PermissionDenied`, `MessageTooLarge`, or
    /// `RateLimitExceeded`.
    pub fn check_publish(
        &self,
        room_id: &str,
        user_id: &str,
        payload_len: usize,
    ) -> Result<(), RoomError> {
        {
            let mut room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;

            if !room.is_member(user_id) {
                return Err(RoomError::PermissionDenied(room_id.to_string()));
            }
            if payload_len > room.settings.max_message_bytes {
                return Err(RoomError::MessageTooLarge(room.settings.max_message_bytes));
            }
            if !room.check_rate(user_id, Instant::now()) {
                return Err(RoomError::RateLimitExceeded(room_id.to_string()));
            }
        }

        self.events.emit(Event::Activity {
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Fan an envelope out to every live connection of every member.
    ///
    /// `filters` is a conjunction evaluated per candidate connection;
    /// `exclude` drops users entirely (typically the sender). Individual
    /// send failures are counted in the outcome, never propagated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the room does not exist, or `MessageTooLarge`
    /// if the envelope exceeds the wire limit.
    pub async fn broadcast(
        &self,
        room_id: &str,
        envelope: &Envelope,
        filters: Option<&[FilterExpr]>,
        exclude: &[UserId],
    ) -> Result<DeliveryOutcome, RoomError> {
        let members: Vec<UserId> = {
            let room = self
                .rooms
                .get(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
            room.members.iter().cloned().collect()
        };

        // Encode once, write to many sinks.
        let frame = codec::encode(envelope)
            .map_err(|_| RoomError::MessageTooLarge(codec::MAX_ENVELOPE_SIZE))?;

        let mut sends = Vec::new();
        for user_id in &members {
            if exclude.contains(user_id) {
                continue;
            }
            for conn_id in self.registry.connections_for_user(user_id) {
                let Some(snapshot) = self.registry.snapshot(&conn_id) else {
                    continue;
                };
                if snapshot.status != ConnectionStatus::Connected || !snapshot.is_authenticated() {
                    continue;
                }
                if let Some(filters) = filters {
                    let attrs = candidate_attrs(&snapshot.attrs, &snapshot.rooms);
                    if !matches_all(filters, &attrs) {
                        continue;
                    }
                }
                if let Some(sink) = self.registry.sink(&conn_id) {
                    sends.push((conn_id, sink));
                }
            }
        }

        let mut outcome = DeliveryOutcome {
            attempted: sends.len(),
            ..Default::default()
        };

        let results = join_all(
            sends
                .into_iter()
                .map(|(conn_id, sink)| {
                    let frame = frame.as_str();
                    async move { (conn_id, sink.send(frame).await) }
                }),
        )
        .await;

        for (conn_id, result) in results {
            match result {
                Ok(()) => outcome.succeeded += 1,
                Err(error) => {
                    outcome.failed += 1;
                    warn!(room = %room_id, connection = %conn_id, %error, "Broadcast send failed");
                }
            }
        }

        debug!(
            room = %room_id,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Broadcast complete"
        );
        Ok(outcome)
    }

    /// Delete temporary rooms whose TTL has elapsed.
    ///
    /// Returns the ids that were reaped.
    pub fn reap_expired(&self) -> Vec<RoomId> {
        let now = Instant::now();
        let expired: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|room| room.is_expired(now))
            .map(|room| room.id.clone())
            .collect();

        for id in &expired {
            self.delete_room(id);
            debug!(room = %id, "Expired room reaped");
        }
        expired
    }

    /// Whether a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Member count for a room, zero if it does not exist.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.member_count())
    }

    /// Members of a room.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<UserId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a user has joined.
    #[must_use]
    pub fn rooms_for_user(&self, user_id: &str) -> Vec<RoomId> {
        self.memberships
            .get(user_id)
            .map(|set| set.iter().map(|room| room.clone()).collect())
            .unwrap_or_default()
    }

    /// Router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            rooms: self.rooms.len(),
            total_members: self.rooms.iter().map(|room| room.member_count()).sum(),
        }
    }

    fn forget_membership(&self, user_id: &str, room_id: &str) {
        if let Some(set) = self.memberships.get(user_id) {
            set.remove(room_id);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.memberships.remove_if(user_id, |_, set| set.is_empty());
            }
        }
    }
}

/// Attributes a filter sees for one candidate connection.
fn candidate_attrs(
    attrs: &serde_json::Value,
    rooms: &std::collections::HashSet<RoomId>,
) -> serde_json::Value {
    let mut merged = attrs.clone();
    if !merged.is_object() {
        merged = json!({});
    }
    if let Some(object) = merged.as_object_mut() {
        object.insert(
            "rooms".to_string(),
            json!(rooms.iter().collect::<Vec<_>>()),
        );
    }
    merged
}
