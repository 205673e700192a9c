// Session registry: the authoritative in-process view of live sessions
// and their participant groups.
//
// Every session's membership set is mutated under that session's own
// mutex, so Join/Leave/Destroy/Touch against one session serialize while
// unrelated sessions proceed independently. The outer map lock is held
// only to insert, remove, or clone out a group entry — never across a
// per-session critical section.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use cinder_common::{
    protocol::ws::WsMessage,
    types::{ParticipantRecord, SessionRecord},
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    identity::IdentityProvider,
    metrics,
    store::{SessionStore, StoreError},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found")]
    SessionNotFound,
    #[error("connection is already bound to a participant")]
    DuplicateConnection,
    #[error("connection is not a participant of this session")]
    NotAParticipant,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type OutboundSender = mpsc::UnboundedSender<WsMessage>;

#[derive(Default)]
struct Group {
    /// Set when the session is torn down, so a join racing a
    /// last-participant leave (or a destroy, or a reap) deterministically
    /// observes `SessionNotFound` rather than a half-deleted session.
    defunct: bool,
    members: HashMap<Uuid, GroupMember>,
}

struct GroupMember {
    participant_id: Uuid,
    outbound: OutboundSender,
}

impl Group {
    /// Fan out to every member but the sender. Each recipient gets an
    /// independent non-blocking send; a closed channel is silently dropped.
    fn send_to_others(&self, sender_connection_id: Uuid, message: &WsMessage) -> usize {
        let mut sent = 0;
        for (connection_id, member) in &self.members {
            if *connection_id == sender_connection_id {
                continue;
            }
            if member.outbound.send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn send_to_all(&self, message: &WsMessage) -> usize {
        let mut sent = 0;
        for member in self.members.values() {
            if member.outbound.send(message.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

pub struct SessionRegistry {
    store: SessionStore,
    identity: Arc<dyn IdentityProvider>,
    groups: RwLock<HashMap<String, Arc<Mutex<Group>>>>,
    /// connection id -> owning session id, for disconnect resolution and
    /// duplicate-join rejection.
    connections: RwLock<HashMap<Uuid, String>>,
}

impl SessionRegistry {
    pub fn new(store: SessionStore, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store,
            identity,
            groups: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    async fn group(&self, session_id: &str) -> Option<Arc<Mutex<Group>>> {
        self.groups.read().await.get(session_id).cloned()
    }

    /// Allocate a fresh session with an empty group.
    pub async fn create_session(&self) -> Result<SessionRecord, RegistryError> {
        let session = SessionRecord::new(Uuid::new_v4().simple().to_string(), Utc::now());
        self.store.insert_session(&session).await?;
        self.groups
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(Group::default())));

        metrics::increment_sessions_created();
        info!(session_id = %session.id, "created session");
        Ok(session)
    }

    /// Attach a connection to a session with a freshly generated identity.
    ///
    /// Fails with `SessionNotFound` for missing or defunct sessions and
    /// with `DuplicateConnection` when the connection is already bound.
    /// Remaining members are told about the arrival.
    pub async fn join(
        &self,
        session_id: &str,
        connection_id: Uuid,
        outbound: OutboundSender,
    ) -> Result<ParticipantRecord, RegistryError> {
        if self.connections.read().await.contains_key(&connection_id) {
            return Err(RegistryError::DuplicateConnection);
        }

        let group = self.group(session_id).await.ok_or(RegistryError::SessionNotFound)?;
        let mut group = group.lock().await;
        if group.defunct {
            return Err(RegistryError::SessionNotFound);
        }
        if group.members.contains_key(&connection_id) {
            return Err(RegistryError::DuplicateConnection);
        }

        let identity = self.identity.generate();
        let now = Utc::now();
        let participant = ParticipantRecord {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            connection_id,
            display_name: identity.display_name,
            avatar_tag: identity.avatar_tag,
            joined_at: now,
            last_activity: now,
        };

        self.store.insert_participant(&participant).await?;
        if let Err(error) = self.store.touch_session(session_id, now).await {
            // Do not admit a member whose activity touch never landed.
            let _ = self.store.delete_participant(participant.id).await;
            return Err(error.into());
        }

        self.connections.write().await.insert(connection_id, session_id.to_string());
        group.members.insert(
            connection_id,
            GroupMember { participant_id: participant.id, outbound },
        );
        group.send_to_others(connection_id, &WsMessage::ParticipantJoined { connection_id });

        debug!(
            session_id = %session_id,
            connection_id = %connection_id,
            display_name = %participant.display_name,
            "participant joined"
        );
        Ok(participant)
    }

    /// Detach a connection from its session. Idempotent: disconnect events
    /// for unknown or already-cleaned-up connections are a no-op.
    ///
    /// When the last participant leaves, the session is deleted
    /// synchronously in the same critical section — a racing join sees
    /// either a live session or `SessionNotFound`, never a session with
    /// zero participants.
    pub async fn leave(&self, connection_id: Uuid) -> Result<(), RegistryError> {
        let session_id = self.connections.read().await.get(&connection_id).cloned();
        let Some(session_id) = session_id else {
            return Ok(());
        };

        let Some(group) = self.group(&session_id).await else {
            self.connections.write().await.remove(&connection_id);
            return Ok(());
        };
        let mut group = group.lock().await;

        let Some(member) = group.members.remove(&connection_id) else {
            self.connections.write().await.remove(&connection_id);
            return Ok(());
        };
        self.connections.write().await.remove(&connection_id);
        self.store.delete_participant(member.participant_id).await?;

        if group.members.is_empty() {
            group.defunct = true;
            let deleted = self.store.delete_session(&session_id).await;
            self.groups.write().await.remove(&session_id);
            deleted?;
            info!(session_id = %session_id, "last participant left, session removed");
        } else {
            group.send_to_all(&WsMessage::ParticipantLeft { connection_id });
            debug!(session_id = %session_id, connection_id = %connection_id, "participant left");
        }

        Ok(())
    }

    /// Unconditionally tear down a session, notifying the full prior group.
    /// Idempotent for sessions that are already gone.
    pub async fn destroy(&self, session_id: &str) -> Result<(), RegistryError> {
        match self.group(session_id).await {
            Some(group) => {
                let mut group = group.lock().await;
                if group.defunct {
                    return Ok(());
                }
                self.destroy_locked(session_id, &mut group).await
            }
            // No live group (e.g. rows surviving a restart): purge the store.
            None => self.purge_rows(session_id).await,
        }
    }

    /// Tear down the session while its lock is already held.
    async fn destroy_locked(
        &self,
        session_id: &str,
        group: &mut Group,
    ) -> Result<(), RegistryError> {
        group.defunct = true;
        let members: Vec<(Uuid, GroupMember)> = group.members.drain().collect();

        {
            let mut connections = self.connections.write().await;
            for (connection_id, _) in &members {
                connections.remove(connection_id);
            }
        }

        let rows = self.purge_rows(session_id).await;
        self.groups.write().await.remove(session_id);

        for (_, member) in &members {
            let _ = member.outbound.send(WsMessage::SessionDestroyed);
        }

        metrics::increment_sessions_destroyed();
        info!(session_id = %session_id, participants = members.len(), "session destroyed");
        rows
    }

    /// Delete participant rows, then the session row. The order matters
    /// only for crash tidiness; the store offers no cross-row transaction.
    async fn purge_rows(&self, session_id: &str) -> Result<(), RegistryError> {
        self.store.delete_participants_in_session(session_id).await?;
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    /// Best-effort activity touch. Taken under the session lock so it
    /// orders deterministically against a concurrent reap; failures are
    /// logged, never surfaced.
    pub async fn touch(&self, session_id: &str) {
        let Some(group) = self.group(session_id).await else {
            debug!(session_id = %session_id, "activity touch for unknown session");
            return;
        };
        let group = group.lock().await;
        if group.defunct {
            return;
        }

        match self.store.touch_session(session_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %session_id, "activity touch found no session row")
            }
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "failed to touch session activity")
            }
        }
    }

    /// Destroy a session only if its `last_activity` still precedes the
    /// cutoff. The staleness condition is re-checked under the session
    /// lock, so a touch that landed after the reaper's scan snapshot
    /// aborts this session's destruction.
    pub async fn reap_if_stale(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        match self.group(session_id).await {
            Some(group) => {
                let mut group = group.lock().await;
                if group.defunct {
                    return Ok(false);
                }
                let Some(session) = self.store.session(session_id).await? else {
                    return Ok(false);
                };
                if session.last_activity >= cutoff {
                    debug!(session_id = %session_id, "session refreshed since scan, skipping reap");
                    return Ok(false);
                }
                self.destroy_locked(session_id, &mut group).await?;
                Ok(true)
            }
            None => {
                let Some(session) = self.store.session(session_id).await? else {
                    return Ok(false);
                };
                if session.last_activity >= cutoff {
                    return Ok(false);
                }
                self.purge_rows(session_id).await?;
                Ok(true)
            }
        }
    }

    /// Deliver a message to every group member except the sender.
    /// The sender must itself be a live member of the session.
    pub async fn send_to_others(
        &self,
        session_id: &str,
        sender_connection_id: Uuid,
        message: WsMessage,
    ) -> Result<usize, RegistryError> {
        let group = self.group(session_id).await.ok_or(RegistryError::SessionNotFound)?;
        let group = group.lock().await;
        if group.defunct {
            return Err(RegistryError::SessionNotFound);
        }
        if !group.members.contains_key(&sender_connection_id) {
            return Err(RegistryError::NotAParticipant);
        }
        Ok(group.send_to_others(sender_connection_id, &message))
    }

    /// Deliver a message to a single group member.
    pub async fn send_to_member(
        &self,
        session_id: &str,
        connection_id: Uuid,
        message: WsMessage,
    ) -> Result<(), RegistryError> {
        let group = self.group(session_id).await.ok_or(RegistryError::SessionNotFound)?;
        let group = group.lock().await;
        if group.defunct {
            return Err(RegistryError::SessionNotFound);
        }
        let member =
            group.members.get(&connection_id).ok_or(RegistryError::NotAParticipant)?;
        let _ = member.outbound.send(message);
        Ok(())
    }

    /// Number of live members in a session's group, if it exists.
    pub async fn member_count(&self, session_id: &str) -> Option<usize> {
        let group = self.group(session_id).await?;
        let group = group.lock().await;
        if group.defunct {
            None
        } else {
            Some(group.members.len())
        }
    }
}
