// Session store: durable or in-memory persistence for session and
// participant rows.
//
// The store provides single-row atomicity only. Cross-row invariants
// (cascade delete, delete-on-last-leave, reap re-validation) are enforced
// by the registry, never assumed from here.

pub mod migrations;
pub mod pool;

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cinder_common::types::{ParticipantRecord, SessionRecord};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use self::pool::{check_pool_health, create_pg_pool, PoolConfig};

/// Persistence layer failure. Details are logged by callers; only the
/// error kind propagates outward.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable")]
    Unavailable(#[from] sqlx::Error),
}

#[derive(Clone)]
pub enum SessionStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemorySessionStore>>),
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, SessionRecord>,
    participants: HashMap<Uuid, ParticipantRecord>,
}

impl SessionStore {
    /// Build the store from configuration: Postgres when a database URL is
    /// set, the in-memory variant otherwise.
    pub async fn from_config(database_url: Option<&str>) -> anyhow::Result<Self> {
        match database_url {
            Some(url) => {
                let pool = create_pg_pool(url, PoolConfig::from_env())
                    .await
                    .context("failed to initialize relay PostgreSQL pool")?;
                check_pool_health(&pool)
                    .await
                    .context("relay PostgreSQL health check failed")?;
                migrations::run_migrations(&pool).await?;
                Ok(Self::Postgres(pool))
            }
            None => {
                info!("no database url configured, using in-memory session store");
                Ok(Self::memory())
            }
        }
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemorySessionStore::default())))
    }

    pub async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        match self {
            Self::Postgres(db) => {
                sqlx::query(
                    "INSERT INTO chat_sessions (id, created_at, last_activity) \
                     VALUES ($1, $2, $3)",
                )
                .bind(&session.id)
                .bind(session.created_at)
                .bind(session.last_activity)
                .execute(db)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                store.write().await.sessions.insert(session.id.clone(), session.clone());
                Ok(())
            }
        }
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        match self {
            Self::Postgres(db) => {
                let row = sqlx::query_as::<_, (String, DateTime<Utc>, DateTime<Utc>)>(
                    "SELECT id, created_at, last_activity FROM chat_sessions WHERE id = $1",
                )
                .bind(session_id)
                .fetch_optional(db)
                .await?;
                Ok(row.map(|(id, created_at, last_activity)| SessionRecord {
                    id,
                    created_at,
                    last_activity,
                }))
            }
            Self::Memory(store) => Ok(store.read().await.sessions.get(session_id).cloned()),
        }
    }

    /// Advance a session's `last_activity`. Returns whether the row existed.
    pub async fn touch_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(db) => {
                let updated = sqlx::query(
                    "UPDATE chat_sessions SET last_activity = $2 \
                     WHERE id = $1 AND last_activity < $2",
                )
                .bind(session_id)
                .bind(now)
                .execute(db)
                .await?
                .rows_affected();
                if updated == 1 {
                    return Ok(true);
                }
                // Row may exist with a newer timestamp; report presence, not change.
                self.session(session_id).await.map(|session| session.is_some())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                match guard.sessions.get_mut(session_id) {
                    Some(session) => {
                        // last_activity is monotonically non-decreasing.
                        session.last_activity = session.last_activity.max(now);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Delete a session row. Participant rows are the registry's problem.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(db) => {
                let deleted = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
                    .bind(session_id)
                    .execute(db)
                    .await?
                    .rows_affected();
                Ok(deleted == 1)
            }
            Self::Memory(store) => {
                Ok(store.write().await.sessions.remove(session_id).is_some())
            }
        }
    }

    pub async fn insert_participant(
        &self,
        participant: &ParticipantRecord,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(db) => {
                sqlx::query(
                    "INSERT INTO participants \
                     (id, session_id, connection_id, display_name, avatar_tag, joined_at, last_activity) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(participant.id)
                .bind(&participant.session_id)
                .bind(participant.connection_id)
                .bind(&participant.display_name)
                .bind(&participant.avatar_tag)
                .bind(participant.joined_at)
                .bind(participant.last_activity)
                .execute(db)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                store.write().await.participants.insert(participant.id, participant.clone());
                Ok(())
            }
        }
    }

    pub async fn delete_participant(&self, participant_id: Uuid) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(db) => {
                let deleted = sqlx::query("DELETE FROM participants WHERE id = $1")
                    .bind(participant_id)
                    .execute(db)
                    .await?
                    .rows_affected();
                Ok(deleted == 1)
            }
            Self::Memory(store) => {
                Ok(store.write().await.participants.remove(&participant_id).is_some())
            }
        }
    }

    pub async fn delete_participants_in_session(
        &self,
        session_id: &str,
    ) -> Result<u64, StoreError> {
        match self {
            Self::Postgres(db) => {
                let deleted = sqlx::query("DELETE FROM participants WHERE session_id = $1")
                    .bind(session_id)
                    .execute(db)
                    .await?
                    .rows_affected();
                Ok(deleted)
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let before = guard.participants.len();
                guard.participants.retain(|_, p| p.session_id != session_id);
                Ok((before - guard.participants.len()) as u64)
            }
        }
    }

    pub async fn participant_by_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<ParticipantRecord>, StoreError> {
        match self {
            Self::Postgres(db) => {
                let row = sqlx::query_as::<
                    _,
                    (Uuid, String, Uuid, String, String, DateTime<Utc>, DateTime<Utc>),
                >(
                    "SELECT id, session_id, connection_id, display_name, avatar_tag, joined_at, last_activity \
                     FROM participants WHERE connection_id = $1",
                )
                .bind(connection_id)
                .fetch_optional(db)
                .await?;
                Ok(row.map(participant_from_row))
            }
            Self::Memory(store) => Ok(store
                .read()
                .await
                .participants
                .values()
                .find(|p| p.connection_id == connection_id)
                .cloned()),
        }
    }

    pub async fn participants_in_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ParticipantRecord>, StoreError> {
        match self {
            Self::Postgres(db) => {
                let rows = sqlx::query_as::<
                    _,
                    (Uuid, String, Uuid, String, String, DateTime<Utc>, DateTime<Utc>),
                >(
                    "SELECT id, session_id, connection_id, display_name, avatar_tag, joined_at, last_activity \
                     FROM participants WHERE session_id = $1 ORDER BY joined_at",
                )
                .bind(session_id)
                .fetch_all(db)
                .await?;
                Ok(rows.into_iter().map(participant_from_row).collect())
            }
            Self::Memory(store) => {
                let mut participants: Vec<ParticipantRecord> = store
                    .read()
                    .await
                    .participants
                    .values()
                    .filter(|p| p.session_id == session_id)
                    .cloned()
                    .collect();
                participants.sort_by_key(|p| p.joined_at);
                Ok(participants)
            }
        }
    }

    /// Sessions whose `last_activity` precedes the cutoff. The snapshot may
    /// be stale by the time candidates are destroyed; the registry
    /// re-validates each one at destroy time.
    pub async fn stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        match self {
            Self::Postgres(db) => {
                let rows = sqlx::query_as::<_, (String, DateTime<Utc>, DateTime<Utc>)>(
                    "SELECT id, created_at, last_activity FROM chat_sessions \
                     WHERE last_activity < $1 ORDER BY last_activity",
                )
                .bind(cutoff)
                .fetch_all(db)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(id, created_at, last_activity)| SessionRecord {
                        id,
                        created_at,
                        last_activity,
                    })
                    .collect())
            }
            Self::Memory(store) => {
                let mut sessions: Vec<SessionRecord> = store
                    .read()
                    .await
                    .sessions
                    .values()
                    .filter(|s| s.last_activity < cutoff)
                    .cloned()
                    .collect();
                sessions.sort_by_key(|s| s.last_activity);
                Ok(sessions)
            }
        }
    }
}

fn participant_from_row(
    (id, session_id, connection_id, display_name, avatar_tag, joined_at, last_activity): (
        Uuid,
        String,
        Uuid,
        String,
        String,
        DateTime<Utc>,
        DateTime<Utc>,
    ),
) -> ParticipantRecord {
    ParticipantRecord {
        id,
        session_id,
        connection_id,
        display_name,
        avatar_tag,
        joined_at,
        last_activity,
    }
}
