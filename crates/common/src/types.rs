// Core domain types shared across the Cinder crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ephemeral chat session.
///
/// The id is an opaque, URL-safe string; possession of it is the sole
/// access control for the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Monotonically non-decreasing; refreshed by joins, messages, and
    /// key shares, but never by typing signals.
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    /// A fresh session with `created_at == last_activity == now`.
    pub fn new(id: String, now: DateTime<Utc>) -> Self {
        Self { id, created_at: now, last_activity: now }
    }
}

/// One live connection's membership record within a session.
///
/// A participant is not a durable identity: it exists only while its
/// transport connection is alive and is deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub id: Uuid,
    pub session_id: String,
    /// Current live transport identifier; unique among active participants.
    pub connection_id: Uuid,
    /// Randomly assigned at join time, immutable thereafter.
    pub display_name: String,
    /// Avatar seed in `{color}-{shape}-{bgcolor}` form, assigned with the name.
    pub avatar_tag: String,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_with_equal_timestamps() {
        let now = Utc::now();
        let session = SessionRecord::new("abc123".to_string(), now);
        assert_eq!(session.created_at, session.last_activity);
        assert_eq!(session.id, "abc123");
    }

    #[test]
    fn session_record_roundtrips_through_json() {
        let now = Utc::now();
        let session = SessionRecord::new("deadbeef".to_string(), now);
        let encoded = serde_json::to_string(&session).expect("session should serialize");
        let decoded: SessionRecord =
            serde_json::from_str(&encoded).expect("session should deserialize");
        assert_eq!(session, decoded);
    }

    #[test]
    fn participant_record_roundtrips_through_json() {
        let now = Utc::now();
        let participant = ParticipantRecord {
            id: Uuid::new_v4(),
            session_id: "deadbeef".to_string(),
            connection_id: Uuid::new_v4(),
            display_name: "BraveFox".to_string(),
            avatar_tag: "teal-3-gold".to_string(),
            joined_at: now,
            last_activity: now,
        };
        let encoded = serde_json::to_string(&participant).expect("participant should serialize");
        let decoded: ParticipantRecord =
            serde_json::from_str(&encoded).expect("participant should deserialize");
        assert_eq!(participant, decoded);
    }
}
