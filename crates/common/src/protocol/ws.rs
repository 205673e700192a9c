// WebSocket message types for the cinder-chat.v1 protocol.
//
// Every payload field carried on behalf of clients (ciphertext, IVs,
// wrapped keys, public keys) is an opaque string: the relay forwards it
// unchanged and never inspects or validates its content.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All message types in the cinder-chat.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: join an existing session on this connection.
    JoinSession {
        session_id: String,
    },

    /// Client -> Server: relay an encrypted message to the rest of the group.
    SendMessage {
        session_id: String,
        ciphertext: String,
        iv: String,
        wrapped_keys: String,
    },

    /// Client -> Server: transient typing signal for the rest of the group.
    NotifyTyping {
        session_id: String,
    },

    /// Client -> Server: share a public key with the rest of the group.
    SharePublicKey {
        session_id: String,
        public_key: String,
    },

    /// Client -> Server: tear down the session for everyone.
    DestroySession {
        session_id: String,
    },

    /// Server -> Client: join acknowledgement carrying the caller's
    /// freshly assigned anonymous identity.
    SessionJoined {
        session_id: String,
        participant_id: Uuid,
        display_name: String,
        avatar_tag: String,
    },

    /// Server -> Client: another connection joined the session.
    ParticipantJoined {
        connection_id: Uuid,
    },

    /// Server -> Client: a connection left the session.
    ParticipantLeft {
        connection_id: Uuid,
    },

    /// Server -> Client: the session no longer exists.
    SessionDestroyed,

    /// Server -> Client: an encrypted message from another participant.
    ReceiveMessage {
        sender_connection_id: Uuid,
        ciphertext: String,
        iv: String,
        wrapped_keys: String,
    },

    /// Server -> Client: another participant is typing.
    UserTyping {
        sender_connection_id: Uuid,
    },

    /// Server -> Client: another participant shared a public key.
    PublicKeyShared {
        sender_connection_id: Uuid,
        public_key: String,
    },

    /// Server -> Client: re-broadcast your existing key material so a
    /// late joiner can complete key exchange. Sent only to the sender of
    /// a just-shared key.
    RequestExistingPublicKeys {
        session_id: String,
    },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}
