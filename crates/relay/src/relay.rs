// Message & key relay: stateless pass-through of opaque payloads between
// group members.
//
// Payload bytes (ciphertext, IVs, wrapped keys, public keys) are never
// inspected, cached, or validated here; any cryptographic error is a
// client-side concern. Delivery to an already-disconnected recipient is
// silently dropped — this is a live-presence relay, not a message queue.

use std::sync::Arc;

use cinder_common::protocol::ws::WsMessage;
use tracing::debug;
use uuid::Uuid;

use crate::registry::{RegistryError, SessionRegistry};

#[derive(Clone)]
pub struct MessageRelay {
    registry: Arc<SessionRegistry>,
}

impl MessageRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward an encrypted message to everyone else in the group and
    /// refresh the session's activity.
    pub async fn relay_message(
        &self,
        session_id: &str,
        sender_connection_id: Uuid,
        ciphertext: String,
        iv: String,
        wrapped_keys: String,
    ) -> Result<(), RegistryError> {
        let delivered = self
            .registry
            .send_to_others(
                session_id,
                sender_connection_id,
                WsMessage::ReceiveMessage {
                    sender_connection_id,
                    ciphertext,
                    iv,
                    wrapped_keys,
                },
            )
            .await?;
        self.registry.touch(session_id).await;

        debug!(session_id = %session_id, delivered, "relayed message");
        Ok(())
    }

    /// Forward a transient typing signal. Deliberately does not refresh
    /// activity: typing alone must not keep an abandoned session alive.
    pub async fn relay_typing(
        &self,
        session_id: &str,
        sender_connection_id: Uuid,
    ) -> Result<(), RegistryError> {
        self.registry
            .send_to_others(
                session_id,
                sender_connection_id,
                WsMessage::UserTyping { sender_connection_id },
            )
            .await?;
        Ok(())
    }

    /// Forward a public key to everyone else, then ask the sender's own
    /// connection to re-broadcast existing keys so a late joiner can
    /// complete key exchange without the server storing any key material.
    pub async fn relay_public_key(
        &self,
        session_id: &str,
        sender_connection_id: Uuid,
        public_key: String,
    ) -> Result<(), RegistryError> {
        let delivered = self
            .registry
            .send_to_others(
                session_id,
                sender_connection_id,
                WsMessage::PublicKeyShared { sender_connection_id, public_key },
            )
            .await?;
        self.registry
            .send_to_member(
                session_id,
                sender_connection_id,
                WsMessage::RequestExistingPublicKeys { session_id: session_id.to_string() },
            )
            .await?;
        self.registry.touch(session_id).await;

        debug!(session_id = %session_id, delivered, "relayed public key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RandomIdentityProvider;
    use crate::registry::OutboundSender;
    use crate::store::SessionStore;
    use tokio::sync::mpsc;

    struct Harness {
        relay: MessageRelay,
        registry: Arc<SessionRegistry>,
        session_id: String,
        c1: Uuid,
        c2: Uuid,
        rx1: mpsc::UnboundedReceiver<WsMessage>,
        rx2: mpsc::UnboundedReceiver<WsMessage>,
    }

    fn channel() -> (OutboundSender, mpsc::UnboundedReceiver<WsMessage>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<WsMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn two_member_session() -> Harness {
        let registry = Arc::new(SessionRegistry::new(
            SessionStore::memory(),
            Arc::new(RandomIdentityProvider),
        ));
        let session = registry.create_session().await.unwrap();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.join(&session.id, c1, tx1).await.unwrap();
        registry.join(&session.id, c2, tx2).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        Harness {
            relay: MessageRelay::new(Arc::clone(&registry)),
            registry,
            session_id: session.id,
            c1,
            c2,
            rx1,
            rx2,
        }
    }

    #[tokio::test]
    async fn message_reaches_others_but_not_sender() {
        let mut h = two_member_session().await;

        h.relay
            .relay_message(&h.session_id, h.c1, "ct".into(), "iv".into(), "wk".into())
            .await
            .unwrap();

        assert_eq!(
            drain(&mut h.rx2),
            vec![WsMessage::ReceiveMessage {
                sender_connection_id: h.c1,
                ciphertext: "ct".into(),
                iv: "iv".into(),
                wrapped_keys: "wk".into(),
            }]
        );
        assert!(drain(&mut h.rx1).is_empty());
    }

    #[tokio::test]
    async fn message_payload_is_relayed_verbatim() {
        let mut h = two_member_session().await;
        let ciphertext = "bm90IHJlYWwgY2lwaGVydGV4dA==";
        let wrapped = r#"{"peer":"AAECAw=="}"#;

        h.relay
            .relay_message(&h.session_id, h.c2, ciphertext.into(), "AQI=".into(), wrapped.into())
            .await
            .unwrap();

        let received = drain(&mut h.rx1);
        match &received[0] {
            WsMessage::ReceiveMessage { ciphertext: ct, wrapped_keys: wk, .. } => {
                assert_eq!(ct, ciphertext);
                assert_eq!(wk, wrapped);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_touches_activity_but_typing_does_not() {
        let mut h = two_member_session().await;
        let before = h.registry.store().session(&h.session_id).await.unwrap().unwrap();

        h.relay.relay_typing(&h.session_id, h.c1).await.unwrap();
        let after_typing = h.registry.store().session(&h.session_id).await.unwrap().unwrap();
        assert_eq!(before.last_activity, after_typing.last_activity);

        h.relay
            .relay_message(&h.session_id, h.c1, "ct".into(), "iv".into(), "wk".into())
            .await
            .unwrap();
        let after_message = h.registry.store().session(&h.session_id).await.unwrap().unwrap();
        assert!(after_message.last_activity > before.last_activity);

        drain(&mut h.rx2);
    }

    #[tokio::test]
    async fn typing_signal_reaches_others_only() {
        let mut h = two_member_session().await;

        h.relay.relay_typing(&h.session_id, h.c2).await.unwrap();

        assert_eq!(
            drain(&mut h.rx1),
            vec![WsMessage::UserTyping { sender_connection_id: h.c2 }]
        );
        assert!(drain(&mut h.rx2).is_empty());
    }

    #[tokio::test]
    async fn public_key_share_asks_sender_for_existing_keys() {
        let mut h = two_member_session().await;
        let before = h.registry.store().session(&h.session_id).await.unwrap().unwrap();

        h.relay.relay_public_key(&h.session_id, h.c1, "pub1".into()).await.unwrap();

        assert_eq!(
            drain(&mut h.rx2),
            vec![WsMessage::PublicKeyShared {
                sender_connection_id: h.c1,
                public_key: "pub1".into(),
            }]
        );
        assert_eq!(
            drain(&mut h.rx1),
            vec![WsMessage::RequestExistingPublicKeys { session_id: h.session_id.clone() }]
        );

        let after = h.registry.store().session(&h.session_id).await.unwrap().unwrap();
        assert!(after.last_activity > before.last_activity, "key shares refresh activity");
    }

    #[tokio::test]
    async fn relay_into_unknown_session_fails() {
        let h = two_member_session().await;
        let error = h.relay.relay_typing("missing", h.c1).await.unwrap_err();
        assert!(matches!(error, RegistryError::SessionNotFound));
    }

    #[tokio::test]
    async fn delivery_to_dropped_recipient_is_swallowed() {
        let mut h = two_member_session().await;
        // Simulate a dead recipient without a disconnect event.
        drop(h.rx2);

        h.relay
            .relay_message(&h.session_id, h.c1, "ct".into(), "iv".into(), "wk".into())
            .await
            .expect("sender must not observe a recipient's failure");
        assert!(drain(&mut h.rx1).is_empty());
    }
}
