use axum::extract::ws::{Message, WebSocket};
use cinder_common::protocol::ws::WsMessage;

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(decode_message("not json").is_err());
        assert!(decode_message("{}").is_err());
    }

    #[test]
    fn encode_then_decode_preserves_message() {
        let message = WsMessage::NotifyTyping { session_id: "abc".to_string() };
        let raw = encode_message(&message).expect("message should encode");
        assert_eq!(decode_message(&raw).expect("message should decode"), message);
    }
}
