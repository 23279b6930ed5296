//! Binary frames exchanged with the message server: MessagePack maps of the
//! shape `{type, payload}`.

use crate::{Error, MessageType, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub client_message_id: String,
    pub sender_id: String,
    pub sender_device_id: u32,
    pub recipient_id: String,
    pub recipient_device_id: u32,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    pub message_type: MessageType,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
}

/// Backlog entry: a stored `SignalMessage` plus its server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub message_id: i64,
    /// Milliseconds since the UNIX epoch
    pub sent_at: i64,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub client_message_id: String,
    pub sender_id: String,
    pub sender_device_id: u32,
    pub recipient_id: String,
    pub recipient_device_id: u32,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    pub message_type: MessageType,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
}

impl SyncMessage {
    pub fn signal(&self) -> SignalMessage {
        SignalMessage {
            conversation_id: self.conversation_id.clone(),
            client_message_id: self.client_message_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_device_id: self.sender_device_id,
            recipient_id: self.recipient_id.clone(),
            recipient_device_id: self.recipient_device_id,
            content: self.content.clone(),
            message_type: self.message_type,
            attachment_url: self.attachment_url.clone(),
            reply_to_message_id: self.reply_to_message_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    SignalMessage(SignalMessage),
    Ping {},
    SyncRequest { last_message_id: Option<i64> },
    SyncResponse { messages: Vec<SyncMessage> },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::SignalMessage(_) => "SignalMessage",
            Frame::Ping {} => "Ping",
            Frame::SyncRequest { .. } => "SyncRequest",
            Frame::SyncResponse { .. } => "SyncResponse",
        }
    }
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Unknown types and malformed payloads both come back as
/// [`Error::FrameDecode`].
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::FrameDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> SignalMessage {
        SignalMessage {
            conversation_id: Some("c1".to_string()),
            client_message_id: "m1".to_string(),
            sender_id: "alice".to_string(),
            sender_device_id: 1,
            recipient_id: "bob".to_string(),
            recipient_device_id: 2,
            content: vec![0, 159, 146, 150],
            message_type: MessageType::PreKey,
            attachment_url: None,
            reply_to_message_id: None,
        }
    }

    #[test]
    fn frames_are_adjacently_tagged() {
        let bytes = encode(&Frame::SyncRequest {
            last_message_id: Some(42),
        })
        .unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "SyncRequest");
        assert_eq!(value["payload"]["last_message_id"], 42);

        let ping: serde_json::Value = rmp_serde::from_slice(&encode(&Frame::Ping {}).unwrap()).unwrap();
        assert_eq!(ping["type"], "Ping");
    }

    #[test]
    fn signal_message_survives_encoding() {
        let frame = Frame::SignalMessage(signal());
        assert_eq!(decode(&encode(&frame).unwrap()).unwrap(), frame);
    }

    #[test]
    fn sync_response_carries_server_ids() {
        let s = signal();
        let frame = Frame::SyncResponse {
            messages: vec![SyncMessage {
                message_id: 7,
                sent_at: 1_700_000_000_000,
                conversation_id: None,
                client_message_id: s.client_message_id.clone(),
                sender_id: s.sender_id.clone(),
                sender_device_id: s.sender_device_id,
                recipient_id: s.recipient_id.clone(),
                recipient_device_id: s.recipient_device_id,
                content: s.content.clone(),
                message_type: s.message_type,
                attachment_url: None,
                reply_to_message_id: None,
            }],
        };
        let Frame::SyncResponse { messages } = decode(&encode(&frame).unwrap()).unwrap() else {
            panic!("wrong frame");
        };
        assert_eq!(messages[0].message_id, 7);
        assert_eq!(messages[0].signal().content, s.content);
    }

    #[test]
    fn unknown_or_garbled_frames_fail_to_decode() {
        #[derive(Serialize)]
        struct Unknown {
            r#type: &'static str,
            payload: (),
        }
        let bytes = rmp_serde::to_vec_named(&Unknown {
            r#type: "Typing",
            payload: (),
        })
        .unwrap();

        assert!(matches!(decode(&bytes), Err(Error::FrameDecode(_))));
        assert!(matches!(decode(&[0xc1, 0x00]), Err(Error::FrameDecode(_))));
    }
}
