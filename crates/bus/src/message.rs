use std::borrow::Cow;

use serde::de::DeserializeOwned;
use serde::Serialize;
use zeromq::ZmqMessage;

use crate::error::BusError;

/// Wire-format message for the data-source bus.
///
/// A message travels as two ZeroMQ frames:
/// 1. Topic string (used by SUB sockets for prefix filtering)
/// 2. JSON payload bytes
///
/// The payload frame is plain JSON so that peers in other languages can
/// publish commands and read progress without knowing anything about Rust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Routing topic (e.g. `datasource_commands_10.0.0.4`, `response_<hex>`).
    pub topic: String,

    /// JSON-encoded payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message, serializing the payload as JSON.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Create a message from pre-encoded payload bytes.
    ///
    /// Nothing checks that the bytes are valid JSON; receivers must cope.
    pub fn raw(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Lossy UTF-8 view of the payload, for log lines.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Build the two-frame ZMQ message: `[topic, payload]`.
    pub fn to_zmq(&self) -> ZmqMessage {
        let mut zmq_msg = ZmqMessage::from(self.topic.as_str());
        zmq_msg.push_back(self.payload.clone().into());
        zmq_msg
    }

    /// Parse a `[topic, payload]` ZMQ message.
    pub fn from_zmq(zmq_msg: &ZmqMessage) -> Result<Self, BusError> {
        let frames: Vec<_> = zmq_msg.iter().collect();
        match frames.as_slice() {
            [topic, payload, ..] => Ok(Self {
                topic: String::from_utf8_lossy(topic.as_ref()).into_owned(),
                payload: payload.to_vec(),
            }),
            [_] => Err(BusError::Transport("message is missing its payload frame".into())),
            [] => Err(BusError::Transport("empty ZMQ message".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn payload_is_plain_json() {
        let msg = Message::new("response_abc", &Ping { seq: 7 }).unwrap();
        assert_eq!(msg.topic, "response_abc");
        assert_eq!(msg.payload, br#"{"seq":7}"#);
        assert_eq!(msg.decode::<Ping>().unwrap(), Ping { seq: 7 });
    }

    #[test]
    fn zmq_frames_are_topic_then_payload() {
        let msg = Message::raw("datasource_progress", br#"{"pid":1}"#.to_vec());
        let zmq_msg = msg.to_zmq();

        let frames: Vec<_> = zmq_msg.iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), b"datasource_progress");
        assert_eq!(frames[1].as_ref(), br#"{"pid":1}"#);

        assert_eq!(Message::from_zmq(&zmq_msg).unwrap(), msg);
    }

    #[test]
    fn single_frame_is_rejected() {
        let zmq_msg = ZmqMessage::from("only-a-topic");
        let err = Message::from_zmq(&zmq_msg).unwrap_err();
        assert!(err.to_string().contains("payload frame"));
    }

    #[test]
    fn garbage_payload_fails_decode_but_not_construction() {
        let msg = Message::raw("datasource_commands_127.0.0.1", b"not json".to_vec());
        assert!(msg.decode::<Ping>().is_err());
        assert_eq!(msg.payload_lossy(), "not json");
    }
}
