//
// wire_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use bytes::Bytes;
use jkshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};
use zeromq::ZmqMessage;

use crate::error::KMError;
use crate::session::Signer;

/// The token separating routing identities from the signed message body
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Serialize the header, parent header, metadata and content of a message
/// into its four JSON frames. Missing values are rendered as `{}`.
pub fn serialize_frames(msg: &JupyterMessage) -> Result<[Vec<u8>; 4], KMError> {
    let header = serde_json::to_vec(&msg.header)?;
    let parent_header = match &msg.parent_header {
        Some(parent) => serde_json::to_vec(parent)?,
        None => empty_object(),
    };
    Ok([
        header,
        parent_header,
        json_or_empty(&msg.metadata)?,
        json_or_empty(&msg.content)?,
    ])
}

fn empty_object() -> Vec<u8> {
    b"{}".to_vec()
}

fn json_or_empty(value: &serde_json::Value) -> Result<Vec<u8>, KMError> {
    if value.is_null() {
        return Ok(empty_object());
    }
    Ok(serde_json::to_vec(value)?)
}

/// A message as it appears on a ZeroMQ socket: a list of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// The parts of the message, as an array of byte arrays
    pub parts: Vec<Vec<u8>>,
}

impl WireMessage {
    /// Frame and sign a Jupyter message.
    ///
    /// The frames are: routing identities, the delimiter, the hex signature,
    /// then header, parent header, metadata and content.
    pub fn from_jupyter(msg: &JupyterMessage, signer: &Signer) -> Result<Self, KMError> {
        let frames = serialize_frames(msg)?;
        let signature = signer.sign(&frames);

        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(msg.identities.len() + 6);
        parts.extend(msg.identities.iter().cloned());
        parts.push(DELIMITER.to_vec());
        parts.push(signature.into_bytes());
        parts.extend(frames);

        Ok(WireMessage { parts })
    }

    /// Parse and verify the frames into a Jupyter message.
    ///
    /// Frames past the content are raw data buffers, which are ignored.
    pub fn to_jupyter(&self, signer: &Signer) -> Result<JupyterMessage, KMError> {
        let delimiter = self
            .parts
            .iter()
            .position(|part| part.as_slice() == DELIMITER)
            .ok_or_else(|| {
                KMError::ProtocolViolation(String::from("message has no <IDS|MSG> delimiter"))
            })?;

        let body = &self.parts[delimiter + 1..];
        if body.len() < 5 {
            return Err(KMError::ProtocolViolation(format!(
                "expected a signature and 4 message frames after the delimiter, got {} frames",
                body.len()
            )));
        }
        let signature = &body[0];
        let frames = &body[1..5];

        let header: JupyterMessageHeader = serde_json::from_slice(&frames[0]).map_err(|err| {
            KMError::ProtocolViolation(format!("invalid message header: {}", err))
        })?;

        if !signer.verify(frames, signature) {
            return Err(KMError::SignatureMismatch(header.msg_type));
        }

        let parent_header = parse_parent_header(&frames[1])?;
        let metadata: serde_json::Value = serde_json::from_slice(&frames[2])?;
        let content: serde_json::Value = serde_json::from_slice(&frames[3])?;

        Ok(JupyterMessage {
            header,
            parent_header,
            metadata,
            content,
            identities: self.parts[..delimiter].to_vec(),
            signature: Some(signature.clone()),
        })
    }
}

/// An empty parent header (`{}`) means the message is not a reply.
fn parse_parent_header(frame: &[u8]) -> Result<Option<JupyterMessageHeader>, KMError> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    match &value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => Ok(None),
        _ => serde_json::from_value(value).map(Some).map_err(|err| {
            KMError::ProtocolViolation(format!("invalid parent header: {}", err))
        }),
    }
}

impl From<ZmqMessage> for WireMessage {
    fn from(msg: ZmqMessage) -> Self {
        WireMessage {
            parts: msg.into_vec().into_iter().map(|b| b.to_vec()).collect(),
        }
    }
}

impl TryFrom<WireMessage> for ZmqMessage {
    type Error = KMError;

    fn try_from(msg: WireMessage) -> Result<Self, Self::Error> {
        let frames: Vec<Bytes> = msg.parts.into_iter().map(Bytes::from).collect();
        ZmqMessage::try_from(frames)
            .map_err(|err| KMError::ProtocolViolation(format!("cannot send message: {}", err)))
    }
}
