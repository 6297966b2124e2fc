//! JSON messages exchanged with the inference backend.
//!
//! The client sends small single-key objects; the server replies with a
//! handshake, an error, or one classification result per processed frame.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use signstream_core::prediction::{LabelProb, Mode, Model, PredictionResult};

/// Messages sent from the client to the backend.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ClientMessage {
    /// One JPEG frame, base64 without a data-URL prefix.
    Frame { frame_b64: String },
    Mode { mode: Mode },
    Model { model: Model },
    /// Optional hint of the sign the learner is attempting.
    Target { target: Option<String> },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Messages received from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Sent once after the socket opens. Only logged.
    Hello(Value),
    /// In-band error report; the connection stays up.
    Error(String),
    Result(PredictionResult),
}

#[derive(Deserialize, Debug)]
struct WireResult {
    top: Option<String>,
    conf: Option<f32>,
    #[serde(default)]
    probs: Option<Vec<LabelProb>>,
    #[serde(default)]
    motion: Option<f32>,
    #[serde(default)]
    hand_conf: Option<f32>,
    #[serde(default)]
    n_features: Option<u32>,
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default)]
    model: Option<Model>,
}

/// Parses one inbound text frame.
///
/// `mode` and `model` are the client's current parameters; they fill in for
/// fields the server leaves out. A `mode` the server sends as `null` stays
/// `None`. Gesture labels are mapped to their names before the result is
/// returned.
pub fn decode(text: &str, mode: Mode, model: Model) -> Result<ServerMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(ProtocolError::NotAnObject);
    };

    if map.contains_key("hello") {
        return Ok(ServerMessage::Hello(value));
    }
    if let Some(error) = map.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(ServerMessage::Error(message));
    }
    for field in ["top", "conf"] {
        if !map.contains_key(field) {
            return Err(ProtocolError::MissingField(field));
        }
    }
    let mode_sent = map.contains_key("mode");

    let wire: WireResult =
        serde_json::from_value(value).map_err(|e| ProtocolError::BadResult(e.to_string()))?;
    let result = PredictionResult {
        top_label: wire.top,
        confidence: wire.conf,
        candidates: wire.probs.unwrap_or_default(),
        motion_score: wire.motion,
        hand_confidence: wire.hand_conf,
        feature_count: wire.n_features.unwrap_or(0),
        mode: if mode_sent { wire.mode } else { Some(mode) },
        model: wire.model.unwrap_or(model),
    };
    Ok(ServerMessage::Result(result.with_display_labels()))
}
