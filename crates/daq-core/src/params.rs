//! Parameter and control messages exchanged with the controller.
//!
//! A [`ParamMessage`] is a tree of named values. Keys are `/`-separated paths,
//! so a decoder setting reads as `decoder_config/frame_timeout_ms` and a stage
//! status as `compress/frames_processed`. Components read the keys they know,
//! ignore the rest, and leave a setting unchanged when its key is absent.
//!
//! A [`ControlMessage`] wraps parameters with a message type, a verb, an id and
//! a timestamp, and is encoded as JSON on the control channel.

use crate::error::{DaqError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Join a prefix and a key with `/`, skipping an empty prefix.
#[must_use]
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Tree of named parameter values addressed by `/`-separated paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMessage {
    root: Map<String, Value>,
}

impl ParamMessage {
    /// Empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON object. Anything other than an object is malformed.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            other => Err(DaqError::MalformedMessage(format!(
                "parameters must be an object, got {other}"
            ))),
        }
    }

    /// The underlying JSON object.
    #[must_use]
    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// True if no parameters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Set `path` to `value`, creating intermediate objects.
    ///
    /// An existing non-object value on the way is replaced by an object.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        let mut node = &mut self.root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.insert(part.to_string(), value.into());
                return;
            }
            let child = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            node = match child {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    /// Look up `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut value = self.root.get(first)?;
        for part in parts {
            value = value.as_object()?.get(part)?;
        }
        Some(value)
    }

    /// True if `path` is set.
    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Sub-tree under `path` as its own message, if it is an object.
    #[must_use]
    pub fn subtree(&self, path: &str) -> Option<ParamMessage> {
        match self.get(path)? {
            Value::Object(map) => Some(Self { root: map.clone() }),
            _ => None,
        }
    }

    /// Unsigned integer at `path`; `Ok(None)` if absent, error if mistyped.
    pub fn get_u64(&self, path: &str) -> Result<Option<u64>> {
        match self.get(path) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                DaqError::malformed_parameter(path, format!("expected unsigned integer, got {value}"))
            }),
        }
    }

    /// Boolean at `path`. Integers 0/1 are accepted.
    pub fn get_bool(&self, path: &str) -> Result<Option<bool>> {
        match self.get(path) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(value) => match value.as_u64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(DaqError::malformed_parameter(
                    path,
                    format!("expected boolean, got {value}"),
                )),
            },
        }
    }

    /// String at `path`.
    pub fn get_str(&self, path: &str) -> Result<Option<&str>> {
        match self.get(path) {
            None => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| {
                DaqError::malformed_parameter(path, format!("expected string, got {value}"))
            }),
        }
    }

    /// Copy every leaf of `other` into this message, overwriting on conflict.
    pub fn merge(&mut self, other: &ParamMessage) {
        fn merge_into(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
            for (key, value) in src {
                match (dst.get_mut(key), value) {
                    (Some(Value::Object(d)), Value::Object(s)) => merge_into(d, s),
                    _ => {
                        dst.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        merge_into(&mut self.root, &other.root);
    }
}

/// Control message category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Request from the controller
    Cmd,
    /// Successful reply
    Ack,
    /// Failed reply; `params.error` holds the reason
    Nack,
    /// Unsolicited notification
    Notify,
}

/// Control message verbs understood by receivers and pipelines.
pub mod verbs {
    /// Apply the attached parameters.
    pub const CONFIGURE: &str = "configure";
    /// Report current settings.
    pub const REQUEST_CONFIGURATION: &str = "request_configuration";
    /// Report counters.
    pub const STATUS: &str = "status";
    /// Stop and release resources.
    pub const SHUTDOWN: &str = "shutdown";
    /// Close the current acquisition in every sink.
    pub const END_OF_ACQUISITION: &str = "end_of_acquisition";
}

/// Envelope for parameters on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Category
    pub msg_type: MessageType,
    /// Verb, e.g. `configure`
    pub msg_val: String,
    /// Correlates replies with requests
    pub id: u64,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Payload
    #[serde(default)]
    pub params: ParamMessage,
}

impl ControlMessage {
    /// New command with empty parameters.
    pub fn command(msg_val: impl Into<String>, id: u64) -> Self {
        Self {
            msg_type: MessageType::Cmd,
            msg_val: msg_val.into(),
            id,
            timestamp: Utc::now(),
            params: ParamMessage::new(),
        }
    }

    /// Positive reply to this message carrying `params`.
    #[must_use]
    pub fn ack(&self, params: ParamMessage) -> Self {
        Self {
            msg_type: MessageType::Ack,
            msg_val: self.msg_val.clone(),
            id: self.id,
            timestamp: Utc::now(),
            params,
        }
    }

    /// Negative reply to this message.
    #[must_use]
    pub fn nack(&self, reason: &str) -> Self {
        let mut params = ParamMessage::new();
        params.set("error", reason);
        Self {
            msg_type: MessageType::Nack,
            msg_val: self.msg_val.clone(),
            id: self.id,
            timestamp: Utc::now(),
            params,
        }
    }

    /// Encode as a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON. Any parse failure is `MalformedMessage`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DaqError::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get_nested_paths() {
        let mut msg = ParamMessage::new();
        msg.set("decoder_config/frame_timeout_ms", 250);
        msg.set("decoder_config/enable_packet_logging", true);

        assert_eq!(msg.get_u64("decoder_config/frame_timeout_ms").unwrap(), Some(250));
        assert_eq!(
            msg.get_bool("decoder_config/enable_packet_logging").unwrap(),
            Some(true)
        );
        assert_eq!(
            msg.as_value(),
            json!({"decoder_config": {"frame_timeout_ms": 250, "enable_packet_logging": true}})
        );
    }

    #[test]
    fn test_missing_key_is_none() {
        let msg = ParamMessage::new();
        assert_eq!(msg.get_u64("a/b").unwrap(), None);
        assert!(!msg.has("a"));
    }

    #[test]
    fn test_wrong_type_is_malformed_parameter() {
        let mut msg = ParamMessage::new();
        msg.set("frame_timeout_ms", "soon");
        let err = msg.get_u64("frame_timeout_ms").unwrap_err();
        assert!(matches!(err, DaqError::MalformedParameter { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bool_accepts_zero_one() {
        let mut msg = ParamMessage::new();
        msg.set("shuffle", 1);
        assert_eq!(msg.get_bool("shuffle").unwrap(), Some(true));
        msg.set("shuffle", 2);
        assert!(msg.get_bool("shuffle").is_err());
    }

    #[test]
    fn test_merge_and_subtree() {
        let mut a = ParamMessage::new();
        a.set("compress/level", 1);
        a.set("compress/shuffle", false);
        let mut b = ParamMessage::new();
        b.set("compress/level", 5);
        a.merge(&b);

        let sub = a.subtree("compress").unwrap();
        assert_eq!(sub.get_u64("level").unwrap(), Some(5));
        assert_eq!(sub.get_bool("shuffle").unwrap(), Some(false));
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a"), "a");
        assert_eq!(join_key("stage/", "a"), "stage/a");
        assert_eq!(join_key("stage", "a"), "stage/a");
    }

    #[test]
    fn test_control_message_json() {
        let mut msg = ControlMessage::command(verbs::CONFIGURE, 7);
        msg.params.set("decoder_config/frame_timeout_ms", 500);

        let text = msg.to_json().unwrap();
        assert!(text.contains("\"msg_type\":\"cmd\""));
        let decoded = ControlMessage::from_json(&text).unwrap();
        assert_eq!(decoded, msg);

        let nack = decoded.nack("bad key");
        assert_eq!(nack.msg_type, MessageType::Nack);
        assert_eq!(nack.id, 7);
        assert_eq!(nack.params.get_str("error").unwrap(), Some("bad key"));
    }

    #[test]
    fn test_malformed_json() {
        let err = ControlMessage::from_json("{not json").unwrap_err();
        assert!(matches!(err, DaqError::MalformedMessage(_)));
    }
}
