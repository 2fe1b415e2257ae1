use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

/// Identifier embedded in an outbound task and echoed by its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// A fresh UUID v4 identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Task,
    Response,
    Log,
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Task => write!(f, "task"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Log => write!(f, "log"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// A unit on the wire, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Task(TaskMessage),
    Response(ResponseMessage),
    Log(LogMessage),
    Event(EventMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub task: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseMessage {
    /// The `result` payload, or `Error::Remote` when the server reported an error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(Value::Null) | None => Ok(self.result.unwrap_or(Value::Null)),
            Some(Value::String(s)) => Err(Error::Remote(s)),
            Some(other) => Err(Error::Remote(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn task(id: CorrelationId, role: Option<&str>, task: Value) -> Self {
        Message::Task(TaskMessage {
            id,
            role: role.map(str::to_string),
            task,
            extra: Map::new(),
        })
    }

    pub fn response(id: CorrelationId, result: Value) -> Self {
        Message::Response(ResponseMessage {
            id,
            role: None,
            result: Some(result),
            error: None,
            extra: Map::new(),
        })
    }

    pub fn log(role: Option<&str>, level: &str, content: Value) -> Self {
        Message::Log(LogMessage {
            role: role.map(str::to_string),
            level: Some(level.to_string()),
            content,
            extra: Map::new(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Task(_) => MessageKind::Task,
            Message::Response(_) => MessageKind::Response,
            Message::Log(_) => MessageKind::Log,
            Message::Event(_) => MessageKind::Event,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            Message::Task(m) => m.role.as_deref(),
            Message::Response(m) => m.role.as_deref(),
            Message::Log(m) => m.role.as_deref(),
            Message::Event(m) => m.role.as_deref(),
        }
    }

    /// Only tasks and responses carry a correlation id.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Message::Task(m) => Some(&m.id),
            Message::Response(m) => Some(&m.id),
            Message::Log(_) | Message::Event(_) => None,
        }
    }

    /// Parse one wire frame. Unknown `type` tags and responses without an
    /// `id` are protocol errors.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Session identity announced once per connection, right after connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_response_keeps_extra_fields() {
        let msg = Message::decode(r#"{"type":"response","id":"x1","result":2,"elapsed":12}"#)
            .unwrap();
        match msg {
            Message::Response(r) => {
                assert_eq!(r.id.as_str(), "x1");
                assert_eq!(r.result, Some(json!(2)));
                assert_eq!(r.extra.get("elapsed"), Some(&json!(12)));
                assert!(!r.extra.contains_key("type"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_protocol_error() {
        let err = Message::decode(r#"{"type":"bogus","id":"1"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_decode_response_without_id_is_protocol_error() {
        let err = Message::decode(r#"{"type":"response","result":1}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_task_wire_shape() {
        let msg = Message::task("abc".into(), Some("system"), json!("do it"));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "task", "id": "abc", "role": "system", "task": "do it"}));
    }

    #[test]
    fn test_log_and_event_have_no_correlation_id() {
        let log = Message::log(None, "info", json!("hello"));
        assert_eq!(log.kind(), MessageKind::Log);
        assert!(log.correlation_id().is_none());

        let event = Message::decode(r#"{"type":"event","event":"ready"}"#).unwrap();
        assert_eq!(event.kind(), MessageKind::Event);
        assert!(event.correlation_id().is_none());
    }

    #[test]
    fn test_response_into_result() {
        let ok = ResponseMessage {
            id: "1".into(),
            role: None,
            result: Some(json!({"value": 2})),
            error: None,
            extra: Map::new(),
        };
        assert_eq!(ok.into_result().unwrap(), json!({"value": 2}));

        let failed = ResponseMessage {
            id: "2".into(),
            role: None,
            result: None,
            error: Some(json!("invalid base64")),
            extra: Map::new(),
        };
        match failed.into_result() {
            Err(Error::Remote(msg)) => assert_eq!(msg, "invalid base64"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_registration_is_camel_case() {
        let reg = AgentRegistration {
            agent_id: "a1".to_string(),
            agent_name: "runner".to_string(),
            agent_type: "browser".to_string(),
        };
        let value = serde_json::to_value(&reg).unwrap();
        assert_eq!(value, json!({"agentId": "a1", "agentName": "runner", "agentType": "browser"}));
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }
}
