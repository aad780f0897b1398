use crate::step::Step;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub const KEY_VALUE: &str = "value";
pub const KEY_STATUS: &str = "status";
pub const KEY_TEXT: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Value,
    Result,
    Control,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Value => write!(f, "VALUE"),
            MessageKind::Result => write!(f, "RESULT"),
            MessageKind::Control => write!(f, "CONTROL"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message field `{0}` is missing or has the wrong type")]
    Field(&'static str),
    #[error("message step `{step}` cannot be read: {reason}")]
    Step { step: String, reason: String },
}

/// Typed envelope moved between mailboxes. `tag` is the only routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub tag: String,
    pub step: Option<Step>,
    pub data: Map<String, Value>,
}

impl Message {
    pub fn new(kind: MessageKind, tag: impl Into<String>, step: Option<Step>) -> Self {
        Self {
            kind,
            tag: tag.into(),
            step,
            data: Map::new(),
        }
    }

    /// VALUE message; non-finite values travel as `null` (missing).
    pub fn value(tag: impl Into<String>, step: Step, value: f64) -> Self {
        let mut msg = Self::new(MessageKind::Value, tag, Some(step));
        msg.data.insert(KEY_VALUE.into(), finite_or_null(value));
        msg
    }

    pub fn result(tag: impl Into<String>, step: Step, data: Map<String, Value>) -> Self {
        Self {
            kind: MessageKind::Result,
            tag: tag.into(),
            step: Some(step),
            data,
        }
    }

    pub fn control(tag: impl Into<String>, step: Option<Step>, status: i32, text: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Control, tag, step);
        msg.data.insert(KEY_STATUS.into(), json!(status));
        msg.data.insert(KEY_TEXT.into(), Value::String(text.into()));
        msg
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Numeric payload of a VALUE message; `None` means missing.
    pub fn number(&self) -> Option<f64> {
        self.data.get(KEY_VALUE).and_then(Value::as_f64)
    }

    #[inline]
    pub fn step_index(&self) -> Option<i64> {
        self.step.as_ref().map(Step::index)
    }

    /// Total order by step; step-less messages sort first.
    pub fn cmp_step(&self, other: &Message) -> Ordering {
        match (&self.step, &other.step) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": self.kind,
            "tag": self.tag,
            "step": self.step.as_ref().map(|s| s.to_string()),
            "data": self.data,
        })
    }

    /// Decodes the bridge encoding. The textual step is re-read on `axis`;
    /// without an axis the message is accepted only if it carries no step.
    pub fn from_json(text: &str, axis: Option<&Step>) -> Result<Message, DecodeError> {
        let raw: Value = serde_json::from_str(text)?;
        let kind: MessageKind = serde_json::from_value(
            raw.get("type").cloned().ok_or(DecodeError::Field("type"))?,
        )?;
        let tag = raw
            .get("tag")
            .and_then(Value::as_str)
            .ok_or(DecodeError::Field("tag"))?
            .to_string();
        let data = match raw.get("data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(DecodeError::Field("data")),
        };
        let step = match raw.get("step") {
            None | Some(Value::Null) => None,
            Some(step) => {
                let text = match step {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return Err(DecodeError::Field("step")),
                };
                let axis = axis.ok_or_else(|| DecodeError::Step {
                    step: text.clone(),
                    reason: "receiver has no step axis".into(),
                })?;
                Some(
                    axis.parse_on_axis(&text)
                        .map_err(|reason| DecodeError::Step { step: text, reason })?,
                )
            }
        };
        Ok(Message {
            kind,
            tag,
            step,
            data,
        })
    }
}

pub(crate) fn finite_or_null(v: f64) -> Value {
    if v.is_finite() { json!(v) } else { Value::Null }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bridge_rereads_step_on_axis() {
        let axis = Step::integer(0, 10);
        let msg = Message::value("PH_1", axis.at_index(4), 7.1);
        let text = msg.to_json().to_string();
        let back = Message::from_json(&text, Some(&axis)).unwrap();
        assert_eq!(back.kind, MessageKind::Value);
        assert_eq!(back.step_index(), Some(4));
        assert_eq!(back.number(), Some(7.1));
    }

    #[test]
    fn non_finite_values_are_missing() {
        let msg = Message::value("CL_1", Step::integer(0, 1), f64::NAN);
        assert_eq!(msg.data.get(KEY_VALUE), Some(&Value::Null));
        assert_eq!(msg.number(), None);
    }

    #[test]
    fn stepless_messages_sort_first() {
        let axis = Step::integer(0, 1);
        let a = Message::control("x", None, 1, "boom");
        let b = Message::value("x", axis.at_index(0), 1.0);
        assert_eq!(a.cmp_step(&b), Ordering::Less);
    }

    #[test]
    fn decode_rejects_step_without_axis() {
        let err = Message::from_json(r#"{"type":"VALUE","tag":"a","step":"3","data":{}}"#, None)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Step { .. }));
    }
}
