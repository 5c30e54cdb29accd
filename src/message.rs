use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Payload;

/// A message travelling along wires.
///
/// Beyond the payload and optional topic, nodes can attach arbitrary extra
/// fields; downstream nodes that do not know about a field pass it through
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    payload: Payload,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extra: BTreeMap<String, Payload>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: None,
            payload,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn set_topic(&mut self, topic: Option<String>) {
        self.topic = topic;
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn get(&self, name: &str) -> Option<&Payload> {
        self.extra.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Payload) {
        self.extra.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Payload> {
        self.extra.remove(name)
    }

    /// Value-equal, reference-distinct copy.
    ///
    /// The id is kept so completion tracking can correlate the branches.
    /// Handle-valued fields pass through by reference rather than being
    /// deep-copied; everything else is.
    pub fn duplicate(&self) -> Message {
        Message {
            id: self.id.clone(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            extra: self
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Handle;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(Payload::from_json(json!({"key": "value"})));
        assert!(!msg.id().is_empty());
        assert_eq!(msg.payload(), &Payload::from_json(json!({"key": "value"})));
        assert!(msg.topic().is_none());
    }

    #[test]
    fn test_extra_fields() {
        let mut msg = Message::new(Payload::Null);
        msg.set("meta", Payload::String("x".into()));
        assert_eq!(msg.get("meta"), Some(&Payload::String("x".into())));
        msg.remove("meta");
        assert!(msg.get("meta").is_none());
    }

    #[test]
    fn test_duplicate_is_value_equal() {
        let mut msg = Message::new(Payload::Bytes(vec![1, 2, 3])).with_topic("t");
        msg.set("n", Payload::Number(1.0));

        let copy = msg.duplicate();
        assert_eq!(msg, copy);
        assert_eq!(copy.id(), msg.id());

        // byte buffers are separate allocations after duplication
        let a = msg.payload().as_bytes().unwrap().as_ptr();
        let b = copy.payload().as_bytes().unwrap().as_ptr();
        assert_ne!(a, b);
    }

    #[test]
    fn test_duplicate_keeps_handles_by_reference() {
        let handle = Handle::new(42u32);
        let mut msg = Message::new(Payload::Null);
        msg.set("conn", Payload::Handle(handle.clone()));

        let copy = msg.duplicate();
        let Some(Payload::Handle(copied)) = copy.get("conn") else {
            panic!("handle missing");
        };
        assert!(copied.same(&handle));
    }
}
