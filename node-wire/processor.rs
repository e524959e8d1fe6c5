use std::collections::HashMap;
use std::sync::Arc;

use crate::{Frame, WireError};

/// A pluggable codec identified by a one-byte id on the wire.
///
/// Only the `Frame` -> bytes <-> `Frame` direction is pluggable; the typed
/// argument/reply carried inside a frame is always plain `serde_json::Value`,
/// so adding a processor never requires changing handler signatures.
pub trait Processor: Send + Sync {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, WireError>;
    fn decode(&self, bytes: &[u8]) -> Result<Frame, WireError>;
}

/// The default processor: the frame, JSON-encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProcessor;

impl Processor for JsonProcessor {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(frame).map_err(WireError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

/// A processor for one-way calls that carry no meaningful payload: the body
/// is still the JSON frame, but it exists as a distinct id so a future
/// all-binary codec can be slotted in under id 0 without colliding with
/// [`JsonProcessor`]'s id.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawProcessor;

impl Processor for RawProcessor {
    fn id(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(frame).map_err(WireError::Encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

/// Looks processors up by the one-byte id read off the wire.
#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<u8, Arc<dyn Processor>>,
    default_id: u8,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            processors: HashMap::new(),
            default_id: JsonProcessor.id(),
        };
        registry.register(Arc::new(JsonProcessor));
        registry.register(Arc::new(RawProcessor));
        registry
    }
}

impl ProcessorRegistry {
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        self.processors.insert(processor.id(), processor);
    }

    pub fn default_processor(&self) -> Arc<dyn Processor> {
        self.processors[&self.default_id].clone()
    }

    pub fn get(&self, id: u8) -> Result<Arc<dyn Processor>, WireError> {
        self.processors
            .get(&id)
            .cloned()
            .ok_or(WireError::UnknownProcessor(id))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::RequestFrame;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Args {
        a: i64,
        b: i64,
    }

    #[test]
    fn json_round_trip() {
        let frame = Frame::Request(RequestFrame {
            seq: 42,
            service_method: "Math.Add".into(),
            no_reply: false,
            payload: serde_json::to_value(Args { a: 2, b: 3 }).unwrap(),
            addition: None,
        });

        let encoded = JsonProcessor.encode(&frame).unwrap();
        let decoded = JsonProcessor.decode(&encoded).unwrap();
        assert_eq!(decoded.seq(), 42);
    }

    #[test]
    fn registry_resolves_by_id() {
        let registry = ProcessorRegistry::default();
        assert_eq!(registry.get(1).unwrap().name(), "json");
        assert_eq!(registry.get(0).unwrap().name(), "raw");
        assert!(registry.get(99).is_err());
    }
}
