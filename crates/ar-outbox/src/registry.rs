//! Event decode registry.
//!
//! An explicit name-to-decoder map built at process start. The dispatch
//! worker resolves each row's `type` discriminator here; an unknown name or
//! a payload that fails to decode marks the row terminal immediately.

use ar_common::{AuthRelayError, Result};
use std::collections::HashMap;

pub type DecodeFn<E> = fn(&str) -> serde_json::Result<E>;

pub struct EventRegistry<E> {
    decoders: HashMap<&'static str, DecodeFn<E>>,
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, event_type: &'static str, decode: DecodeFn<E>) {
        self.decoders.insert(event_type, decode);
    }

    pub fn decode(&self, event_type: &str, content: &str) -> Result<E> {
        let decode = self
            .decoders
            .get(event_type)
            .ok_or_else(|| AuthRelayError::UnknownEventType(event_type.to_string()))?;
        decode(content).map_err(AuthRelayError::from)
    }

    pub fn known_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
