//! # Actions
//!
//! The unit of communication on every channel: a JSON-shaped record with a
//! `type` discriminator, an optional correlation id and arbitrary fields,
//! travelling together with a list of transferable resources.
//!
//! ## Invariants
//!
//! - Responses reuse the id of the request they answer.
//! - A `Transferable` is taken out of its `TransferList` at most once.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::transport::Port;

/// Correlates a response with its request. Scoped to one controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ActionId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            fields: Map::new(),
        }
    }

    pub fn with_id(mut self, id: ActionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Builds an action from a `#[serde(tag = "type")]` enum value.
    pub fn from_typed<T: Serialize>(typed: &T) -> Result<Self> {
        match serde_json::to_value(typed)? {
            Value::Object(mut fields) => {
                let kind = match fields.remove("type") {
                    Some(Value::String(kind)) => kind,
                    _ => return Err(Error::unexpected("typed action has no string \"type\" tag")),
                };
                Ok(Self {
                    kind,
                    id: None,
                    fields,
                })
            }
            other => Err(Error::unexpected(format!(
                "typed action must serialize to an object, got {}",
                other
            ))),
        }
    }

    /// Decodes `type` and fields (never the id) into a tagged enum.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

/// A resource that moves with a packet instead of being copied into it.
#[derive(Debug)]
pub enum Transferable {
    Port(Port),
    Buffer(Vec<u8>),
}

/// Shared slots of transferables referenced by index from action fields.
#[derive(Clone, Default)]
pub struct TransferList {
    slots: Arc<Mutex<Vec<Option<Transferable>>>>,
}

impl TransferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transferable and returns the index to reference it by.
    pub fn push(&self, item: Transferable) -> usize {
        let mut slots = self.slots.lock();
        slots.push(Some(item));
        slots.len() - 1
    }

    pub fn take(&self, index: usize) -> Option<Transferable> {
        self.slots.lock().get_mut(index).and_then(Option::take)
    }

    pub fn take_port(&self, index: usize) -> Result<Port> {
        match self.take(index) {
            Some(Transferable::Port(port)) => Ok(port),
            Some(other) => {
                let kind = kind_of(&other);
                self.slots.lock()[index] = Some(other);
                Err(Error::data_transfer(format!(
                    "transfer slot {} holds a {}, expected a port",
                    index, kind
                )))
            }
            None => Err(Error::data_transfer(format!(
                "transfer slot {} is empty or already taken",
                index
            ))),
        }
    }

    pub fn take_buffer(&self, index: usize) -> Result<Vec<u8>> {
        match self.take(index) {
            Some(Transferable::Buffer(bytes)) => Ok(bytes),
            Some(other) => {
                let kind = kind_of(&other);
                self.slots.lock()[index] = Some(other);
                Err(Error::data_transfer(format!(
                    "transfer slot {} holds a {}, expected a buffer",
                    index, kind
                )))
            }
            None => Err(Error::data_transfer(format!(
                "transfer slot {} is empty or already taken",
                index
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl fmt::Debug for TransferList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferList")
            .field("slots", &self.len())
            .finish()
    }
}

fn kind_of(item: &Transferable) -> &'static str {
    match item {
        Transferable::Port(_) => "port",
        Transferable::Buffer(_) => "buffer",
    }
}

/// What actually crosses a transport.
#[derive(Clone, Debug)]
pub struct Packet {
    pub action: Action,
    pub transfer: TransferList,
}

impl Packet {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            transfer: TransferList::new(),
        }
    }

    pub fn with_transfer(action: Action, transfer: TransferList) -> Self {
        Self { action, transfer }
    }
}
