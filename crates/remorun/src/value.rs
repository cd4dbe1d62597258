use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::environment::ResolvedRunner;
use crate::error::Error;
use crate::error::Result;
use crate::runner::LocalRunner;

/// Anything that can be passed to or returned from a runner method.
///
/// Plain data travels as JSON. Collections are walked element by element so
/// runner references nested inside them are transferred properly.
#[derive(Clone)]
pub enum RunnerValue {
    Json(Value),
    Array(Vec<RunnerValue>),
    Object(BTreeMap<String, RunnerValue>),
    /// Moved through the transfer list instead of being serialized.
    Buffer(Vec<u8>),
    /// A proxy to a runner living elsewhere.
    Runner(ResolvedRunner),
    /// A runner living here, exposed by reference.
    Local(LocalRunner),
}

impl RunnerValue {
    pub fn null() -> Self {
        Self::Json(Value::Null)
    }

    pub fn json(value: impl Serialize) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Deserializes a plain-data value.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Json(value) => Ok(serde_json::from_value(value)?),
            other => Err(Error::data_transfer(format!(
                "expected plain data, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn into_runner(self) -> Option<ResolvedRunner> {
        match self {
            Self::Runner(runner) => Some(runner),
            _ => None,
        }
    }

    pub fn as_runner(&self) -> Option<&ResolvedRunner> {
        match self {
            Self::Runner(runner) => Some(runner),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Buffer(_) => "buffer",
            Self::Runner(_) => "runner",
            Self::Local(_) => "local runner",
        }
    }
}

impl fmt::Debug for RunnerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
            Self::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Self::Runner(runner) => write!(f, "Runner({})", runner.token()),
            Self::Local(local) => write!(f, "Local({})", local.definition().token()),
        }
    }
}

impl From<Value> for RunnerValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<RunnerValue>> for RunnerValue {
    fn from(items: Vec<RunnerValue>) -> Self {
        Self::Array(items)
    }
}

impl From<ResolvedRunner> for RunnerValue {
    fn from(runner: ResolvedRunner) -> Self {
        Self::Runner(runner)
    }
}

impl From<LocalRunner> for RunnerValue {
    fn from(local: LocalRunner) -> Self {
        Self::Local(local)
    }
}
