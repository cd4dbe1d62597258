//! # Connect Protocol
//!
//! Lifecycle of a single link between a runner proxy (client) and a runner
//! instance (host), plus a generic request slot (`CUSTOM`) the environment
//! layer rides on.
//!
//! | Request               | Response(s)                                   |
//! |-----------------------|-----------------------------------------------|
//! | `CONNECT`             | none                                          |
//! | `INTERRUPT_LISTENING` | `LISTENING_INTERRUPTED`                       |
//! | `DISCONNECT`          | `DISCONNECTED`                                |
//! | `DESTROY`             | `DESTROYED_BY_REQUEST`, `DESTROYED_WITH_ERROR`|
//! | `CUSTOM`              | `CUSTOM_RESPONSE`, `CUSTOM_ERROR`             |
//!
//! `DESTROYED_BY_FORCE` is unsolicited: the host sends it to every other
//! connected endpoint when the instance is destroyed.

mod client;
mod host;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::action::Action;
use crate::error::SerializedError;

pub use client::ConnectClient;
pub use host::ConnectHost;
pub use host::ConnectHostHandler;
pub use host::EndpointId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ConnectAction {
    Connect,
    InterruptListening,
    ListeningInterrupted,
    Disconnect,
    Disconnected,
    Destroy,
    DestroyedByRequest,
    DestroyedWithError { error: SerializedError },
    DestroyedByForce,
    Custom { payload: Value },
    CustomResponse { payload: Value },
    CustomError { error: SerializedError },
}

impl ConnectAction {
    /// Sent by a host as the last action on a link.
    fn ends_link(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::DestroyedByRequest | Self::DestroyedWithError { .. } | Self::DestroyedByForce
        )
    }
}

/// True for the action after which a host stops serving the link it came on.
pub(crate) fn ends_link(action: &Action) -> bool {
    action
        .to_typed::<ConnectAction>()
        .map(|action| action.ends_link())
        .unwrap_or(false)
}
