//! # Connection Strategies
//!
//! A strategy decides how a new link to a runner is created on top of an
//! established channel, how the receiving side attaches to it, and how an
//! existing link is handed to the peer behind another channel.
//!
//! ## Built-ins
//!
//! - `MessageChannel`: every link is a fresh `Port` pair; one end travels in
//!   the transfer list.
//! - `RepeatConnection`: every link is a proxy channel multiplexed over the
//!   channel it is opened on, addressed by a side-namespaced id. Handing a
//!   link over bridges it into a fresh proxy on the target channel.

pub mod best;
mod message_channel;
mod repeat_connection;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::action::TransferList;
use crate::channel::Bridge;
use crate::channel::ConnectionChannel;
use crate::error::Result;

pub use best::BestStrategyResolverClient;
pub use best::BestStrategyResolverHost;
pub use best::StrategyResolution;
pub use best::choose_strategy;
pub use message_channel::MessageChannelStrategy;
pub use repeat_connection::RepeatConnectionStrategy;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StrategyKind {
    MessageChannel,
    RepeatConnection,
    Custom(String),
}

impl StrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::MessageChannel => "MESSAGE_CHANNEL",
            Self::RepeatConnection => "REPEAT_CONNECTION",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for StrategyKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "MESSAGE_CHANNEL" => Self::MessageChannel,
            "REPEAT_CONNECTION" => Self::RepeatConnection,
            _ => Self::Custom(name),
        }
    }
}

impl From<StrategyKind> for String {
    fn from(kind: StrategyKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of a resolver link a strategy instance serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Host,
}

impl Side {
    pub(crate) fn prefix(&self) -> &'static str {
        match self {
            Self::Client => "c",
            Self::Host => "h",
        }
    }
}

/// A link opened locally, plus the attach data the other side needs.
pub struct PreparedConnection {
    /// Not yet running.
    pub channel: ConnectionChannel,
    pub attach: Value,
}

/// Attach data for a handed-over link.
pub struct HandOver {
    pub attach: Value,
    /// Set when the link is relayed through this side instead of moving.
    /// Dismantle it if the peer never receives `attach`.
    pub bridge: Option<Bridge>,
}

pub trait ConnectionStrategy: Send + Sync + 'static {
    fn kind(&self) -> StrategyKind;

    /// Opens a new link over `root`. Transferables go into `transfer`.
    fn open_connection(&self, root: &ConnectionChannel, transfer: &TransferList) -> Result<PreparedConnection>;

    /// Attaches to a link the other side opened. The channel is not running.
    fn accept_connection(
        &self,
        root: &ConnectionChannel,
        attach: &Value,
        transfer: &TransferList,
    ) -> Result<ConnectionChannel>;

    /// Gives the peer behind `target` access to an existing link.
    ///
    /// `channel` must be detached (destroyed with `save_open`) or never have
    /// run. The peer attaches with `accept_connection` on its end of
    /// `target`.
    fn hand_over(
        &self,
        target: &ConnectionChannel,
        channel: &ConnectionChannel,
        transfer: &TransferList,
    ) -> Result<HandOver>;
}

/// Instantiates a built-in strategy for one side.
pub fn builtin(kind: &StrategyKind, side: Side) -> Option<Arc<dyn ConnectionStrategy>> {
    match kind {
        StrategyKind::MessageChannel => Some(Arc::new(MessageChannelStrategy::new())),
        StrategyKind::RepeatConnection => Some(Arc::new(RepeatConnectionStrategy::new(side))),
        StrategyKind::Custom(_) => None,
    }
}
