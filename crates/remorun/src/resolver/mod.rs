//! # Runner Resolvers
//!
//! The composition root of a link between two execution contexts.
//!
//! 1. Both sides run the best-strategy handshake over the transport.
//! 2. The negotiated strategy and a fresh steady-state channel come back.
//! 3. An `ActionController` on that channel carries the resolver protocol:
//!    `INIT_RUNNER` / `SOFT_INIT_RUNNER` answered by `RUNNER_INITED` /
//!    `SOFT_RUNNER_INITED`, or `ERROR`; `DESTROY` answered by `DESTROYED`.
//! 4. Every runner gets its own link, opened by the client with the strategy
//!    and attached by the host.
//!
//! ## Philosophy
//!
//! - **Both Sides Host**: a client can expose local runners to the host (by
//!   passing them as arguments), and a host can hand out proxies it received.
//!   Each resolver keeps a `ResolverContext` registry for what it hosts.
//! - **Destroy Is Total**: destroying a resolver force-closes every proxy it
//!   created and destroys every instance it hosts.

mod builder;
mod client;
mod host;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::SerializedError;
use crate::plugins::TransferPluginData;
use crate::runner::RunnerToken;

pub use builder::ResolverBuilder;
pub use builder::ResolverConfig;
pub use client::RunnerResolverClient;
pub use host::RunnerResolverHost;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ResolverAction {
    InitRunner {
        token: RunnerToken,
        args: Vec<TransferPluginData>,
        connection: Value,
    },
    /// Like `INIT_RUNNER`, for callers that only know the token.
    SoftInitRunner {
        token: RunnerToken,
        args: Vec<TransferPluginData>,
        connection: Value,
    },
    Destroy,
    RunnerInited,
    SoftRunnerInited {
        #[serde(rename = "methodsNames")]
        methods_names: Vec<String>,
    },
    Error {
        error: SerializedError,
    },
    Destroyed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_wire_shape() {
        let action = ResolverAction::SoftInitRunner {
            token: RunnerToken::new("Calc"),
            args: vec![TransferPluginData::new("JSON", json!(2))],
            connection: json!({ "port": 0 }),
        };
        assert_eq!(
            serde_json::to_value(&action).expect("encode"),
            json!({
                "type": "SOFT_INIT_RUNNER",
                "token": "Calc",
                "args": [{ "type": "JSON", "data": 2 }],
                "connection": { "port": 0 },
            })
        );
    }
}
