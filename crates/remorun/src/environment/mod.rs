//! # Runner Environments
//!
//! An environment is one runner instance seen from one side of a link.
//!
//! - `RunnerEnvironmentHost` owns the instance, serves any number of
//!   connections to it through a `ConnectHost`, and runs its destructor once.
//! - `RunnerEnvironmentClient` is a proxy to an instance elsewhere, talking to
//!   it through a `ConnectClient`. `ResolvedRunner` is its public face.
//!
//! Requests travel as `CUSTOM` payloads of the connect protocol.
//!
//! ## Reference Passing
//!
//! A proxy passed as an argument or returned as a result is sent either as a
//! new link to the same instance (`CLONE`), or, when marked for transfer, as
//! the proxy's own link, which this side then stops using.

mod client;
mod host;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::plugins::TransferPluginData;
use crate::runner::RunnerToken;

pub use client::ResolvedRunner;
pub use client::RunnerEnvironmentClient;
pub use host::RunnerEnvironmentHost;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum EnvironmentAction {
    Execute {
        method: String,
        args: Vec<TransferPluginData>,
    },
    #[serde(rename = "CLONE")]
    CloneControl,
    OwnMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum EnvironmentResponse {
    Executed {
        response: TransferPluginData,
    },
    /// The method returned a runner; the caller attaches to it.
    ExecutedWithRunnerResult {
        token: RunnerToken,
        connection: Value,
    },
    Resolved {
        connection: Value,
    },
    RunnerOwnData {
        #[serde(rename = "methodsNames")]
        methods_names: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        let clone = serde_json::to_value(EnvironmentAction::CloneControl).expect("encode");
        assert_eq!(clone, json!({ "type": "CLONE" }));

        let meta: EnvironmentResponse =
            serde_json::from_value(json!({ "type": "RUNNER_OWN_DATA", "methodsNames": ["add"] })).expect("decode");
        assert!(matches!(meta, EnvironmentResponse::RunnerOwnData { methods_names } if methods_names == ["add"]));
    }
}
