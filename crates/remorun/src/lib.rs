//! # Remorun
//!
//! Remote runners: objects that live in another execution context (a worker
//! thread, another process) and are called through local proxies.
//!
//! A `RunnerResolverClient` and a `RunnerResolverHost` share a `Transport`.
//! They negotiate a connection strategy, after which the client can construct
//! runners on the host and call their methods. Arguments and results go
//! through transfer plugins, so runner references themselves can be passed
//! around and returned.
//!
//! Layers, bottom to top:
//!
//! - `transport`, `action`: packets and the links that carry them.
//! - `channel`, `controller`: interception, multiplexing and request
//!   correlation on top of a link.
//! - `strategy`, `connect`: how runner links are opened and shared.
//! - `plugins`, `environment`: value transfer and the runner proxy/host pair.
//! - `resolver`: the composition root.

pub mod action;
pub mod batch;
pub mod channel;
pub mod connect;
pub mod controller;
pub mod environment;
pub mod error;
pub mod plugins;
pub mod resolver;
pub mod runner;
pub mod strategy;
pub mod transport;
pub mod value;
pub mod worker;

mod context;
mod signal;

pub use environment::ResolvedRunner;
pub use error::DisconnectReason;
pub use error::Error;
pub use error::Result;
pub use resolver::RunnerResolverClient;
pub use resolver::RunnerResolverHost;
pub use runner::LocalRunner;
pub use runner::Runner;
pub use runner::RunnerDefinition;
pub use runner::RunnerToken;
pub use strategy::StrategyKind;
pub use transport::Port;
pub use transport::Transport;
pub use value::RunnerValue;
pub use worker::spawn_worker;
