//! # Resolver Builder
//!
//! Fluent configuration shared by both resolver sides. The side is fixed by
//! the type parameter, so `build()` returns the matching resolver.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::error::Result;
use crate::plugins::PluginsResolver;
use crate::plugins::TransferPlugin;
use crate::runner::RunnerCatalog;
use crate::runner::RunnerDefinition;
use crate::strategy::ConnectionStrategy;
use crate::strategy::Side;
use crate::strategy::StrategyKind;
use crate::strategy::builtin;
use crate::transport::Transport;

use super::RunnerResolverClient;
use super::RunnerResolverHost;

/// Settings a resolver is built from.
pub struct ResolverConfig {
    pub catalog: RunnerCatalog,
    /// In order of preference.
    pub strategies: Vec<Arc<dyn ConnectionStrategy>>,
    pub plugins: PluginsResolver,
    /// How long the host waits for the client's `PING` before sending its own.
    pub handshake_grace: Duration,
}

pub struct ResolverBuilder<R> {
    transport: Arc<dyn Transport>,
    runners: Vec<RunnerDefinition>,
    strategies: Option<Vec<StrategyKind>>,
    custom: Vec<Arc<dyn ConnectionStrategy>>,
    plugins: Vec<Arc<dyn TransferPlugin>>,
    handshake_grace: Duration,
    _side: PhantomData<fn() -> R>,
}

impl<R> ResolverBuilder<R> {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            runners: Vec::new(),
            strategies: None,
            custom: Vec::new(),
            plugins: Vec::new(),
            handshake_grace: Duration::from_millis(100),
            _side: PhantomData,
        }
    }

    /// Makes a runner type known: constructible on a host, and recognized
    /// without a metadata round trip when a reference to it arrives.
    pub fn runner(mut self, definition: RunnerDefinition) -> Self {
        self.runners.push(definition);
        self
    }

    /// Strategies offered in the handshake, most preferred first.
    pub fn strategies(mut self, kinds: impl IntoIterator<Item = StrategyKind>) -> Self {
        self.strategies = Some(kinds.into_iter().collect());
        self
    }

    /// Registers an implementation for a `StrategyKind::Custom` kind. Unless
    /// `strategies` is set, custom strategies are preferred over built-ins.
    pub fn custom_strategy(mut self, strategy: Arc<dyn ConnectionStrategy>) -> Self {
        self.custom.push(strategy);
        self
    }

    /// Adds a plugin in front of the default chain. Later calls go in front
    /// of earlier ones.
    pub fn plugin(mut self, plugin: Arc<dyn TransferPlugin>) -> Self {
        self.plugins.insert(0, plugin);
        self
    }

    pub fn handshake_grace(mut self, grace: Duration) -> Self {
        self.handshake_grace = grace;
        self
    }

    fn config(self, side: Side) -> Result<(Arc<dyn Transport>, ResolverConfig)> {
        let catalog = RunnerCatalog::new();
        for definition in self.runners {
            catalog.register(definition)?;
        }

        let kinds = match self.strategies {
            Some(kinds) => kinds,
            None => self
                .custom
                .iter()
                .map(|s| s.kind())
                .chain([StrategyKind::MessageChannel, StrategyKind::RepeatConnection])
                .collect(),
        };
        let strategies = kinds
            .iter()
            .map(|kind| {
                self.custom
                    .iter()
                    .find(|s| s.kind() == *kind)
                    .cloned()
                    .or_else(|| builtin(kind, side))
                    .ok_or_else(|| Error::unexpected(format!("no implementation for strategy {}", kind)))
            })
            .collect::<Result<Vec<_>>>()?;
        if strategies.is_empty() {
            return Err(Error::unexpected("at least one strategy is required"));
        }

        let mut plugins = self.plugins;
        plugins.extend(PluginsResolver::default_plugins());

        Ok((
            self.transport,
            ResolverConfig {
                catalog,
                strategies,
                plugins: PluginsResolver::new(plugins),
                handshake_grace: self.handshake_grace,
            },
        ))
    }
}

impl ResolverBuilder<RunnerResolverClient> {
    pub fn build(self) -> Result<RunnerResolverClient> {
        let (transport, config) = self.config(Side::Client)?;
        Ok(RunnerResolverClient::new(transport, config))
    }
}

impl ResolverBuilder<RunnerResolverHost> {
    pub fn build(self) -> Result<RunnerResolverHost> {
        let (transport, config) = self.config(Side::Host)?;
        Ok(RunnerResolverHost::new(transport, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Port;

    #[test]
    fn test_defaults_and_unknown_strategy() {
        let (port, _) = Port::pair();
        let (_, config) = ResolverBuilder::<RunnerResolverClient>::new(Arc::new(port))
            .config(Side::Client)
            .expect("defaults are valid");
        let kinds: Vec<StrategyKind> = config.strategies.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, [StrategyKind::MessageChannel, StrategyKind::RepeatConnection]);
        assert_eq!(config.handshake_grace, Duration::from_millis(100));

        let (port, _) = Port::pair();
        let err = ResolverBuilder::<RunnerResolverHost>::new(Arc::new(port))
            .strategies([StrategyKind::Custom("WEBSOCKET".into())])
            .build()
            .err()
            .expect("no implementation");
        assert!(err.message().contains("WEBSOCKET"));
    }
}
