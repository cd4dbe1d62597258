use std::sync::Arc;

use parking_lot::Mutex;

use super::ResolverAction;
use super::ResolverBuilder;
use super::ResolverConfig;
use crate::action::Action;
use crate::action::TransferList;
use crate::channel::ChannelEvent;
use crate::context::ResolverContext;
use crate::controller::ActionController;
use crate::environment::ResolvedRunner;
use crate::environment::RunnerEnvironmentClient;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::plugins::TransferContext;
use crate::runner::RunnerDefinition;
use crate::runner::RunnerToken;
use crate::strategy::BestStrategyResolverClient;
use crate::strategy::ConnectionStrategy;
use crate::strategy::StrategyKind;
use crate::transport::Transport;
use crate::value::RunnerValue;

#[derive(Clone)]
struct Running {
    strategy: Arc<dyn ConnectionStrategy>,
    controller: ActionController,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    strategies: Vec<Arc<dyn ConnectionStrategy>>,
    scope: Arc<ResolverContext>,
    running: Mutex<Option<Running>>,
    destroyed: Mutex<Option<DisconnectReason>>,
}

/// Resolves runners hosted on the other end of a transport.
///
/// ```ignore
/// let resolver = RunnerResolverClient::builder(port).runner(calc()).build()?;
/// resolver.run().await?;
/// let calc = resolver.resolve(&calc(), vec![]).await?;
/// let sum: i64 = calc.call_json("add", (2, 3)).await?;
/// ```
#[derive(Clone)]
pub struct RunnerResolverClient {
    inner: Arc<ClientInner>,
}

impl RunnerResolverClient {
    pub fn builder(transport: impl Transport) -> ResolverBuilder<Self> {
        ResolverBuilder::new(Arc::new(transport))
    }

    pub(crate) fn new(transport: Arc<dyn Transport>, config: ResolverConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                strategies: config.strategies,
                scope: ResolverContext::new(config.catalog, config.plugins),
                running: Mutex::new(None),
                destroyed: Mutex::new(None),
            }),
        }
    }

    /// Negotiates a strategy with the host and starts the resolver channel.
    /// Idempotent once it has succeeded.
    pub async fn run(&self) -> Result<()> {
        if let Some(reason) = *self.inner.destroyed.lock() {
            return Err(Error::connection_closed(reason, "resolver is destroyed"));
        }
        if self.inner.running.lock().is_some() {
            return Ok(());
        }

        let resolution = BestStrategyResolverClient::new(self.inner.transport.clone(), self.inner.strategies.clone())
            .resolve()
            .await?;
        let controller = ActionController::new(resolution.channel);
        controller.add_handler(|event| {
            if let ChannelEvent::Closed(reason) = event {
                tracing::debug!(%reason, "resolver link closed");
            }
        });
        controller.channel().run()?;

        tracing::debug!(strategy = %resolution.strategy.kind(), "resolver client running");
        *self.inner.running.lock() = Some(Running {
            strategy: resolution.strategy,
            controller,
        });
        Ok(())
    }

    fn running(&self) -> Result<Running> {
        if let Some(reason) = *self.inner.destroyed.lock() {
            return Err(Error::connection_closed(reason, "resolver is destroyed"));
        }
        self.inner.running.lock().clone().ok_or_else(|| {
            Error::connection_closed(
                DisconnectReason::ConnectionNotYetEstablished,
                "resolver is not running",
            )
        })
    }

    /// The negotiated strategy, once running.
    pub fn strategy(&self) -> Option<StrategyKind> {
        self.inner.running.lock().as_ref().map(|r| r.strategy.kind())
    }

    /// Constructs a runner of a known type on the host.
    pub async fn resolve(&self, definition: &RunnerDefinition, args: Vec<RunnerValue>) -> Result<ResolvedRunner> {
        self.inner.scope.catalog.register(definition.clone())?;
        let token = definition.token().clone();
        let methods = definition.method_names().to_vec();
        self.init_runner(token, args, Some(methods)).await
    }

    /// Constructs a runner known here only by token; its methods are
    /// reported by the host.
    pub async fn resolve_soft(&self, token: impl Into<RunnerToken>, args: Vec<RunnerValue>) -> Result<ResolvedRunner> {
        self.init_runner(token.into(), args, None).await
    }

    async fn init_runner(&self, token: RunnerToken, args: Vec<RunnerValue>, methods: Option<Vec<String>>) -> Result<ResolvedRunner> {
        let Running { strategy, controller } = self.running()?;
        let root = controller.channel().clone();
        let transfer = TransferList::new();

        let prepared = strategy.open_connection(&root, &transfer)?;
        let ctx = TransferContext::new(self.inner.scope.clone(), strategy.clone(), root, transfer.clone());
        let (args, cancel) = match ctx.transfer_all(args).await {
            Ok(done) => done,
            Err(e) => {
                prepared.channel.destroy(false).await;
                return Err(e);
            }
        };

        let action = match methods {
            Some(_) => ResolverAction::InitRunner {
                token: token.clone(),
                args,
                connection: prepared.attach,
            },
            None => ResolverAction::SoftInitRunner {
                token: token.clone(),
                args,
                connection: prepared.attach,
            },
        };
        let outcome = match controller.resolve_action(Action::from_typed(&action)?, transfer).await {
            Ok(packet) => packet.action.to_typed().and_then(|response| match response {
                ResolverAction::RunnerInited => methods.ok_or_else(|| {
                    Error::unexpected(format!("host did not report methods of runner \"{}\"", token))
                }),
                ResolverAction::SoftRunnerInited { methods_names } => Ok(methods.unwrap_or(methods_names)),
                ResolverAction::Error { error } => Err(Error::from_serialized(error)),
                other => Err(Error::unexpected(format!("unexpected response to INIT_RUNNER: {:?}", other))),
            }),
            Err(e) => Err(e),
        };

        let methods = match outcome {
            Ok(methods) => methods,
            Err(e) => {
                if let Some(cancel) = cancel {
                    if let Err(c) = cancel.run().await {
                        tracing::debug!(runner = %token, error = %c, "could not cancel constructor arguments");
                    }
                }
                prepared.channel.destroy(false).await;
                return Err(e);
            }
        };

        let env = RunnerEnvironmentClient::init(self.inner.scope.clone(), strategy, prepared.channel, token, Some(methods)).await?;
        tracing::debug!(runner = %env.token(), "runner resolved");
        Ok(ResolvedRunner::new(env))
    }

    /// Closes every proxy, destroys every runner this side hosts, and asks the
    /// host to do the same.
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut destroyed = self.inner.destroyed.lock();
            if destroyed.is_some() {
                return Ok(());
            }
            *destroyed = Some(DisconnectReason::ResolverDestroyed);
        }
        let running = self.inner.running.lock().take();

        let mut errors = self.inner.scope.destroy_all(DisconnectReason::ResolverDestroyed).await;
        if let Some(Running { controller, .. }) = running {
            if controller.channel().is_connected() {
                let request = Action::from_typed(&ResolverAction::Destroy)?;
                match controller.resolve_action(request, TransferList::new()).await {
                    Ok(packet) => match packet.action.to_typed() {
                        Ok(ResolverAction::Destroyed) => {}
                        Ok(ResolverAction::Error { error }) => errors.push(Error::from_serialized(error)),
                        Ok(other) => errors.push(Error::unexpected(format!("unexpected response to DESTROY: {:?}", other))),
                        Err(e) => errors.push(e),
                    },
                    Err(e) if e.is_connection_closed() => {}
                    Err(e) => errors.push(e),
                }
            }
            controller.close(DisconnectReason::ResolverDestroyed, false).await;
        }

        tracing::debug!(failures = errors.len(), "resolver client destroyed");
        match errors.len() {
            0 => Ok(()),
            _ => Err(Error::RunnerDestroy(
                Failure::new("failed to destroy resolver").with_errors(errors),
            )),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.lock().is_some()
    }

    /// Runner proxies currently open through this resolver.
    pub fn proxy_count(&self) -> usize {
        self.inner.scope.client_count()
    }

    /// Runners exposed by this side and still alive.
    pub fn hosted_count(&self) -> usize {
        self.inner.scope.hosted_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionChannel;
    use crate::runner::Runner;
    use crate::strategy::BestStrategyResolverHost;
    use crate::strategy::Side;
    use crate::strategy::builtin;
    use crate::transport::Port;
    use std::time::Duration;

    struct Idle;

    #[async_trait::async_trait]
    impl Runner for Idle {
        async fn execute(&self, _method: &str, _args: Vec<RunnerValue>) -> anyhow::Result<RunnerValue> {
            Ok(RunnerValue::null())
        }
    }

    /// A host that negotiates, then answers every request with gibberish.
    async fn garbled_host(port: Port) -> ConnectionChannel {
        let strategy = builtin(&StrategyKind::MessageChannel, Side::Host).expect("builtin");
        let resolution = BestStrategyResolverHost::new(Arc::new(port), vec![strategy])
            .with_grace(Duration::from_millis(10))
            .resolve()
            .await
            .expect("handshake");
        let channel = resolution.channel;
        let responder = channel.clone();
        channel.add_handler(move |event| {
            if let ChannelEvent::Action(packet) = event {
                if let Some(id) = packet.action.id {
                    let reply = Action::new("GIBBERISH").with_id(id);
                    let _ = responder.send_action(reply, TransferList::new());
                }
            }
        });
        channel.run().expect("run");
        channel
    }

    #[tokio::test]
    async fn test_undecodable_responses_still_clean_up() {
        let (a, b) = Port::pair();
        let client = RunnerResolverClient::builder(a).build().expect("client");
        let (ran, _host) = tokio::join!(client.run(), garbled_host(b));
        ran.expect("client runs");

        let idle = RunnerDefinition::new(&[], |_args| async { Ok(Idle) });
        let lent = RunnerValue::Local(idle.local(Idle));
        let err = client
            .resolve_soft("Anything", vec![lent])
            .await
            .expect_err("garbled response");
        assert!(!err.is_connection_closed(), "{:?}", err);
        // The exposed argument was taken back.
        assert_eq!(client.hosted_count(), 0);

        let err = client.destroy().await.expect_err("garbled destroy response");
        assert!(matches!(err, Error::RunnerDestroy(_)), "{:?}", err);
        assert!(client.is_destroyed());
    }
}
