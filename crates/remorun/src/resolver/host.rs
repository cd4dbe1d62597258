use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use super::ResolverAction;
use super::ResolverBuilder;
use super::ResolverConfig;
use crate::action::Action;
use crate::action::ActionId;
use crate::action::TransferList;
use crate::channel::ChannelEvent;
use crate::context::ResolverContext;
use crate::controller::ActionController;
use crate::environment::RunnerEnvironmentHost;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::plugins::TransferPluginData;
use crate::runner::RunnerToken;
use crate::signal::Flag;
use crate::strategy::BestStrategyResolverHost;
use crate::strategy::ConnectionStrategy;
use crate::strategy::StrategyKind;
use crate::transport::Transport;

#[derive(Clone)]
struct Running {
    strategy: Arc<dyn ConnectionStrategy>,
    controller: ActionController,
}

struct HostInner {
    transport: Arc<dyn Transport>,
    strategies: Vec<Arc<dyn ConnectionStrategy>>,
    grace: Duration,
    scope: Arc<ResolverContext>,
    running: Mutex<Option<Running>>,
    closing: AtomicBool,
    closed: Flag,
}

/// Serves runner construction requests from a `RunnerResolverClient`.
///
/// Usually lives in the isolated context (a worker) and runs until the client
/// destroys it or the link is lost; await `closed()` to keep the context
/// alive until then.
#[derive(Clone)]
pub struct RunnerResolverHost {
    inner: Arc<HostInner>,
}

impl RunnerResolverHost {
    pub fn builder(transport: impl Transport) -> ResolverBuilder<Self> {
        ResolverBuilder::new(Arc::new(transport))
    }

    pub(crate) fn new(transport: Arc<dyn Transport>, config: ResolverConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                transport,
                strategies: config.strategies,
                grace: config.handshake_grace,
                scope: ResolverContext::new(config.catalog, config.plugins),
                running: Mutex::new(None),
                closing: AtomicBool::new(false),
                closed: Flag::new(),
            }),
        }
    }

    /// Completes the handshake and starts serving requests.
    pub async fn run(&self) -> Result<()> {
        if self.inner.closed.is_raised() {
            return Err(Error::connection_closed(DisconnectReason::ResolverDestroyed, "resolver is destroyed"));
        }
        if self.inner.running.lock().is_some() {
            return Ok(());
        }

        let resolution = BestStrategyResolverHost::new(self.inner.transport.clone(), self.inner.strategies.clone())
            .with_grace(self.inner.grace)
            .resolve()
            .await?;
        let controller = ActionController::new(resolution.channel);
        let weak = Arc::downgrade(&self.inner);
        controller.add_handler(move |event| Self::dispatch(&weak, event));

        *self.inner.running.lock() = Some(Running {
            strategy: resolution.strategy.clone(),
            controller: controller.clone(),
        });
        controller.channel().run()?;
        tracing::debug!(strategy = %resolution.strategy.kind(), "resolver host running");
        Ok(())
    }

    fn dispatch(weak: &Weak<HostInner>, event: &ChannelEvent) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let host = Self { inner };

        let packet = match event {
            ChannelEvent::Action(packet) => packet,
            ChannelEvent::Closed(reason) => {
                let reason = *reason;
                tokio::spawn(async move { host.shutdown(reason).await });
                return;
            }
        };
        let Some(reply_to) = packet.action.id else {
            tracing::trace!(action = %packet.action.kind, "ignoring uncorrelated action");
            return;
        };

        match packet.action.to_typed::<ResolverAction>() {
            Ok(ResolverAction::InitRunner { token, args, connection }) => {
                let transfer = packet.transfer.clone();
                tokio::spawn(async move { host.init_runner(reply_to, token, args, connection, transfer, false).await });
            }
            Ok(ResolverAction::SoftInitRunner { token, args, connection }) => {
                let transfer = packet.transfer.clone();
                tokio::spawn(async move { host.init_runner(reply_to, token, args, connection, transfer, true).await });
            }
            Ok(ResolverAction::Destroy) => {
                tokio::spawn(async move { host.destroy_by_request(reply_to).await });
            }
            Ok(other) => tracing::debug!(action = ?other, "unexpected action on resolver host"),
            Err(e) => tracing::warn!(error = %e, "malformed resolver action"),
        }
    }

    fn running(&self) -> Result<Running> {
        self.inner.running.lock().clone().ok_or_else(|| {
            Error::connection_closed(DisconnectReason::ConnectionNotYetEstablished, "resolver is not running")
        })
    }

    fn respond(&self, reply_to: ActionId, response: &ResolverAction) {
        let Ok(Running { controller, .. }) = self.running() else {
            return;
        };
        let sent = Action::from_typed(response)
            .and_then(|action| controller.send_action_response(action.with_id(reply_to), TransferList::new()));
        if let Err(e) = sent {
            tracing::debug!(error = %e, ?response, "could not deliver resolver response");
        }
    }

    async fn init_runner(
        &self,
        reply_to: ActionId,
        token: RunnerToken,
        args: Vec<TransferPluginData>,
        connection: Value,
        transfer: TransferList,
        soft: bool,
    ) {
        let response = match self.construct(&token, args, connection, transfer).await {
            Ok(methods_names) if soft => ResolverAction::SoftRunnerInited { methods_names },
            Ok(_) => ResolverAction::RunnerInited,
            Err(error) => {
                tracing::debug!(runner = %token, error = %error, "runner construction failed");
                ResolverAction::Error {
                    error: error.to_serialized(),
                }
            }
        };
        self.respond(reply_to, &response);
    }

    async fn construct(
        &self,
        token: &RunnerToken,
        args: Vec<TransferPluginData>,
        connection: Value,
        transfer: TransferList,
    ) -> Result<Vec<String>> {
        let Running { strategy, controller } = self.running()?;
        let scope = &self.inner.scope;
        let definition = scope
            .catalog
            .get(token)
            .ok_or_else(|| Error::runner_not_found(token.as_str()))?;

        let channel = strategy.accept_connection(controller.channel(), &connection, &transfer)?;
        let host = RunnerEnvironmentHost::new(scope, definition.clone(), strategy);
        // Tracked first: a client may disconnect as soon as the endpoint runs.
        scope.track_host(host.id(), host.clone());
        if let Err(e) = host.init(channel.clone(), args, transfer).await {
            scope.forget_host(host.id());
            channel.destroy(false).await;
            return Err(e);
        }
        Ok(definition.method_names().to_vec())
    }

    async fn destroy_by_request(&self, reply_to: ActionId) {
        let response = match self.teardown(DisconnectReason::ResolverDestroyed).await {
            Ok(()) => ResolverAction::Destroyed,
            Err(error) => ResolverAction::Error {
                error: error.to_serialized(),
            },
        };
        self.respond(reply_to, &response);
        self.close().await;
    }

    /// The client went away without saying goodbye.
    async fn shutdown(&self, reason: DisconnectReason) {
        if let Err(e) = self.teardown(reason).await {
            tracing::warn!(error = %e, "runner teardown after lost link failed");
        }
        self.close().await;
    }

    async fn teardown(&self, reason: DisconnectReason) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let errors = self.inner.scope.destroy_all(reason).await;
        tracing::debug!(failures = errors.len(), %reason, "resolver host torn down");
        match errors.len() {
            0 => Ok(()),
            _ => Err(Error::RunnerDestroy(
                Failure::new("failed to destroy hosted runners").with_errors(errors),
            )),
        }
    }

    async fn close(&self) {
        let running = self.inner.running.lock().take();
        if let Some(Running { controller, .. }) = running {
            controller.close(DisconnectReason::ResolverDestroyed, false).await;
        }
        self.inner.closed.raise();
    }

    /// Destroys every hosted runner and closes the link.
    pub async fn destroy(&self) -> Result<()> {
        let result = self.teardown(DisconnectReason::ResolverDestroyed).await;
        self.close().await;
        result
    }

    /// The negotiated strategy, once running.
    pub fn strategy(&self) -> Option<StrategyKind> {
        self.inner.running.lock().as_ref().map(|r| r.strategy.kind())
    }

    /// Runner instances currently hosted.
    pub fn hosted_count(&self) -> usize {
        self.inner.scope.hosted_count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_raised()
    }

    /// Resolves once the resolver has been destroyed or lost its client.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.inner.closed.wait()
    }
}
