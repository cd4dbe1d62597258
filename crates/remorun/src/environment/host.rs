use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;

use super::EnvironmentAction;
use super::EnvironmentResponse;
use super::RunnerEnvironmentClient;
use crate::action::TransferList;
use crate::channel::ConnectionChannel;
use crate::connect::ConnectHost;
use crate::connect::ConnectHostHandler;
use crate::connect::EndpointId;
use crate::context::ResolverContext;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::error::collect_errors;
use crate::plugins::Cancel;
use crate::plugins::RunnerTransferPlugin;
use crate::plugins::TransferContext;
use crate::plugins::TransferPluginData;
use crate::runner::Runner;
use crate::runner::RunnerDefinition;
use crate::strategy::ConnectionStrategy;
use crate::value::RunnerValue;

/// Owns one runner instance and serves every link to it.
pub struct RunnerEnvironmentHost {
    id: u64,
    definition: RunnerDefinition,
    runner: OnceLock<Arc<dyn Runner>>,
    connect: ConnectHost,
    strategy: Arc<dyn ConnectionStrategy>,
    scope: Weak<ResolverContext>,
    /// Proxies the instance received as arguments; released with it.
    received: Mutex<Vec<Arc<RunnerEnvironmentClient>>>,
    skip_destructor: AtomicBool,
}

impl RunnerEnvironmentHost {
    pub(crate) fn new(
        scope: &Arc<ResolverContext>,
        definition: RunnerDefinition,
        strategy: Arc<dyn ConnectionStrategy>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let handler: Weak<dyn ConnectHostHandler> = weak.clone();
            Self {
                id: scope.next_id(),
                connect: ConnectHost::new(definition.token().to_string(), handler),
                definition,
                runner: OnceLock::new(),
                strategy,
                scope: Arc::downgrade(scope),
                received: Mutex::new(Vec::new()),
                skip_destructor: AtomicBool::new(false),
            }
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn definition(&self) -> &RunnerDefinition {
        &self.definition
    }

    fn scope(&self) -> Result<Arc<ResolverContext>> {
        self.scope
            .upgrade()
            .ok_or_else(|| Error::unexpected("resolver is gone"))
    }

    fn transfer_context(&self, channel: &ConnectionChannel, transfer: TransferList) -> Result<TransferContext> {
        Ok(TransferContext::new(self.scope()?, self.strategy.clone(), channel.clone(), transfer))
    }

    /// Receives constructor arguments, builds the instance and starts serving
    /// `channel`.
    ///
    /// On failure the received arguments are released again and their
    /// release errors are attached to the returned `RunnerInit` error.
    pub(crate) async fn init(&self, channel: ConnectionChannel, args: Vec<TransferPluginData>, transfer: TransferList) -> Result<()> {
        let token = self.definition.token();
        let ctx = self.transfer_context(&channel, transfer)?;
        let (values, cancel) = ctx.receive_all(args).await.map_err(|e| {
            Error::RunnerInit(
                Failure::new(format!("failed to receive arguments of runner \"{}\"", token)).with_errors(vec![e]),
            )
        })?;

        let runner = match self.definition.construct(values).await {
            Ok(runner) => runner,
            Err(e) => {
                let cleanup = run_cancel(cancel).await;
                return Err(Error::from_runner(e, Error::RunnerInit).with_original_errors(cleanup));
            }
        };
        if self.runner.set(runner).is_err() {
            let cleanup = run_cancel(cancel).await;
            return Err(Error::RunnerInit(
                Failure::new(format!("runner \"{}\" is already constructed", token)).with_errors(cleanup),
            ));
        }
        self.received.lock().extend(ctx.take_received());

        self.connect.add_endpoint(channel)?;
        tracing::debug!(runner = %token, "runner constructed");
        Ok(())
    }

    /// Hosts an instance that already exists on this side.
    pub(crate) fn init_local(&self, runner: Arc<dyn Runner>) -> Result<()> {
        self.runner.set(runner).map_err(|_| {
            Error::unexpected(format!("runner \"{}\" is already hosted here", self.definition.token()))
        })
    }

    pub(crate) fn add_connection(&self, channel: ConnectionChannel) -> Result<EndpointId> {
        self.connect.add_endpoint(channel)
    }

    /// The destructor will not run when this host is torn down.
    pub(crate) fn skip_destructor(&self) {
        self.skip_destructor.store(true, Ordering::SeqCst);
    }

    /// Destroys the instance, notifying every connected proxy.
    pub(crate) async fn force_destroy(&self) -> Result<()> {
        self.connect.force_destroy().await
    }

    async fn execute(
        &self,
        channel: &ConnectionChannel,
        method: String,
        args: Vec<TransferPluginData>,
        transfer: TransferList,
    ) -> Result<(Value, TransferList)> {
        let token = self.definition.token();
        let runner = self
            .runner
            .get()
            .cloned()
            .ok_or_else(|| Error::RunnerExecute(Failure::new(format!("runner \"{}\" is not constructed", token))))?;
        if !self.definition.has_method(&method) {
            return Err(Error::RunnerExecute(Failure::new(format!(
                "runner \"{}\" has no method \"{}\"",
                token, method
            ))));
        }

        let ctx = self.transfer_context(channel, transfer)?;
        let (values, cancel) = ctx.receive_all(args).await.map_err(|e| {
            Error::RunnerExecute(
                Failure::new(format!("failed to receive arguments of \"{}\"", method)).with_errors(vec![e]),
            )
        })?;

        tracing::trace!(runner = %token, %method, "executing");
        let value = match runner.execute(&method, values).await {
            Ok(value) => value,
            Err(e) => {
                let cleanup = run_cancel(cancel).await;
                return Err(Error::from_runner(e, Error::RunnerExecute).with_original_errors(cleanup));
            }
        };
        self.received.lock().extend(ctx.take_received());

        self.encode_result(channel, value).await
    }

    /// A top-level runner result travels as its own response type; anything
    /// else goes through the plugin chain.
    async fn encode_result(&self, channel: &ConnectionChannel, value: RunnerValue) -> Result<(Value, TransferList)> {
        let transfer = TransferList::new();
        let ctx = self.transfer_context(channel, transfer.clone())?;
        let response = match value {
            RunnerValue::Runner(_) | RunnerValue::Local(_) => {
                let (token, connection, _cancel) = RunnerTransferPlugin::transfer_reference(&ctx, value).await?;
                EnvironmentResponse::ExecutedWithRunnerResult { token, connection }
            }
            other => EnvironmentResponse::Executed {
                response: ctx.transfer_nested(other).await?.data,
            },
        };
        Ok((serde_json::to_value(response)?, transfer))
    }

    fn open_clone(&self, channel: &ConnectionChannel) -> Result<(Value, TransferList)> {
        let transfer = TransferList::new();
        let prepared = self.strategy.open_connection(channel, &transfer)?;
        self.connect.add_endpoint(prepared.channel)?;
        let response = EnvironmentResponse::Resolved {
            connection: prepared.attach,
        };
        Ok((serde_json::to_value(response)?, transfer))
    }
}

async fn run_cancel(cancel: Option<Cancel>) -> Vec<Error> {
    match cancel {
        Some(cancel) => cancel.run().await.err().into_iter().collect(),
        None => Vec::new(),
    }
}

#[async_trait::async_trait]
impl ConnectHostHandler for RunnerEnvironmentHost {
    async fn handle_custom(
        &self,
        channel: &ConnectionChannel,
        payload: Value,
        transfer: TransferList,
    ) -> Result<(Value, TransferList)> {
        match serde_json::from_value(payload)? {
            EnvironmentAction::Execute { method, args } => self.execute(channel, method, args, transfer).await,
            EnvironmentAction::CloneControl => self.open_clone(channel),
            EnvironmentAction::OwnMetadata => {
                let response = EnvironmentResponse::RunnerOwnData {
                    methods_names: self.definition.method_names().to_vec(),
                };
                Ok((serde_json::to_value(response)?, TransferList::new()))
            }
        }
    }

    async fn handle_destroy(&self) -> Result<()> {
        let token = self.definition.token();
        let mut errors = Vec::new();

        if !self.skip_destructor.load(Ordering::SeqCst) {
            if let Some(runner) = self.runner.get() {
                if let Err(e) = runner.destroy().await {
                    errors.push(Error::from_runner(e, Error::RunnerDestroy));
                }
            }
        }

        let received = std::mem::take(&mut *self.received.lock());
        let released = join_all(received.iter().map(|client| client.disconnect())).await;
        errors.extend(collect_errors(released));

        if let Some(scope) = self.scope.upgrade() {
            scope.forget_host(self.id);
        }

        match errors.len() {
            0 => Ok(()),
            1 if matches!(errors[0], Error::RunnerDestroy(_)) => Err(errors.remove(0)),
            _ => Err(Error::RunnerDestroy(
                Failure::new(format!("failed to destroy runner \"{}\"", token)).with_errors(errors),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::channel::ChannelEvent;
    use crate::connect::ConnectAction;
    use crate::plugins::PluginsResolver;
    use crate::runner::RunnerCatalog;
    use crate::runner::RunnerToken;
    use crate::strategy::Side;
    use crate::strategy::StrategyKind;
    use crate::transport::Port;

    struct Stubborn;

    #[async_trait::async_trait]
    impl Runner for Stubborn {
        async fn execute(&self, method: &str, _args: Vec<RunnerValue>) -> anyhow::Result<RunnerValue> {
            anyhow::bail!("unhandled method {}", method)
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            anyhow::bail!("refuses to die")
        }
    }

    fn scope() -> Arc<ResolverContext> {
        ResolverContext::new(RunnerCatalog::new(), PluginsResolver::new(PluginsResolver::default_plugins()))
    }

    fn strategy() -> Arc<dyn ConnectionStrategy> {
        crate::strategy::builtin(&StrategyKind::MessageChannel, Side::Host).expect("builtin")
    }

    fn stubborn_host(scope: &Arc<ResolverContext>) -> Arc<RunnerEnvironmentHost> {
        let definition = RunnerDefinition::new(&["poke"], |_args: Vec<RunnerValue>| async { Ok(Stubborn) });
        RunnerEnvironmentHost::new(scope, definition, strategy())
    }

    /// Answers every request with an empty custom response.
    fn contrary_peer(port: Port) -> ConnectionChannel {
        let channel = ConnectionChannel::new(port);
        let replies = channel.clone();
        channel.add_handler(move |event| {
            if let ChannelEvent::Action(packet) = event {
                if let Some(id) = packet.action.id {
                    let reply = Action::from_typed(&ConnectAction::CustomResponse { payload: Value::Null })
                        .expect("typed")
                        .with_id(id);
                    let _ = replies.send_action(reply, TransferList::new());
                }
            }
        });
        channel.run().expect("run");
        channel
    }

    #[tokio::test]
    async fn test_instance_is_set_once() {
        let scope = scope();
        let host = stubborn_host(&scope);
        host.init_local(Arc::new(Stubborn)).expect("first instance");
        let err = host.init_local(Arc::new(Stubborn)).expect_err("second instance");
        assert!(matches!(err, Error::Unexpected(_)), "{:?}", err);

        let (a, _b) = Port::pair();
        let err = host
            .init(ConnectionChannel::new(a), vec![], TransferList::new())
            .await
            .expect_err("already constructed");
        assert!(matches!(err, Error::RunnerInit(_)), "{:?}", err);
        assert_eq!(host.connect.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_reports_destructor_and_release_failures_together() {
        let scope = scope();
        let host = stubborn_host(&scope);
        host.init_local(Arc::new(Stubborn)).expect("instance");

        let (a, b) = Port::pair();
        let _peer = contrary_peer(b);
        let held = RunnerEnvironmentClient::init(
            scope.clone(),
            strategy(),
            ConnectionChannel::new(a),
            RunnerToken::new("Held"),
            Some(vec![]),
        )
        .await
        .expect("proxy connects");
        host.received.lock().push(held);

        let err = host.handle_destroy().await.expect_err("both steps fail");
        assert!(matches!(err, Error::RunnerDestroy(_)), "{:?}", err);
        let causes = err.original_errors();
        assert_eq!(causes.len(), 2, "{:?}", causes);
        assert!(matches!(causes[0], Error::RunnerDestroy(_)), "{:?}", causes[0]);
        assert!(matches!(causes[1], Error::Unexpected(_)), "{:?}", causes[1]);
        assert!(host.received.lock().is_empty());
    }
}
