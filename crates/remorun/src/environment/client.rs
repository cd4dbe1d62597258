use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::EnvironmentAction;
use super::EnvironmentResponse;
use crate::action::TransferList;
use crate::channel::ConnectionChannel;
use crate::connect::ConnectClient;
use crate::context::ResolverContext;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::plugins::Cancel;
use crate::plugins::TransferContext;
use crate::runner::RunnerToken;
use crate::strategy::ConnectionStrategy;
use crate::strategy::HandOver;
use crate::value::RunnerValue;

struct ClientState {
    connect: ConnectClient,
    marked_for_transfer: bool,
    /// Our own view of why the proxy is closed. Wins over whatever the
    /// connect layer saw, so explicit disconnects and destroys are reported
    /// as such.
    closed: Option<DisconnectReason>,
}

/// Proxy to a runner instance hosted on the other end of a link.
pub struct RunnerEnvironmentClient {
    id: u64,
    token: RunnerToken,
    methods: Vec<String>,
    scope: Arc<ResolverContext>,
    strategy: Arc<dyn ConnectionStrategy>,
    state: Mutex<ClientState>,
}

impl RunnerEnvironmentClient {
    /// Connects over `channel`. Without `methods`, asks the host for them.
    pub(crate) async fn init(
        scope: Arc<ResolverContext>,
        strategy: Arc<dyn ConnectionStrategy>,
        channel: ConnectionChannel,
        token: RunnerToken,
        methods: Option<Vec<String>>,
    ) -> Result<Arc<Self>> {
        let connect = ConnectClient::new(channel);
        if let Err(e) = connect.connect() {
            connect.force_destroy(DisconnectReason::ConnectionError).await;
            return Err(e);
        }

        let methods = match methods {
            Some(methods) => methods,
            None => match Self::fetch_methods(&connect).await {
                Ok(methods) => methods,
                Err(e) => {
                    if let Err(d) = connect.disconnect().await {
                        tracing::debug!(runner = %token, error = %d, "disconnect after failed metadata request");
                    }
                    return Err(e);
                }
            },
        };

        let client = Arc::new(Self {
            id: scope.next_id(),
            token,
            methods,
            scope,
            strategy,
            state: Mutex::new(ClientState {
                connect: connect.clone(),
                marked_for_transfer: false,
                closed: None,
            }),
        });
        client.watch(&connect);
        client.scope.track_client(client.id, &client);
        tracing::debug!(runner = %client.token, "runner proxy connected");
        Ok(client)
    }

    async fn fetch_methods(connect: &ConnectClient) -> Result<Vec<String>> {
        let request = serde_json::to_value(EnvironmentAction::OwnMetadata)?;
        let (payload, _) = connect.resolve_custom(request, TransferList::new()).await?;
        match serde_json::from_value(payload)? {
            EnvironmentResponse::RunnerOwnData { methods_names } => Ok(methods_names),
            other => Err(Error::unexpected(format!(
                "unexpected response to OWN_METADATA: {:?}",
                other
            ))),
        }
    }

    /// Asks the host which methods the instance exposes.
    pub async fn own_metadata(&self) -> Result<Vec<String>> {
        let connect = self.open_connect("fetch metadata")?;
        Self::fetch_methods(&connect)
            .await
            .map_err(|e| self.describe(e, "fetch metadata"))
    }

    fn watch(self: &Arc<Self>, connect: &ConnectClient) {
        let weak = Arc::downgrade(self);
        connect.on_closed(move |reason| {
            if let Some(client) = weak.upgrade() {
                client.set_closed(reason, false);
            }
        });
    }

    fn set_closed(&self, reason: DisconnectReason, overwrite: bool) {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() && !overwrite {
                return;
            }
            state.closed = Some(reason);
        }
        tracing::debug!(runner = %self.token, %reason, "runner proxy closed");
        self.scope.forget_client(self.id);
    }

    pub fn token(&self) -> &RunnerToken {
        &self.token
    }

    pub fn method_names(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        self.state.lock().closed
    }

    fn closed_error(&self, reason: DisconnectReason, attempt: &str) -> Error {
        Error::connection_closed(
            reason,
            format!("runner \"{}\" cannot {}: {}", self.token, attempt, reason),
        )
    }

    fn open_connect(&self, attempt: &str) -> Result<ConnectClient> {
        let state = self.state.lock();
        match state.closed {
            Some(reason) => Err(self.closed_error(reason, attempt)),
            None => Ok(state.connect.clone()),
        }
    }

    /// Rewrites connection failures to name this runner.
    fn describe(&self, error: Error, attempt: &str) -> Error {
        match error.disconnect_reason() {
            Some(reason) => self.closed_error(self.closed_reason().unwrap_or(reason), attempt),
            None => error,
        }
    }

    fn transfer_context(&self, channel: &ConnectionChannel, transfer: TransferList) -> TransferContext {
        TransferContext::new(self.scope.clone(), self.strategy.clone(), channel.clone(), transfer)
    }

    pub async fn execute(&self, method: &str, args: Vec<RunnerValue>) -> Result<RunnerValue> {
        let attempt = format!("execute \"{}\"", method);
        let connect = self.open_connect(&attempt)?;
        if !self.has_method(method) {
            return Err(Error::RunnerExecute(Failure::new(format!(
                "runner \"{}\" has no method \"{}\"",
                self.token, method
            ))));
        }

        let transfer = TransferList::new();
        let ctx = self.transfer_context(connect.channel(), transfer.clone());
        let (args, cancel) = ctx.transfer_all(args).await?;
        let request = serde_json::to_value(EnvironmentAction::Execute {
            method: method.to_string(),
            args,
        })?;

        let (payload, transfer) = match connect.resolve_custom(request, transfer).await {
            Ok(response) => response,
            Err(error) => {
                // The host never got to own the arguments.
                if error.is_connection_closed() {
                    if let Some(cancel) = cancel {
                        if let Err(e) = cancel.run().await {
                            tracing::debug!(runner = %self.token, error = %e, "could not cancel arguments");
                        }
                    }
                }
                return Err(self.describe(error, &attempt));
            }
        };
        self.receive_response(&connect, payload, transfer).await
    }

    async fn receive_response(&self, connect: &ConnectClient, payload: Value, transfer: TransferList) -> Result<RunnerValue> {
        match serde_json::from_value(payload)? {
            EnvironmentResponse::Executed { response } => {
                let ctx = self.transfer_context(connect.channel(), transfer);
                Ok(ctx.receive_nested(response).await?.value)
            }
            EnvironmentResponse::ExecutedWithRunnerResult { token, connection } => {
                let channel = self
                    .strategy
                    .accept_connection(connect.channel(), &connection, &transfer)?;
                let methods = self.scope.catalog.get(&token).map(|d| d.method_names().to_vec());
                let env = Self::init(self.scope.clone(), self.strategy.clone(), channel, token, methods).await?;
                Ok(RunnerValue::Runner(ResolvedRunner::new(env)))
            }
            other => Err(Error::unexpected(format!("unexpected response to EXECUTE: {:?}", other))),
        }
    }

    /// Asks the host for a new link to the same instance. Not yet running.
    async fn clone_channel(&self) -> Result<ConnectionChannel> {
        let attempt = "clone control";
        let connect = self.open_connect(attempt)?;
        let request = serde_json::to_value(EnvironmentAction::CloneControl)?;
        let (payload, transfer) = connect
            .resolve_custom(request, TransferList::new())
            .await
            .map_err(|e| self.describe(e, attempt))?;

        match serde_json::from_value(payload)? {
            EnvironmentResponse::Resolved { connection } => {
                self.strategy
                    .accept_connection(connect.channel(), &connection, &transfer)
            }
            other => Err(Error::unexpected(format!("unexpected response to CLONE: {:?}", other))),
        }
    }

    /// A second, independent proxy to the same instance.
    pub(crate) async fn clone_control(&self) -> Result<Arc<Self>> {
        let channel = self.clone_channel().await?;
        Self::init(
            self.scope.clone(),
            self.strategy.clone(),
            channel,
            self.token.clone(),
            Some(self.methods.clone()),
        )
        .await
    }

    pub(crate) fn mark_for_transfer(&self) {
        self.state.lock().marked_for_transfer = true;
    }

    /// Produces attach data for sending this proxy through `ctx`.
    ///
    /// A proxy marked for transfer gives away its own link and closes with
    /// `RunnerTransferred`. Any other proxy sends a fresh clone. Either way
    /// the cancel handle undoes it.
    pub(crate) async fn resolve_or_transfer_control(self: &Arc<Self>, ctx: &TransferContext) -> Result<(Value, Cancel)> {
        if self.state.lock().marked_for_transfer {
            let nested = self.open_connect("transfer control")?.channel().dependents();
            if nested == 0 {
                return self.transfer_control(ctx).await;
            }
            // Proxies opened over our link would be stranded by the move.
            tracing::debug!(runner = %self.token, nested, "link carries proxies, sending a clone instead");
        }

        let channel = self.clone_channel().await?;
        match ctx.strategy.hand_over(&ctx.channel, &channel, ctx.transfer()) {
            Ok(HandOver { attach, bridge }) => Ok((
                attach,
                Cancel::new(move || async move {
                    let channel = match bridge {
                        Some(bridge) => bridge.dismantle().await,
                        None => channel,
                    };
                    release(channel).await
                }),
            )),
            Err(e) => {
                if let Err(r) = release(channel).await {
                    tracing::debug!(runner = %self.token, error = %r, "could not release cloned link");
                }
                Err(e)
            }
        }
    }

    async fn transfer_control(self: &Arc<Self>, ctx: &TransferContext) -> Result<(Value, Cancel)> {
        let attempt = "transfer control";
        let connect = self.open_connect(attempt)?;
        connect
            .interrupt_listening()
            .await
            .map_err(|e| self.describe(e, attempt))?;
        let channel = connect.detach().await;
        self.set_closed(DisconnectReason::RunnerTransferred, true);

        match ctx.strategy.hand_over(&ctx.channel, &channel, ctx.transfer()) {
            Ok(HandOver { attach, bridge }) => {
                let me = self.clone();
                let cancel = Cancel::new(move || async move {
                    let channel = match bridge {
                        Some(bridge) => bridge.dismantle().await,
                        None => channel,
                    };
                    me.reattach(channel)
                });
                Ok((attach, cancel))
            }
            Err(e) => {
                if let Err(r) = self.reattach(channel) {
                    tracing::warn!(runner = %self.token, error = %r, "could not take back link after failed transfer");
                }
                Err(e)
            }
        }
    }

    /// Resumes using a link given away by a transfer that did not happen.
    fn reattach(self: &Arc<Self>, channel: ConnectionChannel) -> Result<()> {
        let channel = if channel.is_destroyed() {
            channel.successor()
        } else {
            channel
        };
        let connect = ConnectClient::new(channel);
        connect.connect()?;
        self.watch(&connect);
        {
            let mut state = self.state.lock();
            state.connect = connect;
            state.closed = None;
            state.marked_for_transfer = false;
        }
        self.scope.track_client(self.id, self);
        tracing::debug!(runner = %self.token, "runner proxy reattached");
        Ok(())
    }

    /// Leaves the instance alone. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let connect = {
            let state = self.state.lock();
            if state.closed.is_some() {
                return Ok(());
            }
            state.connect.clone()
        };
        let result = connect.disconnect().await;
        self.set_closed(DisconnectReason::RunnerDisconnected, true);
        result
    }

    /// Destroys the instance for every holder.
    pub async fn destroy(&self) -> Result<()> {
        let connect = self.open_connect("destroy")?;
        let result = connect.destroy().await;
        self.set_closed(DisconnectReason::RunnerDestroyed, true);
        result.map_err(|e| self.describe(e, "destroy"))
    }

    /// Local teardown without waiting on the host.
    pub(crate) async fn force_destroy(&self, reason: DisconnectReason) {
        let connect = {
            let state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.connect.clone()
        };
        self.set_closed(reason, true);
        connect.force_destroy(reason).await;
    }
}

/// Closes a link that was opened for a peer but never handed to it.
async fn release(channel: ConnectionChannel) -> Result<()> {
    if channel.proxy_id().is_none() {
        // The host sees its end close and drops the endpoint.
        channel.destroy(false).await;
        return Ok(());
    }
    let connect = ConnectClient::new(channel);
    connect.connect()?;
    connect.disconnect().await
}

/// Handle to a runner living in another context.
///
/// Cheap to clone; clones share one link. Use `clone_control` for an
/// independent link that keeps the instance alive on its own.
#[derive(Clone)]
pub struct ResolvedRunner {
    env: Arc<RunnerEnvironmentClient>,
}

impl ResolvedRunner {
    pub(crate) fn new(env: Arc<RunnerEnvironmentClient>) -> Self {
        Self { env }
    }

    pub(crate) fn environment(&self) -> &Arc<RunnerEnvironmentClient> {
        &self.env
    }

    pub fn token(&self) -> &RunnerToken {
        self.env.token()
    }

    pub fn method_names(&self) -> &[String] {
        self.env.method_names()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.env.has_method(method)
    }

    pub async fn call(&self, method: &str, args: Vec<RunnerValue>) -> Result<RunnerValue> {
        self.env.execute(method, args).await
    }

    /// Calls with plain-data arguments and decodes a plain-data result.
    ///
    /// `args` serializing to an array spreads into positional arguments;
    /// `()` means no arguments.
    pub async fn call_json<T: DeserializeOwned>(&self, method: &str, args: impl Serialize) -> Result<T> {
        let args = match serde_json::to_value(args)? {
            Value::Null => Vec::new(),
            Value::Array(items) => items.into_iter().map(RunnerValue::Json).collect(),
            single => vec![RunnerValue::Json(single)],
        };
        self.call(method, args).await?.parse()
    }

    pub async fn clone_control(&self) -> Result<ResolvedRunner> {
        Ok(Self::new(self.env.clone_control().await?))
    }

    /// The next time this proxy is sent to a peer, its link moves with it
    /// instead of being cloned.
    pub fn mark_for_transfer(self) -> Self {
        self.env.mark_for_transfer();
        self
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.env.disconnect().await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.env.destroy().await
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        self.env.closed_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_reason().is_some()
    }
}

impl fmt::Debug for ResolvedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRunner")
            .field("token", self.token())
            .field("closed", &self.closed_reason())
            .finish()
    }
}
