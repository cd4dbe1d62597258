//! # Transfer Plugins
//!
//! Converts `RunnerValue`s to and from their wire form, `TransferPluginData`
//! (`{ "type": ..., "data": ... }`), by asking an ordered chain of plugins.
//! The first plugin that does not decline wins. A value no plugin accepts is a
//! `DataTransfer` error.
//!
//! ## Philosophy
//!
//! - **Undo Is Part Of Transfer**: transferring a runner reference opens a
//!   link. Every successful conversion may return a `Cancel` that closes what
//!   it opened, so a failed batch can roll back.
//! - **Collections Are All-Or-Nothing**: arrays, objects and argument lists
//!   go through `batch::map_all_or_cancel`.
//!
//! Default chain: runner references, transferables, arrays, objects, JSON.

mod collection;
mod json;
mod runner;
mod transferable;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::action::TransferList;
use crate::batch::BatchMapper;
use crate::batch::map_all_or_cancel;
use crate::channel::ConnectionChannel;
use crate::context::ResolverContext;
use crate::environment::RunnerEnvironmentClient;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::error::collect_errors;
use crate::strategy::ConnectionStrategy;
use crate::strategy::StrategyKind;
use crate::value::RunnerValue;

pub use collection::ArrayPlugin;
pub use collection::ObjectPlugin;
pub use json::JsonPlugin;
pub use runner::RunnerTransferPlugin;
pub use transferable::TransferablePlugin;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferPluginData {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl TransferPluginData {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Undoes a successful transfer or receive.
pub struct Cancel(Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>);

impl Cancel {
    pub fn new<F, Fut>(undo: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Box::new(move || undo().boxed()))
    }

    pub async fn run(self) -> Result<()> {
        (self.0)().await
    }

    /// Runs every handle concurrently; failures are aggregated.
    pub fn all(cancels: Vec<Cancel>) -> Option<Cancel> {
        if cancels.is_empty() {
            return None;
        }
        Some(Cancel::new(move || async move {
            let results = join_all(cancels.into_iter().map(Cancel::run)).await;
            let mut errors = collect_errors(results);
            match errors.len() {
                0 => Ok(()),
                1 => Err(errors.remove(0)),
                _ => Err(Error::DataTransfer(
                    Failure::new("failed to cancel transferred data").with_errors(errors),
                )),
            }
        }))
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cancel")
    }
}

pub struct Transferred {
    pub data: TransferPluginData,
    pub cancel: Option<Cancel>,
}

pub struct Received {
    pub value: RunnerValue,
    pub cancel: Option<Cancel>,
}

pub enum PluginOutcome<T, V> {
    Processed(Result<T>),
    /// Declined; the input goes to the next plugin.
    CannotProcess(V),
}

#[async_trait::async_trait]
pub trait TransferPlugin: Send + Sync + 'static {
    async fn transfer_data(&self, ctx: &TransferContext, value: RunnerValue) -> PluginOutcome<Transferred, RunnerValue>;

    async fn receive_data(
        &self,
        ctx: &TransferContext,
        data: TransferPluginData,
    ) -> PluginOutcome<Received, TransferPluginData>;
}

/// Everything a plugin needs to move one packet's worth of values.
pub struct TransferContext {
    pub(crate) scope: Arc<ResolverContext>,
    pub(crate) strategy: Arc<dyn ConnectionStrategy>,
    pub(crate) channel: ConnectionChannel,
    transfer: TransferList,
    received: Mutex<Vec<Arc<RunnerEnvironmentClient>>>,
}

impl TransferContext {
    pub(crate) fn new(
        scope: Arc<ResolverContext>,
        strategy: Arc<dyn ConnectionStrategy>,
        channel: ConnectionChannel,
        transfer: TransferList,
    ) -> Self {
        Self {
            scope,
            strategy,
            channel,
            transfer,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Transferables travelling with the packet.
    pub fn transfer(&self) -> &TransferList {
        &self.transfer
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Runs a nested value through the whole chain.
    pub async fn transfer_nested(&self, value: RunnerValue) -> Result<Transferred> {
        self.scope.plugins.transfer_data(self, value).await
    }

    pub async fn receive_nested(&self, data: TransferPluginData) -> Result<Received> {
        self.scope.plugins.receive_data(self, data).await
    }

    pub async fn transfer_all(&self, values: Vec<RunnerValue>) -> Result<(Vec<TransferPluginData>, Option<Cancel>)> {
        self.scope.plugins.transfer_all(self, values).await
    }

    pub async fn receive_all(&self, datas: Vec<TransferPluginData>) -> Result<(Vec<RunnerValue>, Option<Cancel>)> {
        self.scope.plugins.receive_all(self, datas).await
    }

    pub(crate) fn note_received(&self, client: Arc<RunnerEnvironmentClient>) {
        self.received.lock().push(client);
    }

    /// Runner proxies created while receiving through this context.
    pub(crate) fn take_received(&self) -> Vec<Arc<RunnerEnvironmentClient>> {
        std::mem::take(&mut *self.received.lock())
    }
}

pub struct PluginsResolver {
    plugins: Vec<Arc<dyn TransferPlugin>>,
}

impl PluginsResolver {
    pub fn new(plugins: Vec<Arc<dyn TransferPlugin>>) -> Self {
        Self { plugins }
    }

    pub fn default_plugins() -> Vec<Arc<dyn TransferPlugin>> {
        vec![
            Arc::new(RunnerTransferPlugin),
            Arc::new(TransferablePlugin),
            Arc::new(ArrayPlugin),
            Arc::new(ObjectPlugin),
            Arc::new(JsonPlugin),
        ]
    }

    pub async fn transfer_data(&self, ctx: &TransferContext, value: RunnerValue) -> Result<Transferred> {
        let mut value = value;
        for plugin in &self.plugins {
            match plugin.transfer_data(ctx, value).await {
                PluginOutcome::Processed(result) => return result,
                PluginOutcome::CannotProcess(declined) => value = declined,
            }
        }
        Err(Error::data_transfer(format!(
            "unexpected data type: no plugin can transfer a {} value",
            value.kind_name()
        )))
    }

    pub async fn receive_data(&self, ctx: &TransferContext, data: TransferPluginData) -> Result<Received> {
        let mut data = data;
        for plugin in &self.plugins {
            match plugin.receive_data(ctx, data).await {
                PluginOutcome::Processed(result) => return result,
                PluginOutcome::CannotProcess(declined) => data = declined,
            }
        }
        Err(Error::data_transfer(format!(
            "unexpected data type: no plugin can receive \"{}\"",
            data.kind
        )))
    }

    /// Transfers a list all-or-nothing.
    pub async fn transfer_all(
        &self,
        ctx: &TransferContext,
        values: Vec<RunnerValue>,
    ) -> Result<(Vec<TransferPluginData>, Option<Cancel>)> {
        let total = values.len();
        let done = map_all_or_cancel(values, &TransferMapper { resolver: self, ctx })
            .await
            .map_err(|errors| {
                Error::DataTransfer(
                    Failure::new(format!("failed to transfer {} value(s)", total)).with_errors(errors),
                )
            })?;

        let mut datas = Vec::with_capacity(done.len());
        let mut cancels = Vec::new();
        for Transferred { data, cancel } in done {
            datas.push(data);
            cancels.extend(cancel);
        }
        Ok((datas, Cancel::all(cancels)))
    }

    /// Receives a list all-or-nothing.
    pub async fn receive_all(
        &self,
        ctx: &TransferContext,
        datas: Vec<TransferPluginData>,
    ) -> Result<(Vec<RunnerValue>, Option<Cancel>)> {
        let total = datas.len();
        let done = map_all_or_cancel(datas, &ReceiveMapper { resolver: self, ctx })
            .await
            .map_err(|errors| {
                Error::DataTransfer(
                    Failure::new(format!("failed to receive {} value(s)", total)).with_errors(errors),
                )
            })?;

        let mut values = Vec::with_capacity(done.len());
        let mut cancels = Vec::new();
        for Received { value, cancel } in done {
            values.push(value);
            cancels.extend(cancel);
        }
        Ok((values, Cancel::all(cancels)))
    }
}

impl Default for PluginsResolver {
    fn default() -> Self {
        Self::new(Self::default_plugins())
    }
}

struct TransferMapper<'a> {
    resolver: &'a PluginsResolver,
    ctx: &'a TransferContext,
}

#[async_trait::async_trait]
impl<'a> BatchMapper<RunnerValue, Transferred> for TransferMapper<'a> {
    async fn map(&self, _index: usize, item: RunnerValue) -> Result<Transferred> {
        self.resolver.transfer_data(self.ctx, item).await
    }

    async fn cancel_mapped(&self, _index: usize, mapped: Transferred) -> Result<()> {
        match mapped.cancel {
            Some(cancel) => cancel.run().await,
            None => Ok(()),
        }
    }
}

struct ReceiveMapper<'a> {
    resolver: &'a PluginsResolver,
    ctx: &'a TransferContext,
}

#[async_trait::async_trait]
impl<'a> BatchMapper<TransferPluginData, Received> for ReceiveMapper<'a> {
    async fn map(&self, _index: usize, item: TransferPluginData) -> Result<Received> {
        self.resolver.receive_data(self.ctx, item).await
    }

    async fn cancel_mapped(&self, _index: usize, mapped: Received) -> Result<()> {
        match mapped.cancel {
            Some(cancel) => cancel.run().await,
            None => Ok(()),
        }
    }

    /// Unreceived data may hold links the sender opened for us; take them
    /// and close them.
    async fn cancel_rest(&self, index: usize, item: TransferPluginData) -> Result<()> {
        let received = self.map(index, item).await?;
        self.cancel_mapped(index, received).await
    }
}
