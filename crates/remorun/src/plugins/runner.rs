use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use super::Cancel;
use super::PluginOutcome;
use super::Received;
use super::TransferContext;
use super::TransferPlugin;
use super::TransferPluginData;
use super::Transferred;
use crate::environment::ResolvedRunner;
use crate::environment::RunnerEnvironmentClient;
use crate::error::Error;
use crate::error::Result;
use crate::runner::RunnerToken;
use crate::value::RunnerValue;

const RUNNER: &str = "RUNNER";

#[derive(Serialize, Deserialize)]
struct RunnerReference {
    token: RunnerToken,
    connection: Value,
}

/// Runner references: proxies are cloned or moved, local instances are
/// exposed on a new link.
pub struct RunnerTransferPlugin;

impl RunnerTransferPlugin {
    /// Opens (or gives away) a link to the runner in `value` for the peer at
    /// the other end of `ctx`.
    pub(crate) async fn transfer_reference(ctx: &TransferContext, value: RunnerValue) -> Result<(RunnerToken, Value, Cancel)> {
        match value {
            RunnerValue::Runner(runner) => {
                let env = runner.environment().clone();
                let (connection, cancel) = env.resolve_or_transfer_control(ctx).await?;
                Ok((env.token().clone(), connection, cancel))
            }
            RunnerValue::Local(local) => ctx.scope.expose(&local, ctx),
            other => Err(Error::data_transfer(format!(
                "expected a runner, got {}",
                other.kind_name()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl TransferPlugin for RunnerTransferPlugin {
    async fn transfer_data(&self, ctx: &TransferContext, value: RunnerValue) -> PluginOutcome<Transferred, RunnerValue> {
        if !matches!(value, RunnerValue::Runner(_) | RunnerValue::Local(_)) {
            return PluginOutcome::CannotProcess(value);
        }
        PluginOutcome::Processed(transfer(ctx, value).await)
    }

    async fn receive_data(
        &self,
        ctx: &TransferContext,
        data: TransferPluginData,
    ) -> PluginOutcome<Received, TransferPluginData> {
        if data.kind != RUNNER {
            return PluginOutcome::CannotProcess(data);
        }
        PluginOutcome::Processed(receive(ctx, data).await)
    }
}

async fn transfer(ctx: &TransferContext, value: RunnerValue) -> Result<Transferred> {
    let (token, connection, cancel) = RunnerTransferPlugin::transfer_reference(ctx, value).await?;
    Ok(Transferred {
        data: TransferPluginData::new(RUNNER, serde_json::to_value(RunnerReference { token, connection })?),
        cancel: Some(cancel),
    })
}

async fn receive(ctx: &TransferContext, data: TransferPluginData) -> Result<Received> {
    let RunnerReference { token, connection } = serde_json::from_value(data.data)
        .map_err(|e| Error::data_transfer(format!("invalid runner reference: {}", e)))?;
    let channel = ctx
        .strategy
        .accept_connection(&ctx.channel, &connection, ctx.transfer())?;
    // Known tokens skip the metadata round trip.
    let methods = ctx.scope.catalog.get(&token).map(|d| d.method_names().to_vec());
    let env = RunnerEnvironmentClient::init(ctx.scope.clone(), ctx.strategy.clone(), channel, token, methods).await?;
    ctx.note_received(env.clone());

    let owned = env.clone();
    Ok(Received {
        value: RunnerValue::Runner(ResolvedRunner::new(env)),
        cancel: Some(Cancel::new(move || async move { owned.disconnect().await })),
    })
}
