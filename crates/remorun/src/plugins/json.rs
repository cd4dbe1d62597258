use super::PluginOutcome;
use super::Received;
use super::TransferContext;
use super::TransferPlugin;
use super::TransferPluginData;
use super::Transferred;
use crate::value::RunnerValue;

const JSON: &str = "JSON";

/// Plain data, copied as-is. Sits last in the default chain.
pub struct JsonPlugin;

#[async_trait::async_trait]
impl TransferPlugin for JsonPlugin {
    async fn transfer_data(&self, _ctx: &TransferContext, value: RunnerValue) -> PluginOutcome<Transferred, RunnerValue> {
        match value {
            RunnerValue::Json(data) => PluginOutcome::Processed(Ok(Transferred {
                data: TransferPluginData::new(JSON, data),
                cancel: None,
            })),
            other => PluginOutcome::CannotProcess(other),
        }
    }

    async fn receive_data(
        &self,
        _ctx: &TransferContext,
        data: TransferPluginData,
    ) -> PluginOutcome<Received, TransferPluginData> {
        if data.kind != JSON {
            return PluginOutcome::CannotProcess(data);
        }
        PluginOutcome::Processed(Ok(Received {
            value: RunnerValue::Json(data.data),
            cancel: None,
        }))
    }
}
