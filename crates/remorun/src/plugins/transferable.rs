use serde::Deserialize;
use serde::Serialize;

use super::PluginOutcome;
use super::Received;
use super::TransferContext;
use super::TransferPlugin;
use super::TransferPluginData;
use super::Transferred;
use crate::action::Transferable;
use crate::error::Error;
use crate::error::Result;
use crate::value::RunnerValue;

const TRANSFERABLE: &str = "TRANSFERABLE";

#[derive(Serialize, Deserialize)]
struct Slot {
    index: usize,
}

/// Buffers move through the packet's transfer list instead of being encoded.
pub struct TransferablePlugin;

#[async_trait::async_trait]
impl TransferPlugin for TransferablePlugin {
    async fn transfer_data(&self, ctx: &TransferContext, value: RunnerValue) -> PluginOutcome<Transferred, RunnerValue> {
        let RunnerValue::Buffer(bytes) = value else {
            return PluginOutcome::CannotProcess(value);
        };
        let index = ctx.transfer().push(Transferable::Buffer(bytes));
        let result = serde_json::to_value(Slot { index })
            .map(|data| Transferred {
                data: TransferPluginData::new(TRANSFERABLE, data),
                cancel: None,
            })
            .map_err(Error::from);
        PluginOutcome::Processed(result)
    }

    async fn receive_data(
        &self,
        ctx: &TransferContext,
        data: TransferPluginData,
    ) -> PluginOutcome<Received, TransferPluginData> {
        if data.kind != TRANSFERABLE {
            return PluginOutcome::CannotProcess(data);
        }
        PluginOutcome::Processed(receive(ctx, data))
    }
}

fn receive(ctx: &TransferContext, data: TransferPluginData) -> Result<Received> {
    let Slot { index } = serde_json::from_value(data.data)
        .map_err(|e| Error::data_transfer(format!("invalid transferable slot: {}", e)))?;
    Ok(Received {
        value: RunnerValue::Buffer(ctx.transfer().take_buffer(index)?),
        cancel: None,
    })
}
