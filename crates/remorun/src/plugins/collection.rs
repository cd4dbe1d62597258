use std::collections::BTreeMap;

use serde_json::Map;
use serde_json::Value;

use super::PluginOutcome;
use super::Received;
use super::TransferContext;
use super::TransferPlugin;
use super::TransferPluginData;
use super::Transferred;
use crate::error::Error;
use crate::error::Result;
use crate::value::RunnerValue;

const ARRAY: &str = "ARRAY";
const OBJECT: &str = "OBJECT";

fn decode_items(data: Value) -> Result<Vec<TransferPluginData>> {
    serde_json::from_value(data).map_err(|e| Error::data_transfer(format!("invalid array payload: {}", e)))
}

async fn transfer_array(ctx: &TransferContext, items: Vec<RunnerValue>) -> Result<Transferred> {
    let (datas, cancel) = ctx.transfer_all(items).await?;
    Ok(Transferred {
        data: TransferPluginData::new(ARRAY, serde_json::to_value(datas)?),
        cancel,
    })
}

async fn receive_array(ctx: &TransferContext, data: Value) -> Result<Received> {
    let (values, cancel) = ctx.receive_all(decode_items(data)?).await?;
    Ok(Received {
        value: RunnerValue::Array(values),
        cancel,
    })
}

async fn transfer_object(ctx: &TransferContext, entries: BTreeMap<String, RunnerValue>) -> Result<Transferred> {
    let (keys, values): (Vec<String>, Vec<RunnerValue>) = entries.into_iter().unzip();
    let (datas, cancel) = ctx.transfer_all(values).await?;
    let mut object = Map::new();
    for (key, data) in keys.into_iter().zip(datas) {
        object.insert(key, serde_json::to_value(data)?);
    }
    Ok(Transferred {
        data: TransferPluginData::new(OBJECT, Value::Object(object)),
        cancel,
    })
}

async fn receive_object(ctx: &TransferContext, data: Value) -> Result<Received> {
    let Value::Object(object) = data else {
        return Err(Error::data_transfer("object payload is not a JSON object"));
    };
    let mut keys = Vec::with_capacity(object.len());
    let mut datas = Vec::with_capacity(object.len());
    for (key, value) in object {
        keys.push(key);
        datas.push(serde_json::from_value::<TransferPluginData>(value)?);
    }
    let (values, cancel) = ctx.receive_all(datas).await?;
    Ok(Received {
        value: RunnerValue::Object(keys.into_iter().zip(values).collect()),
        cancel,
    })
}

/// Transfers every element; all or none.
pub struct ArrayPlugin;

#[async_trait::async_trait]
impl TransferPlugin for ArrayPlugin {
    async fn transfer_data(&self, ctx: &TransferContext, value: RunnerValue) -> PluginOutcome<Transferred, RunnerValue> {
        match value {
            RunnerValue::Array(items) => PluginOutcome::Processed(transfer_array(ctx, items).await),
            other => PluginOutcome::CannotProcess(other),
        }
    }

    async fn receive_data(
        &self,
        ctx: &TransferContext,
        data: TransferPluginData,
    ) -> PluginOutcome<Received, TransferPluginData> {
        if data.kind != ARRAY {
            return PluginOutcome::CannotProcess(data);
        }
        PluginOutcome::Processed(receive_array(ctx, data.data).await)
    }
}

/// Transfers every property value; all or none. Keys are kept as-is.
pub struct ObjectPlugin;

#[async_trait::async_trait]
impl TransferPlugin for ObjectPlugin {
    async fn transfer_data(&self, ctx: &TransferContext, value: RunnerValue) -> PluginOutcome<Transferred, RunnerValue> {
        match value {
            RunnerValue::Object(entries) => PluginOutcome::Processed(transfer_object(ctx, entries).await),
            other => PluginOutcome::CannotProcess(other),
        }
    }

    async fn receive_data(
        &self,
        ctx: &TransferContext,
        data: TransferPluginData,
    ) -> PluginOutcome<Received, TransferPluginData> {
        if data.kind != OBJECT {
            return PluginOutcome::CannotProcess(data);
        }
        PluginOutcome::Processed(receive_object(ctx, data.data).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginsResolver;
    use crate::plugins::tests::context;

    #[tokio::test]
    async fn test_nested_collections_keep_their_shape() {
        let ctx = context(PluginsResolver::default_plugins());
        let value = RunnerValue::Object(BTreeMap::from([
            ("name".to_string(), RunnerValue::Json(Value::from("calc"))),
            (
                "payload".to_string(),
                RunnerValue::Array(vec![
                    RunnerValue::Buffer(vec![7, 7]),
                    RunnerValue::Json(serde_json::json!({ "deep": [1, 2] })),
                ]),
            ),
        ]));

        let sent = ctx.transfer_nested(value).await.expect("transfer");
        assert_eq!(sent.data.kind, "OBJECT");
        assert!(sent.cancel.is_none());
        assert_eq!(ctx.transfer().len(), 1);

        let received = ctx.receive_nested(sent.data).await.expect("receive");
        let RunnerValue::Object(entries) = received.value else {
            panic!("expected an object");
        };
        assert_eq!(entries["name"].as_json(), Some(&Value::from("calc")));
        let RunnerValue::Array(items) = &entries["payload"] else {
            panic!("expected an array");
        };
        assert!(matches!(&items[0], RunnerValue::Buffer(bytes) if bytes == &vec![7, 7]));
        assert_eq!(items[1].as_json(), Some(&serde_json::json!({ "deep": [1, 2] })));
    }
}
