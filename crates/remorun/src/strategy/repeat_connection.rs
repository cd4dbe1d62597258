use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use super::ConnectionStrategy;
use super::HandOver;
use super::PreparedConnection;
use super::Side;
use super::StrategyKind;
use crate::action::TransferList;
use crate::channel::Bridge;
use crate::channel::ConnectionChannel;
use crate::channel::ProxyId;
use crate::error::Error;
use crate::error::Result;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyAttach {
    proxy_id: ProxyId,
}

/// Every link is a proxy over the channel it is opened on.
///
/// Ids are prefixed with the opening side, so both ends can open links on the
/// same channel without coordinating. A proxy cannot leave the channel it
/// lives on, so handing one over opens a fresh proxy on the target and
/// bridges the two.
#[derive(Debug)]
pub struct RepeatConnectionStrategy {
    side: Side,
    next_id: AtomicU64,
}

impl RepeatConnectionStrategy {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            next_id: AtomicU64::new(0),
        }
    }
}

impl ConnectionStrategy for RepeatConnectionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RepeatConnection
    }

    fn open_connection(&self, root: &ConnectionChannel, _transfer: &TransferList) -> Result<PreparedConnection> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let proxy_id = ProxyId(format!("{}:{}", self.side.prefix(), n));
        Ok(PreparedConnection {
            channel: ConnectionChannel::proxy(root, proxy_id.clone()),
            attach: serde_json::to_value(ProxyAttach { proxy_id })?,
        })
    }

    fn accept_connection(
        &self,
        root: &ConnectionChannel,
        attach: &Value,
        _transfer: &TransferList,
    ) -> Result<ConnectionChannel> {
        let ProxyAttach { proxy_id } = serde_json::from_value(attach.clone())
            .map_err(|e| Error::data_transfer(format!("invalid proxy attach data: {}", e)))?;
        Ok(ConnectionChannel::proxy(root, proxy_id))
    }

    fn hand_over(
        &self,
        target: &ConnectionChannel,
        channel: &ConnectionChannel,
        transfer: &TransferList,
    ) -> Result<HandOver> {
        let prepared = self.open_connection(target, transfer)?;
        let near = if channel.is_destroyed() {
            channel.successor()
        } else {
            channel.clone()
        };
        let bridge = Bridge::splice(near, prepared.channel, crate::connect::ends_link)?;
        Ok(HandOver {
            attach: prepared.attach,
            bridge: Some(bridge),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Port;

    #[test]
    fn test_ids_are_namespaced_by_side() {
        let (a, _b) = Port::pair();
        let root = ConnectionChannel::new(a);
        let transfer = TransferList::new();
        let client = RepeatConnectionStrategy::new(Side::Client);
        let host = RepeatConnectionStrategy::new(Side::Host);

        let first = client.open_connection(&root, &transfer).expect("open");
        let second = client.open_connection(&root, &transfer).expect("open");
        let hosted = host.open_connection(&root, &transfer).expect("open");

        assert_eq!(first.attach, serde_json::json!({ "proxyId": "c:0" }));
        assert_eq!(second.attach, serde_json::json!({ "proxyId": "c:1" }));
        assert_eq!(hosted.attach, serde_json::json!({ "proxyId": "h:0" }));
        assert!(transfer.is_empty());

        let accepted = host
            .accept_connection(&root, &first.attach, &transfer)
            .expect("accept");
        assert_eq!(accepted.proxy_id(), Some(&ProxyId("c:0".into())));
    }

    #[tokio::test]
    async fn test_hand_over_bridges_into_a_new_proxy() {
        let (a, b) = Port::pair();
        let root = ConnectionChannel::new(a);
        let remote = ConnectionChannel::new(b);
        root.run().expect("run");
        remote.run().expect("run");
        let transfer = TransferList::new();
        let client = RepeatConnectionStrategy::new(Side::Client);
        let host = RepeatConnectionStrategy::new(Side::Host);

        // A link the host opened to us, and one we use to reach a runner.
        let runner_link = host.open_connection(&remote, &transfer).expect("open");
        let held = client
            .accept_connection(&root, &runner_link.attach, &transfer)
            .expect("accept");
        let target = client.open_connection(&root, &transfer).expect("open");
        let target_remote = host
            .accept_connection(&remote, &target.attach, &transfer)
            .expect("accept");
        target.channel.run().expect("run");
        target_remote.run().expect("run");

        let handed = client
            .hand_over(&target.channel, &held, &transfer)
            .expect("hand over");
        assert_eq!(handed.attach, serde_json::json!({ "proxyId": "c:1" }));
        assert!(transfer.is_empty());

        // The peer behind the target attaches and talks to the runner's link.
        let attached = host
            .accept_connection(&target_remote, &handed.attach, &transfer)
            .expect("attach");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner_link.channel.add_handler(move |event| {
            if let crate::channel::ChannelEvent::Action(packet) = event {
                let _ = tx.send(packet.action.kind.clone());
            }
        });
        runner_link.channel.run().expect("run");
        attached.run().expect("run");
        attached
            .send_action(crate::action::Action::new("RELAYED"), TransferList::new())
            .expect("send");
        assert_eq!(rx.recv().await.as_deref(), Some("RELAYED"));

        let bridge = handed.bridge.expect("relayed through a bridge");
        let back = bridge.dismantle().await;
        assert_eq!(back.proxy_id(), Some(&ProxyId("h:0".into())));
    }
}
