use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use super::ConnectionStrategy;
use super::HandOver;
use super::PreparedConnection;
use super::StrategyKind;
use crate::action::TransferList;
use crate::action::Transferable;
use crate::channel::ConnectionChannel;
use crate::error::Error;
use crate::error::Result;
use crate::transport::Port;

/// Attach data: index of the port in the packet's transfer list.
#[derive(Serialize, Deserialize)]
struct PortAttach {
    port: usize,
}

/// One fresh `Port` pair per link.
#[derive(Debug, Default)]
pub struct MessageChannelStrategy;

impl MessageChannelStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl ConnectionStrategy for MessageChannelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MessageChannel
    }

    fn open_connection(&self, _root: &ConnectionChannel, transfer: &TransferList) -> Result<PreparedConnection> {
        let (local, remote) = Port::pair();
        let port = transfer.push(Transferable::Port(remote));
        Ok(PreparedConnection {
            channel: ConnectionChannel::new(local),
            attach: serde_json::to_value(PortAttach { port })?,
        })
    }

    fn accept_connection(
        &self,
        _root: &ConnectionChannel,
        attach: &Value,
        transfer: &TransferList,
    ) -> Result<ConnectionChannel> {
        let PortAttach { port } = serde_json::from_value(attach.clone())
            .map_err(|e| Error::data_transfer(format!("invalid port attach data: {}", e)))?;
        Ok(ConnectionChannel::new(transfer.take_port(port)?))
    }

    fn hand_over(
        &self,
        _target: &ConnectionChannel,
        channel: &ConnectionChannel,
        transfer: &TransferList,
    ) -> Result<HandOver> {
        let Some(port) = channel.port() else {
            return Err(Error::data_transfer(
                "only port-backed links can be handed over with MESSAGE_CHANNEL",
            ));
        };
        let port = transfer.push(Transferable::Port(port));
        Ok(HandOver {
            attach: serde_json::to_value(PortAttach { port })?,
            bridge: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::channel::ChannelEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_opened_port_reaches_the_acceptor() {
        let strategy = MessageChannelStrategy::new();
        let (root, _) = Port::pair();
        let root = ConnectionChannel::new(root);
        let transfer = TransferList::new();

        let prepared = strategy.open_connection(&root, &transfer).expect("open");
        let accepted = strategy
            .accept_connection(&root, &prepared.attach, &transfer)
            .expect("accept");
        assert!(strategy.accept_connection(&root, &prepared.attach, &transfer).is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        accepted.add_handler(move |event| {
            if let ChannelEvent::Action(packet) = event {
                let _ = tx.send(packet.action.kind.clone());
            }
        });
        prepared.channel.run().expect("run");
        accepted.run().expect("run");

        prepared
            .channel
            .send_action(Action::new("THROUGH_PORT"), TransferList::new())
            .expect("send");
        assert_eq!(rx.recv().await.as_deref(), Some("THROUGH_PORT"));
    }
}
