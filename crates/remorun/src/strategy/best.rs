//! # Strategy Negotiation
//!
//! Both ends of a fresh resolver transport agree on one connection strategy
//! before any runner traffic flows.
//!
//! ```text
//!  client                          host
//!    |---- PING ------------------->|      (either side may start first;
//!    |<--- PONG --------------------|       the host pings after a grace
//!    |---- CONNECT {strategies} --->|       period if it hears nothing)
//!    |<--- CONNECTED {strategies} --|
//! ```
//!
//! The client sends `CONNECT` exactly once, on the first `PING` or `PONG` it
//! sees. The choice is the first entry of the client's list that the host also
//! supports, computed independently on both sides from the same two lists.
//!
//! The handshake channel is destroyed with `save_open`, and the steady-state
//! channel is a fresh one over the same transport.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use super::ConnectionStrategy;
use super::StrategyKind;
use crate::action::Action;
use crate::action::TransferList;
use crate::channel::ChannelEvent;
use crate::channel::ConnectionChannel;
use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::transport::Transport;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum HandshakeAction {
    Ping,
    Pong,
    Connect { strategies: Vec<StrategyKind> },
    Connected { strategies: Vec<StrategyKind> },
}

/// First client-preferred strategy the host also supports.
pub fn choose_strategy(client: &[StrategyKind], host: &[StrategyKind]) -> Option<StrategyKind> {
    client.iter().find(|kind| host.contains(kind)).cloned()
}

fn no_common_strategy(client: &[StrategyKind], host: &[StrategyKind]) -> Error {
    let list = |kinds: &[StrategyKind]| {
        kinds
            .iter()
            .map(StrategyKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    Error::CommonStrategy(Failure::new(format!(
        "no common connection strategy: client supports [{}], host supports [{}]",
        list(client),
        list(host)
    )))
}

/// Outcome of a successful handshake.
pub struct StrategyResolution {
    pub strategy: Arc<dyn ConnectionStrategy>,
    /// Steady-state channel over the negotiated transport. Not yet running.
    pub channel: ConnectionChannel,
}

type Settle = Arc<Mutex<Option<oneshot::Sender<Result<StrategyKind>>>>>;

fn settle(slot: &Settle, result: Result<StrategyKind>) {
    if let Some(tx) = slot.lock().take() {
        let _ = tx.send(result);
    }
}

fn send(channel: &ConnectionChannel, action: &HandshakeAction) {
    let sent = Action::from_typed(action).and_then(|a| channel.send_action(a, TransferList::new()));
    if let Err(e) = sent {
        tracing::debug!(error = %e, ?action, "handshake send failed");
    }
}

fn kinds(strategies: &[Arc<dyn ConnectionStrategy>]) -> Vec<StrategyKind> {
    strategies.iter().map(|s| s.kind()).collect()
}

fn pick(strategies: &[Arc<dyn ConnectionStrategy>], kind: &StrategyKind) -> Result<Arc<dyn ConnectionStrategy>> {
    strategies
        .iter()
        .find(|s| s.kind() == *kind)
        .cloned()
        .ok_or_else(|| Error::unexpected(format!("negotiated strategy {} is not configured", kind)))
}

/// Waits for the handshake outcome, then swaps in the steady-state channel.
async fn finish(
    transport: Arc<dyn Transport>,
    handshake: ConnectionChannel,
    rx: oneshot::Receiver<Result<StrategyKind>>,
    strategies: &[Arc<dyn ConnectionStrategy>],
) -> Result<StrategyResolution> {
    let outcome = rx.await.unwrap_or_else(|_| {
        Err(Error::unexpected("handshake ended without a result"))
    });
    handshake.destroy(true).await;

    let kind = outcome?;
    Ok(StrategyResolution {
        strategy: pick(strategies, &kind)?,
        channel: ConnectionChannel::from_shared(transport),
    })
}

pub struct BestStrategyResolverClient {
    transport: Arc<dyn Transport>,
    strategies: Vec<Arc<dyn ConnectionStrategy>>,
}

impl BestStrategyResolverClient {
    /// `strategies` in order of preference.
    pub fn new(transport: Arc<dyn Transport>, strategies: Vec<Arc<dyn ConnectionStrategy>>) -> Self {
        Self {
            transport,
            strategies,
        }
    }

    pub async fn resolve(&self) -> Result<StrategyResolution> {
        let ours = kinds(&self.strategies);
        let channel = ConnectionChannel::from_shared(self.transport.clone());
        let (tx, rx) = oneshot::channel();
        let slot: Settle = Arc::new(Mutex::new(Some(tx)));
        let connect_sent = Arc::new(AtomicBool::new(false));

        {
            let responder = channel.clone();
            let slot = slot.clone();
            let ours = ours.clone();
            channel.add_handler(move |event| match event {
                ChannelEvent::Action(packet) => match packet.action.to_typed::<HandshakeAction>() {
                    Ok(HandshakeAction::Ping | HandshakeAction::Pong) => {
                        if !connect_sent.swap(true, Ordering::SeqCst) {
                            send(&responder, &HandshakeAction::Connect {
                                strategies: ours.clone(),
                            });
                        }
                    }
                    Ok(HandshakeAction::Connected { strategies }) => {
                        let result = choose_strategy(&ours, &strategies)
                            .ok_or_else(|| no_common_strategy(&ours, &strategies));
                        settle(&slot, result);
                    }
                    Ok(HandshakeAction::Connect { .. }) | Err(_) => {}
                },
                ChannelEvent::Closed(reason) => settle(
                    &slot,
                    Err(Error::connection_closed(*reason, "transport closed during handshake")),
                ),
            });
        }

        channel.run()?;
        send(&channel, &HandshakeAction::Ping);

        let resolution = finish(self.transport.clone(), channel, rx, &self.strategies).await?;
        tracing::debug!(strategy = %resolution.strategy.kind(), "client negotiated strategy");
        Ok(resolution)
    }
}

pub struct BestStrategyResolverHost {
    transport: Arc<dyn Transport>,
    strategies: Vec<Arc<dyn ConnectionStrategy>>,
    grace: Duration,
}

impl BestStrategyResolverHost {
    pub fn new(transport: Arc<dyn Transport>, strategies: Vec<Arc<dyn ConnectionStrategy>>) -> Self {
        Self {
            transport,
            strategies,
            grace: Duration::from_millis(100),
        }
    }

    /// How long to wait for the client's `PING` before pinging it.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub async fn resolve(&self) -> Result<StrategyResolution> {
        let ours = kinds(&self.strategies);
        let channel = ConnectionChannel::from_shared(self.transport.clone());
        let (tx, rx) = oneshot::channel();
        let slot: Settle = Arc::new(Mutex::new(Some(tx)));
        let heard = Arc::new(AtomicBool::new(false));

        {
            let responder = channel.clone();
            let slot = slot.clone();
            let heard = heard.clone();
            let ours = ours.clone();
            channel.add_handler(move |event| match event {
                ChannelEvent::Action(packet) => {
                    heard.store(true, Ordering::SeqCst);
                    match packet.action.to_typed::<HandshakeAction>() {
                        Ok(HandshakeAction::Ping) => send(&responder, &HandshakeAction::Pong),
                        Ok(HandshakeAction::Connect { strategies }) => {
                            send(&responder, &HandshakeAction::Connected {
                                strategies: ours.clone(),
                            });
                            let result = choose_strategy(&strategies, &ours)
                                .ok_or_else(|| no_common_strategy(&strategies, &ours));
                            settle(&slot, result);
                        }
                        Ok(HandshakeAction::Pong | HandshakeAction::Connected { .. }) | Err(_) => {}
                    }
                }
                ChannelEvent::Closed(reason) => settle(
                    &slot,
                    Err(Error::connection_closed(*reason, "transport closed during handshake")),
                ),
            });
        }

        channel.run()?;

        {
            let channel = channel.clone();
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if !heard.load(Ordering::SeqCst) && channel.is_running() {
                    tracing::debug!("client silent after grace period, pinging");
                    send(&channel, &HandshakeAction::Ping);
                }
            });
        }

        let resolution = finish(self.transport.clone(), channel, rx, &self.strategies).await?;
        tracing::debug!(strategy = %resolution.strategy.kind(), "host negotiated strategy");
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Side;
    use crate::strategy::builtin;
    use crate::transport::Port;

    fn strategies(kinds: &[StrategyKind], side: Side) -> Vec<Arc<dyn ConnectionStrategy>> {
        kinds
            .iter()
            .map(|k| builtin(k, side).expect("builtin"))
            .collect()
    }

    async fn negotiate(
        client: &[StrategyKind],
        host: &[StrategyKind],
        client_delay: Duration,
    ) -> (Result<StrategyKind>, Result<StrategyKind>) {
        let (a, b) = Port::pair();
        let client = BestStrategyResolverClient::new(Arc::new(a), strategies(client, Side::Client));
        let host = BestStrategyResolverHost::new(Arc::new(b), strategies(host, Side::Host))
            .with_grace(Duration::from_millis(20));

        let client_side = async {
            tokio::time::sleep(client_delay).await;
            client.resolve().await.map(|r| r.strategy.kind())
        };
        let host_side = async { host.resolve().await.map(|r| r.strategy.kind()) };
        tokio::join!(client_side, host_side)
    }

    #[test]
    fn test_client_order_wins() {
        use StrategyKind::*;
        assert_eq!(
            choose_strategy(&[MessageChannel, RepeatConnection], &[RepeatConnection, MessageChannel]),
            Some(MessageChannel)
        );
        assert_eq!(choose_strategy(&[RepeatConnection], &[MessageChannel]), None);
    }

    #[tokio::test]
    async fn test_both_sides_agree_on_client_preference() {
        use StrategyKind::*;
        let (client, host) = negotiate(
            &[MessageChannel, RepeatConnection],
            &[RepeatConnection, MessageChannel],
            Duration::ZERO,
        )
        .await;
        assert_eq!(client.expect("client"), MessageChannel);
        assert_eq!(host.expect("host"), MessageChannel);
    }

    #[tokio::test]
    async fn test_late_client_is_pinged_by_host() {
        use StrategyKind::*;
        let (client, host) = negotiate(
            &[RepeatConnection],
            &[MessageChannel, RepeatConnection],
            Duration::from_millis(60),
        )
        .await;
        assert_eq!(client.expect("client"), RepeatConnection);
        assert_eq!(host.expect("host"), RepeatConnection);
    }

    #[tokio::test]
    async fn test_disjoint_lists_fail_on_both_sides() {
        use StrategyKind::*;
        let (client, host) = negotiate(&[MessageChannel], &[RepeatConnection], Duration::ZERO).await;
        assert!(matches!(client, Err(Error::CommonStrategy(_))));
        assert!(matches!(host, Err(Error::CommonStrategy(_))));
    }
}
