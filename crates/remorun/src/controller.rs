//! # Action Controller
//!
//! Request/response correlation on top of a `ConnectionChannel`.
//!
//! Every request gets a fresh `ActionId` from a monotonic generator and parks a
//! oneshot in the pending table. Inbound actions whose id matches a pending
//! entry complete it; everything else is forwarded to the controller's own
//! handlers.
//!
//! ## Invariants
//!
//! - A pending entry is removed before it is completed, so every request is
//!   resolved exactly once.
//! - When the channel closes, every pending request is rejected with the
//!   close reason and the table is left empty.
//! - Requests flow one way per controller: a side that answers requests never
//!   issues its own on the same controller, so ids cannot collide.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::action::Action;
use crate::action::ActionId;
use crate::action::Packet;
use crate::action::TransferList;
use crate::channel::ChannelEvent;
use crate::channel::ConnectionChannel;
use crate::channel::Handler;
use crate::channel::HandlerId;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Result;

struct ControllerInner {
    channel: ConnectionChannel,
    pending: DashMap<ActionId, oneshot::Sender<Result<Packet>>>,
    seq_gen: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler)>>,
    next_handler: AtomicU64,
    channel_handler: Mutex<Option<HandlerId>>,
}

#[derive(Clone)]
pub struct ActionController {
    inner: Arc<ControllerInner>,
}

impl ActionController {
    /// Attaches to `channel`. Does not run it.
    pub fn new(channel: ConnectionChannel) -> Self {
        let inner = Arc::new(ControllerInner {
            channel: channel.clone(),
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(0),
            channel_handler: Mutex::new(None),
        });

        let weak: Weak<ControllerInner> = Arc::downgrade(&inner);
        let id = channel.add_handler(move |event| {
            if let Some(inner) = weak.upgrade() {
                ActionController { inner }.handle_event(event);
            }
        });
        *inner.channel_handler.lock() = Some(id);

        Self { inner }
    }

    pub fn channel(&self) -> &ConnectionChannel {
        &self.inner.channel
    }

    fn handle_event(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Action(packet) => {
                if let Some(id) = packet.action.id {
                    if let Some((_, tx)) = self.inner.pending.remove(&id) {
                        // Receiver gone means the caller stopped waiting.
                        let _ = tx.send(Ok(packet.clone()));
                        return;
                    }
                }
            }
            ChannelEvent::Closed(reason) => {
                self.reject_resolving_all_actions(Error::connection_closed(
                    *reason,
                    "connection closed while awaiting a response",
                ));
            }
        }

        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Receives every event that is not a response to one of our requests.
    pub fn add_handler(&self, handler: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: u64) {
        self.inner.handlers.lock().retain(|(h, _)| *h != id);
    }

    fn next_id(&self) -> ActionId {
        ActionId(self.inner.seq_gen.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends `action` with a fresh id and waits for the matching response.
    pub async fn resolve_action(&self, action: Action, transfer: TransferList) -> Result<Packet> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        if let Err(e) = self.inner.channel.send_action(action.with_id(id), transfer) {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(Error::connection_closed(
                    DisconnectReason::ConnectionLost,
                    "response channel dropped",
                ))
            }
        }
    }

    /// Fire-and-forget.
    pub fn send_action(&self, action: Action, transfer: TransferList) -> Result<()> {
        self.inner.channel.send_action(action, transfer)
    }

    /// Sends a response. The action must carry the id of the request.
    pub fn send_action_response(&self, action: Action, transfer: TransferList) -> Result<()> {
        if action.id.is_none() {
            return Err(Error::unexpected(format!(
                "response \"{}\" has no correlation id",
                action.kind
            )));
        }
        self.inner.channel.send_action(action, transfer)
    }

    pub fn reject_resolving_all_actions(&self, error: Error) {
        let keys: Vec<ActionId> = self.inner.pending.iter().map(|e| *e.key()).collect();
        if !keys.is_empty() {
            tracing::debug!(pending = keys.len(), error = %error, "rejecting pending actions");
        }
        for key in keys {
            if let Some((_, tx)) = self.inner.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Rejects everything pending with `reason` and tears the channel down.
    pub async fn close(&self, reason: DisconnectReason, save_open: bool) {
        self.reject_resolving_all_actions(Error::connection_closed(reason, "connection closed"));
        if let Some(id) = self.inner.channel_handler.lock().take() {
            self.inner.channel.remove_handler(id);
        }
        self.inner.handlers.lock().clear();
        self.inner.channel.destroy(save_open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Port;
    use rand::seq::SliceRandom;

    /// Answers every request on `channel` with its own id, in shuffled order
    /// once `batch` requests have arrived.
    fn shuffled_echo(channel: ConnectionChannel, batch: usize) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let responder = channel.clone();
        channel.add_handler(move |event| {
            let ChannelEvent::Action(packet) = event else {
                return;
            };
            let ready = {
                let mut received = received.lock();
                received.push(packet.action.clone());
                if received.len() < batch {
                    return;
                }
                let mut ready: Vec<Action> = received.drain(..).collect();
                ready.shuffle(&mut rand::thread_rng());
                ready
            };
            for request in ready {
                let echo = request.field("n").cloned().unwrap_or_default();
                let id = request.id.expect("request id");
                let response = Action::new("ECHOED").with_id(id).with_field("n", echo);
                responder.send_action(response, TransferList::new()).expect("respond");
            }
        });
    }

    #[tokio::test]
    async fn test_responses_resolve_their_own_requests() {
        let (a, b) = Port::pair();
        let client = ConnectionChannel::new(a);
        let server = ConnectionChannel::new(b);
        let controller = ActionController::new(client.clone());
        shuffled_echo(server.clone(), 16);
        client.run().expect("run client");
        server.run().expect("run server");

        let calls = (0..16u64).map(|n| {
            let controller = controller.clone();
            async move {
                let request = Action::new("ECHO").with_field("n", n);
                let response = controller
                    .resolve_action(request, TransferList::new())
                    .await
                    .expect("response");
                (n, response.action.field("n").and_then(|v| v.as_u64()))
            }
        });

        for (sent, echoed) in futures::future::join_all(calls).await {
            assert_eq!(Some(sent), echoed);
        }
        assert_eq!(controller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_everything_pending() {
        let (a, b) = Port::pair();
        let client = ConnectionChannel::new(a);
        let silent = ConnectionChannel::new(b);
        let controller = ActionController::new(client.clone());
        client.run().expect("run");
        silent.run().expect("run");

        let waiting: Vec<_> = (0..3)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller
                        .resolve_action(Action::new("NEVER_ANSWERED"), TransferList::new())
                        .await
                })
            })
            .collect();

        while controller.pending_count() < 3 {
            tokio::task::yield_now().await;
        }
        silent.destroy(false).await;

        for handle in waiting {
            let err = handle.await.expect("join").expect_err("rejected");
            assert_eq!(err.disconnect_reason(), Some(DisconnectReason::ConnectionLost));
        }
        assert_eq!(controller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_requires_id() {
        let (a, _b) = Port::pair();
        let channel = ConnectionChannel::new(a);
        channel.run().expect("run");
        let controller = ActionController::new(channel);

        assert!(
            controller
                .send_action_response(Action::new("ORPHAN"), TransferList::new())
                .is_err()
        );
        assert!(
            controller
                .send_action_response(Action::new("ANSWER").with_id(ActionId(9)), TransferList::new())
                .is_ok()
        );
    }
}
