use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::ConnectAction;
use crate::action::Action;
use crate::action::ActionId;
use crate::action::Packet;
use crate::action::TransferList;
use crate::channel::ChannelEvent;
use crate::channel::ConnectionChannel;
use crate::controller::ActionController;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Result;
use crate::signal::Flag;

/// Strong type for endpoint identifiers within one host.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// What the host does on behalf of its endpoints.
#[async_trait::async_trait]
pub trait ConnectHostHandler: Send + Sync + 'static {
    /// Answers a `CUSTOM` request arriving on `channel`.
    async fn handle_custom(
        &self,
        channel: &ConnectionChannel,
        payload: Value,
        transfer: TransferList,
    ) -> Result<(Value, TransferList)>;

    /// Destroys the underlying instance. Runs at most once.
    async fn handle_destroy(&self) -> Result<()>;
}

struct Endpoint {
    controller: ActionController,
    was_connected: AtomicBool,
    listening: AtomicBool,
    /// Raised to abandon in-flight requests. Replaced after each interrupt.
    interrupt: Mutex<Flag>,
}

struct HostInner {
    label: String,
    handler: Weak<dyn ConnectHostHandler>,
    endpoints: DashMap<EndpointId, Arc<Endpoint>>,
    next_endpoint: AtomicU64,
    destroying: AtomicBool,
    destroyed: Flag,
}

/// Host half of the connect protocol: one per runner instance, serving any
/// number of endpoints.
///
/// ## Invariants
///
/// - The instance is destroyed exactly once: on `DESTROY`, on the last
///   endpoint leaving, or on `force_destroy()`.
/// - Endpoints that never connected are closed silently.
#[derive(Clone)]
pub struct ConnectHost {
    inner: Arc<HostInner>,
}

impl ConnectHost {
    pub fn new(label: impl Into<String>, handler: Weak<dyn ConnectHostHandler>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                label: label.into(),
                handler,
                endpoints: DashMap::new(),
                next_endpoint: AtomicU64::new(0),
                destroying: AtomicBool::new(false),
                destroyed: Flag::new(),
            }),
        }
    }

    /// Starts serving `channel` as a new endpoint.
    pub fn add_endpoint(&self, channel: ConnectionChannel) -> Result<EndpointId> {
        if self.inner.destroying.load(Ordering::SeqCst) {
            return Err(Error::connection_closed(
                DisconnectReason::RunnerDestroyed,
                format!("runner {} is destroyed", self.inner.label),
            ));
        }

        let id = EndpointId(self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed));
        let controller = ActionController::new(channel.clone());
        let weak = Arc::downgrade(&self.inner);
        controller.add_handler(move |event| {
            if let Some(inner) = weak.upgrade() {
                ConnectHost { inner }.handle_event(id, event);
            }
        });

        self.inner.endpoints.insert(
            id,
            Arc::new(Endpoint {
                controller,
                was_connected: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                interrupt: Mutex::new(Flag::new()),
            }),
        );

        if let Err(e) = channel.run() {
            self.inner.endpoints.remove(&id);
            return Err(e);
        }
        tracing::debug!(runner = %self.inner.label, endpoint = %id, "endpoint added");
        Ok(id)
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    /// Endpoints whose owner has sent `CONNECT` and not given the link away.
    pub fn connected_count(&self) -> usize {
        self.inner
            .endpoints
            .iter()
            .filter(|e| e.value().was_connected.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.is_raised()
    }

    /// Resolves once the instance has been destroyed.
    pub fn destroyed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.inner.destroyed.wait()
    }

    fn endpoint(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.get(&id).map(|e| e.value().clone())
    }

    fn handle_event(&self, id: EndpointId, event: &ChannelEvent) {
        let Some(endpoint) = self.endpoint(id) else {
            return;
        };

        let packet = match event {
            ChannelEvent::Action(packet) => packet,
            ChannelEvent::Closed(reason) => {
                tracing::debug!(runner = %self.inner.label, endpoint = %id, %reason, "endpoint lost");
                let host = self.clone();
                tokio::spawn(async move { host.drop_endpoint(id, None).await });
                return;
            }
        };

        let request = match packet.action.to_typed::<ConnectAction>() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(runner = %self.inner.label, error = %e, "malformed connect action");
                return;
            }
        };
        let reply_to = packet.action.id;

        match request {
            ConnectAction::Connect => {
                endpoint.was_connected.store(true, Ordering::SeqCst);
                endpoint.listening.store(true, Ordering::SeqCst);
            }
            ConnectAction::InterruptListening => {
                endpoint.listening.store(false, Ordering::SeqCst);
                endpoint.was_connected.store(false, Ordering::SeqCst);
                let interrupted = std::mem::replace(&mut *endpoint.interrupt.lock(), Flag::new());
                interrupted.raise();
                Self::respond(&endpoint, reply_to, &ConnectAction::ListeningInterrupted, TransferList::new());
            }
            ConnectAction::Disconnect => {
                let host = self.clone();
                tokio::spawn(async move { host.drop_endpoint(id, reply_to).await });
            }
            ConnectAction::Destroy => {
                let host = self.clone();
                tokio::spawn(async move { host.destroy_by_request(id, reply_to).await });
            }
            ConnectAction::Custom { payload } => {
                if !endpoint.listening.load(Ordering::SeqCst) {
                    tracing::trace!(runner = %self.inner.label, endpoint = %id, "ignoring request on idle endpoint");
                    return;
                }
                self.spawn_custom(endpoint, packet.clone(), reply_to, payload);
            }
            other => {
                tracing::debug!(runner = %self.inner.label, action = ?other, "unexpected action on host");
            }
        }
    }

    fn spawn_custom(&self, endpoint: Arc<Endpoint>, packet: Packet, reply_to: Option<ActionId>, payload: Value) {
        let interrupted = endpoint.interrupt.lock().wait();
        let handler = self.inner.handler.clone();
        let label = self.inner.label.clone();

        tokio::spawn(async move {
            let Some(handler) = handler.upgrade() else {
                return;
            };
            let channel = endpoint.controller.channel().clone();
            let outcome = tokio::select! {
                outcome = handler.handle_custom(&channel, payload, packet.transfer) => outcome,
                _ = interrupted => {
                    tracing::debug!(runner = %label, "request dropped by interrupt");
                    return;
                }
            };

            let (response, transfer) = match outcome {
                Ok((payload, transfer)) => (ConnectAction::CustomResponse { payload }, transfer),
                Err(error) => (
                    ConnectAction::CustomError {
                        error: error.to_serialized(),
                    },
                    TransferList::new(),
                ),
            };
            Self::respond(&endpoint, reply_to, &response, transfer);
        });
    }

    fn respond(endpoint: &Endpoint, reply_to: Option<ActionId>, response: &ConnectAction, transfer: TransferList) {
        let Some(id) = reply_to else {
            return;
        };
        let sent = Action::from_typed(response)
            .and_then(|action| endpoint.controller.send_action_response(action.with_id(id), transfer));
        if let Err(e) = sent {
            tracing::debug!(error = %e, ?response, "could not deliver response");
        }
    }

    /// Graceful or lost endpoint. The last one out destroys the instance.
    ///
    /// Every endpoint counts, not only connected ones: an endpoint that was
    /// interrupted for a transfer, or opened for a clone nobody attached to
    /// yet, is a link still on its way to a new owner.
    async fn drop_endpoint(&self, id: EndpointId, reply_to: Option<ActionId>) {
        let Some((_, endpoint)) = self.inner.endpoints.remove(&id) else {
            return;
        };
        endpoint.interrupt.lock().raise();
        Self::respond(&endpoint, reply_to, &ConnectAction::Disconnected, TransferList::new());
        endpoint
            .controller
            .close(DisconnectReason::RunnerDisconnected, false)
            .await;

        if self.inner.endpoints.is_empty() {
            tracing::debug!(runner = %self.inner.label, "last endpoint left, destroying");
            if let Some(Err(e)) = self.teardown(None).await {
                tracing::warn!(runner = %self.inner.label, error = %e, "runner teardown failed");
            }
        }
    }

    async fn destroy_by_request(&self, id: EndpointId, reply_to: Option<ActionId>) {
        let response = match self.teardown(Some(id)).await {
            Some(Err(error)) => ConnectAction::DestroyedWithError {
                error: error.to_serialized(),
            },
            Some(Ok(())) | None => ConnectAction::DestroyedByRequest,
        };

        if let Some((_, endpoint)) = self.inner.endpoints.remove(&id) {
            Self::respond(&endpoint, reply_to, &response, TransferList::new());
            endpoint
                .controller
                .close(DisconnectReason::RunnerDestroyed, false)
                .await;
        }
    }

    /// Destroys the instance and closes every endpoint except `requester`.
    ///
    /// Returns `None` if another teardown already ran (after waiting for it).
    async fn teardown(&self, requester: Option<EndpointId>) -> Option<Result<()>> {
        if self.inner.destroying.swap(true, Ordering::SeqCst) {
            self.inner.destroyed.wait().await;
            return None;
        }

        let result = match self.inner.handler.upgrade() {
            Some(handler) => handler.handle_destroy().await,
            None => Ok(()),
        };

        let others: Vec<EndpointId> = self
            .inner
            .endpoints
            .iter()
            .map(|e| *e.key())
            .filter(|id| Some(*id) != requester)
            .collect();
        for id in others {
            let Some((_, endpoint)) = self.inner.endpoints.remove(&id) else {
                continue;
            };
            endpoint.interrupt.lock().raise();
            if endpoint.was_connected.load(Ordering::SeqCst) {
                let notice = Action::from_typed(&ConnectAction::DestroyedByForce)
                    .and_then(|a| endpoint.controller.send_action(a, TransferList::new()));
                if let Err(e) = notice {
                    tracing::debug!(endpoint = %id, error = %e, "could not notify endpoint of destroy");
                }
            }
            endpoint
                .controller
                .close(DisconnectReason::RunnerDestroyed, false)
                .await;
        }

        self.inner.destroyed.raise();
        tracing::debug!(runner = %self.inner.label, ok = result.is_ok(), "runner destroyed");
        Some(result)
    }

    /// Destroys the instance from the hosting side, notifying every connected
    /// endpoint.
    pub async fn force_destroy(&self) -> Result<()> {
        self.teardown(None).await.unwrap_or(Ok(()))
    }
}
