use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde_json::Value;

use super::ConnectAction;
use crate::action::Action;
use crate::action::Packet;
use crate::action::TransferList;
use crate::channel::ChannelEvent;
use crate::channel::ConnectionChannel;
use crate::controller::ActionController;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Result;

type ClosedCallback = Box<dyn FnOnce(DisconnectReason) + Send>;

struct ClientInner {
    controller: ActionController,
    was_connected: AtomicBool,
    closed: Mutex<Option<DisconnectReason>>,
    on_closed: Mutex<Option<ClosedCallback>>,
}

/// Client half of the connect protocol, owned by a runner proxy.
#[derive(Clone)]
pub struct ConnectClient {
    inner: Arc<ClientInner>,
}

impl ConnectClient {
    pub fn new(channel: ConnectionChannel) -> Self {
        let controller = ActionController::new(channel);
        let inner = Arc::new(ClientInner {
            controller: controller.clone(),
            was_connected: AtomicBool::new(false),
            closed: Mutex::new(None),
            on_closed: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        controller.add_handler(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let client = ConnectClient { inner };
            match event {
                ChannelEvent::Action(packet) => {
                    if let Ok(ConnectAction::DestroyedByForce) = packet.action.to_typed() {
                        client.closed_remotely(DisconnectReason::RunnerDestroyed);
                    }
                }
                ChannelEvent::Closed(reason) => client.closed_remotely(*reason),
            }
        });

        Self { inner }
    }

    /// Called once if the host or the link ends this connection.
    pub fn on_closed(&self, callback: impl FnOnce(DisconnectReason) + Send + 'static) {
        *self.inner.on_closed.lock() = Some(Box::new(callback));
    }

    pub fn channel(&self) -> &ConnectionChannel {
        self.inner.controller.channel()
    }

    /// Runs the channel and announces this endpoint as active.
    pub fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.channel().run()?;
        self.inner
            .controller
            .send_action(Action::from_typed(&ConnectAction::Connect)?, TransferList::new())?;
        self.inner.was_connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn was_connected(&self) -> bool {
        self.inner.was_connected.load(Ordering::SeqCst)
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        *self.inner.closed.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_reason().is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.closed_reason() {
            Some(reason) => Err(Error::connection_closed(reason, "connection is closed")),
            None => Ok(()),
        }
    }

    /// Records the close reason. Returns false if already closed.
    fn mark_closed(&self, reason: DisconnectReason) -> bool {
        let mut closed = self.inner.closed.lock();
        if closed.is_some() {
            return false;
        }
        *closed = Some(reason);
        true
    }

    fn closed_remotely(&self, reason: DisconnectReason) {
        if !self.mark_closed(reason) {
            return;
        }
        tracing::debug!(%reason, "connection closed by host");

        let controller = self.inner.controller.clone();
        controller.reject_resolving_all_actions(Error::connection_closed(reason, "connection closed by host"));
        tokio::spawn(async move { controller.close(reason, false).await });

        let callback = self.inner.on_closed.lock().take();
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    async fn request(&self, action: ConnectAction, transfer: TransferList) -> Result<(ConnectAction, Packet)> {
        self.ensure_open()?;
        let packet = self
            .inner
            .controller
            .resolve_action(Action::from_typed(&action)?, transfer)
            .await?;
        let response = packet.action.to_typed()?;
        Ok((response, packet))
    }

    fn unexpected(request: &str, response: ConnectAction) -> Error {
        Error::unexpected(format!("unexpected response to {}: {:?}", request, response))
    }

    /// Sends a `CUSTOM` request and returns the response payload with its
    /// transferables.
    pub async fn resolve_custom(&self, payload: Value, transfer: TransferList) -> Result<(Value, TransferList)> {
        match self.request(ConnectAction::Custom { payload }, transfer).await? {
            (ConnectAction::CustomResponse { payload }, packet) => Ok((payload, packet.transfer)),
            (ConnectAction::CustomError { error }, _) => Err(Error::from_serialized(error)),
            (other, _) => Err(Self::unexpected("CUSTOM", other)),
        }
    }

    pub async fn interrupt_listening(&self) -> Result<()> {
        match self.request(ConnectAction::InterruptListening, TransferList::new()).await? {
            (ConnectAction::ListeningInterrupted, _) => Ok(()),
            (other, _) => Err(Self::unexpected("INTERRUPT_LISTENING", other)),
        }
    }

    /// Graceful goodbye. A no-op once closed.
    pub async fn disconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = match self.request(ConnectAction::Disconnect, TransferList::new()).await {
            Ok((ConnectAction::Disconnected, _)) => Ok(()),
            Ok((other, _)) => Err(Self::unexpected("DISCONNECT", other)),
            // The host closing on us mid-request still leaves us disconnected.
            Err(e) if e.is_connection_closed() => Ok(()),
            Err(e) => Err(e),
        };
        self.close(DisconnectReason::RunnerDisconnected).await;
        result
    }

    /// Asks the host to destroy the runner instance.
    pub async fn destroy(&self) -> Result<()> {
        let result = match self.request(ConnectAction::Destroy, TransferList::new()).await {
            Ok((ConnectAction::DestroyedByRequest, _)) => Ok(()),
            Ok((ConnectAction::DestroyedWithError { error }, _)) => Err(Error::from_serialized(error)),
            Ok((other, _)) => Err(Self::unexpected("DESTROY", other)),
            Err(e) => Err(e),
        };
        self.close(DisconnectReason::RunnerDestroyed).await;
        result
    }

    /// Stops using the link without closing the transport, so it can move.
    /// Requests still in flight fail with `ConnectionTransferred`.
    pub async fn detach(&self) -> ConnectionChannel {
        self.mark_closed(DisconnectReason::ConnectionTransferred);
        self.inner
            .controller
            .close(DisconnectReason::ConnectionTransferred, true)
            .await;
        self.channel().clone()
    }

    /// Local teardown. Tells a connected host goodbye without waiting.
    pub async fn force_destroy(&self, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        if self.was_connected() && self.channel().is_running() {
            let goodbye = Action::from_typed(&ConnectAction::Disconnect)
                .and_then(|a| self.inner.controller.send_action(a, TransferList::new()));
            if let Err(e) = goodbye {
                tracing::debug!(error = %e, "could not notify host of forced close");
            }
        }
        self.close(reason).await;
    }

    async fn close(&self, reason: DisconnectReason) {
        self.mark_closed(reason);
        self.inner.controller.close(reason, false).await;
    }
}
