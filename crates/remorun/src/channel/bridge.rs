//! Relays two channels into each other.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use super::ChannelEvent;
use super::ConnectionChannel;
use super::HandlerId;
use super::proxy::PROXY;
use crate::action::Action;
use crate::error::Result;

struct BridgeInner {
    near: ConnectionChannel,
    far: ConnectionChannel,
    handlers: Mutex<Option<(HandlerId, HandlerId)>>,
    /// Proxies nested in the relayed link have used it.
    nested: AtomicBool,
    collapsed: AtomicBool,
    ends: fn(&Action) -> bool,
}

/// Every action arriving on one channel leaves through the other.
///
/// The bridge collapses, destroying both channels, when either of them
/// closes, or after relaying an action `ends` recognises as the last one of
/// the link. The second rule is skipped once nested proxy traffic was seen,
/// since those links may outlive the one that carries them.
///
/// The relay handlers own the bridge, so it stays up after the `Bridge`
/// value is dropped, until it collapses or is dismantled.
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Runs both channels and starts relaying.
    pub fn splice(near: ConnectionChannel, far: ConnectionChannel, ends: fn(&Action) -> bool) -> Result<Self> {
        let inner = Arc::new(BridgeInner {
            near: near.clone(),
            far: far.clone(),
            handlers: Mutex::new(None),
            nested: AtomicBool::new(false),
            collapsed: AtomicBool::new(false),
            ends,
        });

        let from_near = near.add_handler(relay(inner.clone(), true));
        let from_far = far.add_handler(relay(inner.clone(), false));
        *inner.handlers.lock() = Some((from_near, from_far));

        if let Err(e) = near.run().and_then(|_| far.run()) {
            inner.unhook();
            return Err(e);
        }
        tracing::debug!(near = ?near.proxy_id(), far = ?far.proxy_id(), "link bridged");
        Ok(Self { inner })
    }

    /// Stops relaying and destroys the far channel. Returns the near one,
    /// still running, for its previous owner to reuse or release.
    pub async fn dismantle(self) -> ConnectionChannel {
        self.inner.unhook();
        if !self.inner.collapsed.swap(true, Ordering::SeqCst) {
            self.inner.far.destroy(false).await;
        }
        self.inner.near.clone()
    }
}

fn relay(bridge: Arc<BridgeInner>, from_near: bool) -> impl Fn(&ChannelEvent) + Send + Sync + 'static {
    move |event| bridge.relay(from_near, event)
}

impl BridgeInner {
    fn relay(self: &Arc<Self>, from_near: bool, event: &ChannelEvent) {
        match event {
            ChannelEvent::Action(packet) => {
                let target = if from_near { &self.far } else { &self.near };
                if packet.action.kind == PROXY {
                    self.nested.store(true, Ordering::SeqCst);
                }
                if let Err(e) = target.send_action(packet.action.clone(), packet.transfer.clone()) {
                    tracing::debug!(error = %e, kind = %packet.action.kind, "bridge could not relay action");
                }
                if (self.ends)(&packet.action) && !self.nested.load(Ordering::SeqCst) {
                    self.collapse();
                }
            }
            ChannelEvent::Closed(reason) => {
                tracing::debug!(%reason, "bridged channel closed");
                self.collapse();
            }
        }
    }

    fn unhook(&self) {
        if let Some((from_near, from_far)) = self.handlers.lock().take() {
            self.near.remove_handler(from_near);
            self.far.remove_handler(from_far);
        }
    }

    fn collapse(self: &Arc<Self>) {
        if self.collapsed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unhook();
        let bridge = self.clone();
        tokio::spawn(async move {
            bridge.near.destroy(false).await;
            bridge.far.destroy(false).await;
        });
    }
}
