//! # Connection Channels
//!
//! A channel wraps a transport (or multiplexes over another channel as a
//! proxy), pumps inbound packets through its interceptor chain and fans them
//! out to handlers.
//!
//! ## Philosophy
//!
//! - **Passive Until Run**: a channel created from a transport does not touch
//!   it until `run()`. Sending before that is an error.
//! - **Hand-Over Friendly**: `destroy(true)` releases the transport without
//!   closing it, so a fresh channel (or another context) can take it over.
//!   A packet the pump already pulled off the transport is put back for the
//!   next owner.
//! - **Proxies Are Channels**: a proxy channel has the same surface. Its
//!   outbound actions are wrapped into `PROXY` envelopes on the channel it
//!   was opened over, which hands matching inbound envelopes back to it.
//!   Proxies nest.
//!
//! ## Invariants
//!
//! - `destroy` is idempotent and never waits on proxies.
//! - A channel whose destroy was requested keeps carrying traffic for the
//!   proxies running over it, and releases its link when the last one is
//!   gone. Losing the link closes those proxies instead.
//! - Handlers are snapshotted before dispatch, so a handler may add or remove
//!   handlers (including itself) while running.

pub mod interceptor;
mod bridge;
mod proxy;

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

use crate::action::Action;
use crate::action::Packet;
use crate::action::TransferList;
use crate::error::DisconnectReason;
use crate::error::Error;
use crate::error::Result;
use crate::signal::Flag;
use crate::transport::Port;
use crate::transport::Transport;

pub use bridge::Bridge;
pub use interceptor::ChannelInterceptor;
pub use interceptor::Direction;
pub use interceptor::InterceptOutcome;
pub use interceptor::Interception;
pub use interceptor::InterceptorComposer;
pub use interceptor::InterceptorKey;
pub use interceptor::LoggingInterceptor;

/// Identifies a proxy channel on the channel it runs over. Unique per
/// opening side.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyId(pub String);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Action(Packet),
    /// The link went away underneath the channel. Sent once.
    Closed(DisconnectReason),
}

pub type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

enum Link {
    Transport(Arc<dyn Transport>),
    Proxy {
        parent: ConnectionChannel,
        id: ProxyId,
        claim: Mutex<Option<InterceptorKey>>,
    },
}

struct Inner {
    link: Link,
    running: AtomicBool,
    /// Destroy was requested.
    destroyed: AtomicBool,
    /// The link is being released.
    finishing: AtomicBool,
    save_open: AtomicBool,
    stopped: Flag,
    /// Held for a whole delivery, so `stopped` is never raised mid-dispatch.
    delivering: Mutex<()>,
    /// Raised when the pump task exits.
    pump: Mutex<Option<Flag>>,
    /// Running proxies opened over this channel.
    dependents: AtomicUsize,
    closed_reason: Mutex<Option<DisconnectReason>>,
    handlers: Mutex<Vec<(HandlerId, Handler)>>,
    next_handler: AtomicU64,
    interceptors: InterceptorComposer,
}

/// Cheap, clonable handle to a channel.
#[derive(Clone)]
pub struct ConnectionChannel {
    inner: Arc<Inner>,
}

impl ConnectionChannel {
    pub fn new(transport: impl Transport) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        Self::with_link(Link::Transport(transport))
    }

    /// A channel multiplexed over `parent` under `id`.
    pub fn proxy(parent: &ConnectionChannel, id: ProxyId) -> Self {
        Self::with_link(Link::Proxy {
            parent: parent.clone(),
            id,
            claim: Mutex::new(None),
        })
    }

    fn with_link(link: Link) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                finishing: AtomicBool::new(false),
                save_open: AtomicBool::new(false),
                stopped: Flag::new(),
                delivering: Mutex::new(()),
                pump: Mutex::new(None),
                dependents: AtomicUsize::new(0),
                closed_reason: Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                interceptors: InterceptorComposer::new(),
            }),
        }
    }

    /// A fresh, not yet running channel over the same link, for whoever
    /// takes it over after `destroy(true)`.
    pub fn successor(&self) -> ConnectionChannel {
        match &self.inner.link {
            Link::Transport(transport) => Self::from_shared(transport.clone()),
            Link::Proxy { parent, id, .. } => Self::proxy(parent, id.clone()),
        }
    }

    /// Starts listening. Idempotent while the channel is alive.
    pub fn run(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match &self.inner.link {
            Link::Transport(transport) => self.spawn_pump(transport.clone()),
            Link::Proxy { parent, id, claim } => {
                if let Err(e) = parent.attach_dependent() {
                    self.inner.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                let receiver = proxy::ProxyReceiveInterceptor::new(id.clone(), self.downgrade());
                let key = parent.interceptors().push(Arc::new(receiver));
                *claim.lock() = Some(key);
                tracing::debug!(proxy = %id, "proxy channel claimed");
            }
        }
        Ok(())
    }

    fn attach_dependent(&self) -> Result<()> {
        if self.is_destroyed() || self.closed_reason().is_some() {
            return Err(self.closed_error());
        }
        self.inner.dependents.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// A proxy over this channel is gone. The last one out finishes a
    /// requested destroy.
    fn release_dependent(&self) {
        let left = self.inner.dependents.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if left == 0 && self.inner.destroyed.load(Ordering::SeqCst) {
            let channel = self.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { channel.finish().await });
                }
                Err(_) => tracing::warn!(proxy = ?self.proxy_id(), "no runtime left to release channel"),
            }
        }
    }

    fn spawn_pump(&self, transport: Arc<dyn Transport>) {
        let weak = self.downgrade();
        let stopped = self.inner.stopped.wait();
        let done = Flag::new();
        *self.inner.pump.lock() = Some(done.clone());

        tokio::spawn(async move {
            let _done = PumpDone(done);
            tokio::pin!(stopped);
            loop {
                let received = tokio::select! {
                    biased;
                    _ = &mut stopped => return,
                    received = transport.recv() => received,
                };

                match received {
                    Ok(Some(packet)) => {
                        let Some(channel) = weak.upgrade() else {
                            transport.unread(packet);
                            return;
                        };
                        if let Err(packet) = channel.deliver(packet) {
                            transport.unread(packet);
                            return;
                        }
                    }
                    Ok(None) => {
                        if let Some(channel) = weak.upgrade() {
                            channel.lose(DisconnectReason::ConnectionLost);
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "transport failed, closing channel");
                        if let Some(channel) = weak.upgrade() {
                            channel.lose(DisconnectReason::ConnectionError);
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Runs an inbound packet through the interceptors and on to handlers.
    /// A stopped channel hands the packet back untouched.
    fn deliver(&self, packet: Packet) -> std::result::Result<(), Packet> {
        let _gate = self.inner.delivering.lock();
        if self.inner.stopped.is_raised() {
            return Err(packet);
        }
        let outcome = self.inner.interceptors.intercept(Direction::Inbound, packet);
        if let Some(packet) = outcome.accepted() {
            self.dispatch(&ChannelEvent::Action(packet));
        }
        Ok(())
    }

    fn dispatch(&self, event: &ChannelEvent) {
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

    /// The link died underneath us: notify once, close the proxies running
    /// over us, then tear down.
    fn lose(&self, reason: DisconnectReason) {
        if self.inner.stopped.is_raised() {
            return;
        }
        {
            let mut closed = self.inner.closed_reason.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason);
        }
        tracing::debug!(%reason, proxy = ?self.proxy_id(), "channel lost its link");
        self.inner.running.store(false, Ordering::SeqCst);
        self.dispatch(&ChannelEvent::Closed(reason));
        self.inner.interceptors.link_lost(reason);

        let channel = self.clone();
        tokio::spawn(async move { channel.destroy(false).await });
    }

    pub fn send_action(&self, action: Action, transfer: TransferList) -> Result<()> {
        if !self.is_running() {
            return Err(self.closed_error());
        }
        self.transmit(action, transfer)
    }

    /// Outbound path for proxies. Keeps working after our own destroy was
    /// requested, until the link is released or lost.
    fn carry(&self, action: Action, transfer: TransferList) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) || self.inner.stopped.is_raised() {
            return Err(self.closed_error());
        }
        self.transmit(action, transfer)
    }

    fn transmit(&self, action: Action, transfer: TransferList) -> Result<()> {
        let outcome = self
            .inner
            .interceptors
            .intercept(Direction::Outbound, Packet::with_transfer(action, transfer));
        let Some(packet) = outcome.accepted() else {
            return Ok(());
        };

        match &self.inner.link {
            Link::Transport(transport) => transport.send(packet).map_err(|e| {
                Error::connection_closed(DisconnectReason::ConnectionError, e.to_string())
            }),
            Link::Proxy { parent, id, .. } => {
                let envelope = proxy::wrap(id, packet.action)?;
                parent.carry(envelope, packet.transfer)
            }
        }
    }

    /// Tears the channel down. With `save_open` the transport stays open for
    /// a new owner.
    ///
    /// While proxies still run over this channel, only our handlers go away;
    /// the link is released once the last proxy is destroyed.
    pub async fn destroy(&self, save_open: bool) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.save_open.store(save_open, Ordering::SeqCst);

        let dependents = self.inner.dependents.load(Ordering::SeqCst);
        if dependents > 0 {
            self.inner.handlers.lock().clear();
            tracing::debug!(dependents, proxy = ?self.proxy_id(), "channel kept open for its proxies");
            return;
        }
        self.finish().await;
    }

    async fn finish(&self) {
        if self.inner.finishing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        {
            let _gate = self.inner.delivering.lock();
            self.inner.stopped.raise();
        }
        self.inner.handlers.lock().clear();
        self.inner.interceptors.destroy().await;

        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            pump.wait().await;
        }

        match &self.inner.link {
            Link::Transport(transport) => {
                if !self.inner.save_open.load(Ordering::SeqCst) {
                    transport.close();
                }
            }
            Link::Proxy { parent, id, claim } => {
                let key = claim.lock().take();
                if let Some(key) = key {
                    parent.interceptors().remove(key);
                    parent.release_dependent();
                }
                tracing::debug!(proxy = %id, "proxy channel released");
            }
        }
    }

    pub fn add_handler(&self, handler: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.inner.handlers.lock().retain(|(h, _)| *h != id);
    }

    pub fn interceptors(&self) -> &InterceptorComposer {
        &self.inner.interceptors
    }

    pub fn proxy_id(&self) -> Option<&ProxyId> {
        match &self.inner.link {
            Link::Transport(_) => None,
            Link::Proxy { id, .. } => Some(id),
        }
    }

    /// How many running proxies are opened over this channel.
    pub fn dependents(&self) -> usize {
        self.inner.dependents.load(Ordering::SeqCst)
    }

    /// The transport as a movable port, for hand-over.
    pub fn port(&self) -> Option<Port> {
        match &self.inner.link {
            Link::Transport(transport) => transport.as_port(),
            Link::Proxy { .. } => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Running and its link has not been lost.
    pub fn is_connected(&self) -> bool {
        self.is_running() && self.inner.closed_reason.lock().is_none()
    }

    /// Destroy was requested. The link may still be in use by proxies.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Resolves once the channel has released its link.
    pub fn destroyed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.inner.stopped.wait()
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        *self.inner.closed_reason.lock()
    }

    fn closed_error(&self) -> Error {
        match self.closed_reason() {
            Some(reason) => Error::connection_closed(reason, "channel is closed"),
            None if self.is_destroyed() => {
                Error::connection_closed(DisconnectReason::ConnectionLost, "channel is destroyed")
            }
            None => Error::connection_closed(
                DisconnectReason::ConnectionNotYetEstablished,
                "channel is not running",
            ),
        }
    }

    fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for ConnectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionChannel")
            .field("proxy", &self.proxy_id())
            .field("running", &self.is_running())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[derive(Clone)]
struct WeakChannel(Weak<Inner>);

impl WeakChannel {
    fn upgrade(&self) -> Option<ConnectionChannel> {
        self.0.upgrade().map(|inner| ConnectionChannel { inner })
    }
}

// A proxy dropped without being destroyed still gives its slot back.
impl Drop for Inner {
    fn drop(&mut self) {
        if let Link::Proxy { parent, claim, .. } = &self.link {
            if let Some(key) = claim.lock().take() {
                parent.interceptors().remove(key);
                parent.release_dependent();
            }
        }
    }
}

struct PumpDone(Flag);

impl Drop for PumpDone {
    fn drop(&mut self) {
        self.0.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collect(channel: &ConnectionChannel) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.add_handler(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    async fn next_action(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Action {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ChannelEvent::Action(packet))) => packet.action,
            other => panic!("expected an action, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_requires_run() {
        let (a, _b) = Port::pair();
        let channel = ConnectionChannel::new(a);

        let err = channel
            .send_action(Action::new("EARLY"), TransferList::new())
            .expect_err("not running");
        assert_eq!(
            err.disconnect_reason(),
            Some(DisconnectReason::ConnectionNotYetEstablished)
        );
    }

    #[tokio::test]
    async fn test_handlers_receive_in_order() {
        let (a, b) = Port::pair();
        let left = ConnectionChannel::new(a);
        let right = ConnectionChannel::new(b);
        let mut events = collect(&right);
        left.run().expect("run left");
        right.run().expect("run right");

        for kind in ["A", "B", "C"] {
            left.send_action(Action::new(kind), TransferList::new()).expect("send");
        }
        assert_eq!(next_action(&mut events).await.kind, "A");
        assert_eq!(next_action(&mut events).await.kind, "B");
        assert_eq!(next_action(&mut events).await.kind, "C");
    }

    #[tokio::test]
    async fn test_peer_close_is_reported_once() {
        let (a, b) = Port::pair();
        let left = ConnectionChannel::new(a);
        let right = ConnectionChannel::new(b);
        let mut events = collect(&right);
        left.run().expect("run");
        right.run().expect("run");

        left.destroy(false).await;
        left.destroy(false).await;

        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(ChannelEvent::Closed(reason))) => {
                assert_eq!(reason, DisconnectReason::ConnectionLost)
            }
            other => panic!("expected close, got {:?}", other),
        }
        right.destroyed().await;
        assert!(right.send_action(Action::new("X"), TransferList::new()).is_err());
    }

    #[tokio::test]
    async fn test_save_open_hands_the_transport_over() {
        let (a, b) = Port::pair();
        let first = ConnectionChannel::new(a);
        let remote = ConnectionChannel::new(b);
        let mut remote_events = collect(&remote);
        first.run().expect("run");
        remote.run().expect("run");

        first.destroy(true).await;
        let second = first.successor();
        let mut second_events = collect(&second);
        second.run().expect("run second");

        remote.send_action(Action::new("HELLO"), TransferList::new()).expect("send");
        assert_eq!(next_action(&mut second_events).await.kind, "HELLO");

        second.send_action(Action::new("BACK"), TransferList::new()).expect("send");
        assert_eq!(next_action(&mut remote_events).await.kind, "BACK");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_swapping_channels_keeps_queued_packets() {
        let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
        for _ in 0..50 {
            let (a, b) = Port::pair();
            let first = ConnectionChannel::new(a);
            let mut first_events = collect(&first);
            first.run().expect("run");
            for kind in &expected {
                b.send(Packet::new(Action::new(kind.clone()))).expect("send");
            }
            tokio::task::yield_now().await;

            first.destroy(true).await;
            let second = first.successor();
            let mut second_events = collect(&second);
            second.run().expect("run second");

            let mut seen = Vec::new();
            while let Ok(ChannelEvent::Action(packet)) = first_events.try_recv() {
                seen.push(packet.action.kind);
            }
            while seen.len() < expected.len() {
                seen.push(next_action(&mut second_events).await.kind);
            }
            assert_eq!(seen, expected);
            assert!(second_events.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_proxies_multiplex_over_a_root() {
        let (a, b) = Port::pair();
        let left = ConnectionChannel::new(a);
        let right = ConnectionChannel::new(b);
        let mut right_root = collect(&right);
        left.run().expect("run");
        right.run().expect("run");

        let left_one = ConnectionChannel::proxy(&left, ProxyId("c:1".into()));
        let right_one = ConnectionChannel::proxy(&right, ProxyId("c:1".into()));
        let right_two = ConnectionChannel::proxy(&right, ProxyId("c:2".into()));
        let mut one_events = collect(&right_one);
        let mut two_events = collect(&right_two);
        for channel in [&left_one, &right_one, &right_two] {
            channel.run().expect("run proxy");
        }

        left_one.send_action(Action::new("ONLY_ONE"), TransferList::new()).expect("send");
        left.send_action(Action::new("ROOT"), TransferList::new()).expect("send");

        assert_eq!(next_action(&mut one_events).await.kind, "ONLY_ONE");
        assert_eq!(next_action(&mut right_root).await.kind, "ROOT");
        assert!(two_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_root_destroy_waits_for_its_proxies() {
        let (a, b) = Port::pair();
        let root = ConnectionChannel::new(a);
        let remote = ConnectionChannel::new(b);
        root.run().expect("run");
        remote.run().expect("run");
        let child = ConnectionChannel::proxy(&root, ProxyId("h:0".into()));
        let remote_child = ConnectionChannel::proxy(&remote, ProxyId("h:0".into()));
        let mut child_events = collect(&child);
        let mut remote_events = collect(&remote_child);
        child.run().expect("run proxy");
        remote_child.run().expect("run proxy");
        assert_eq!(root.dependents(), 1);

        root.destroy(false).await;
        assert!(root.is_destroyed());
        assert!(root.send_action(Action::new("ROOT"), TransferList::new()).is_err());

        child.send_action(Action::new("STILL_HERE"), TransferList::new()).expect("child keeps its link");
        assert_eq!(next_action(&mut remote_events).await.kind, "STILL_HERE");
        remote_child.send_action(Action::new("REPLY"), TransferList::new()).expect("send");
        assert_eq!(next_action(&mut child_events).await.kind, "REPLY");

        child.destroy(false).await;
        tokio::time::timeout(Duration::from_secs(1), root.destroyed())
            .await
            .expect("root released after its last proxy");
        assert_eq!(root.dependents(), 0);
        match tokio::time::timeout(Duration::from_secs(1), remote_events.recv()).await {
            Ok(Some(ChannelEvent::Closed(reason))) => assert_eq!(reason, DisconnectReason::ConnectionLost),
            other => panic!("expected the remote proxy to close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_proxy_gives_its_slot_back() {
        let (a, _b) = Port::pair();
        let root = ConnectionChannel::new(a);
        root.run().expect("run");
        let child = ConnectionChannel::proxy(&root, ProxyId("h:0".into()));
        child.run().expect("run proxy");
        root.destroy(false).await;
        assert!(root.destroyed().now_or_never().is_none());

        drop(child);
        tokio::time::timeout(Duration::from_secs(1), root.destroyed())
            .await
            .expect("root released once the proxy is gone");
    }

    #[tokio::test]
    async fn test_lost_root_closes_its_proxies() {
        let (a, b) = Port::pair();
        let root = ConnectionChannel::new(a);
        root.run().expect("run");
        let child = ConnectionChannel::proxy(&root, ProxyId("h:0".into()));
        let grandchild = ConnectionChannel::proxy(&child, ProxyId("h:1".into()));
        let mut grandchild_events = collect(&grandchild);
        child.run().expect("run proxy");
        grandchild.run().expect("run nested proxy");

        b.close();

        match tokio::time::timeout(Duration::from_secs(1), grandchild_events.recv()).await {
            Ok(Some(ChannelEvent::Closed(reason))) => assert_eq!(reason, DisconnectReason::ConnectionLost),
            other => panic!("expected close, got {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(1), root.destroyed())
            .await
            .expect("root torn down");
        assert!(grandchild.is_destroyed());
        assert!(child.is_destroyed());

        let late = ConnectionChannel::proxy(&root, ProxyId("h:2".into()));
        assert!(late.run().is_err());
    }
}
