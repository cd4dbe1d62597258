//! Ordered chain of observers that can pass, rewrite or veto actions.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use futures::future::join_all;
use parking_lot::Mutex;

use crate::action::Action;
use crate::action::Packet;
use crate::error::DisconnectReason;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Verdict of a single interceptor on a single action.
#[derive(Clone, Debug, PartialEq)]
pub enum Interception {
    Pass,
    /// Later interceptors and the consumer observe this action instead.
    Replace(Action),
    /// Vetoes delivery but lets the remaining interceptors observe the action.
    RejectSoft,
    /// Vetoes delivery and stops the chain.
    RejectHard,
}

/// Final verdict after the whole chain ran.
#[derive(Debug)]
pub struct InterceptOutcome {
    pub packet: Packet,
    /// How many interceptors rejected, soft or hard.
    pub rejections: usize,
    pub hard_rejected: bool,
}

impl InterceptOutcome {
    pub fn is_rejected(&self) -> bool {
        self.rejections > 0
    }

    /// The packet to deliver, if nobody vetoed it.
    pub fn accepted(self) -> Option<Packet> {
        if self.is_rejected() {
            None
        } else {
            Some(self.packet)
        }
    }
}

pub trait ChannelInterceptor: Send + Sync + 'static {
    fn intercept(&self, _direction: Direction, _packet: &Packet) -> Interception {
        Interception::Pass
    }

    /// Runs for every interceptor after the chain finished, including ones a
    /// hard reject cut off.
    fn intercept_result(&self, _direction: Direction, _outcome: &InterceptOutcome, _rejected_by_self: bool) {}

    /// The owning channel's link went away underneath it.
    fn link_lost(&self, _reason: DisconnectReason) {}

    /// Teardown. The owning channel awaits the returned future before it
    /// considers itself destroyed.
    fn destroy(&self) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InterceptorKey(u64);

#[derive(Default)]
pub struct InterceptorComposer {
    entries: Mutex<Vec<(InterceptorKey, Arc<dyn ChannelInterceptor>)>>,
    next_key: AtomicU64,
}

impl InterceptorComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers at the end of the chain.
    pub fn push(&self, interceptor: Arc<dyn ChannelInterceptor>) -> InterceptorKey {
        let key = InterceptorKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((key, interceptor));
        key
    }

    pub fn remove(&self, key: InterceptorKey) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(k, _)| *k != key);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChannelInterceptor>> {
        self.entries.lock().iter().map(|(_, i)| i.clone()).collect()
    }

    /// Runs the chain in registration order.
    pub fn intercept(&self, direction: Direction, packet: Packet) -> InterceptOutcome {
        let chain = self.snapshot();
        if chain.is_empty() {
            return InterceptOutcome {
                packet,
                rejections: 0,
                hard_rejected: false,
            };
        }

        let mut packet = packet;
        let mut rejected_by = vec![false; chain.len()];
        let mut rejections = 0;
        let mut hard_rejected = false;

        for (index, interceptor) in chain.iter().enumerate() {
            match interceptor.intercept(direction, &packet) {
                Interception::Pass => {}
                Interception::Replace(action) => packet.action = action,
                Interception::RejectSoft => {
                    rejected_by[index] = true;
                    rejections += 1;
                }
                Interception::RejectHard => {
                    rejected_by[index] = true;
                    rejections += 1;
                    hard_rejected = true;
                    break;
                }
            }
        }

        let outcome = InterceptOutcome {
            packet,
            rejections,
            hard_rejected,
        };
        for (interceptor, rejected) in chain.iter().zip(rejected_by) {
            interceptor.intercept_result(direction, &outcome, rejected);
        }
        outcome
    }

    pub fn link_lost(&self, reason: DisconnectReason) {
        for interceptor in self.snapshot() {
            interceptor.link_lost(reason);
        }
    }

    /// Destroys every interceptor, awaiting all of their teardowns.
    pub async fn destroy(&self) {
        let teardowns: Vec<_> = self
            .snapshot()
            .iter()
            .filter_map(|interceptor| interceptor.destroy())
            .collect();
        join_all(teardowns).await;
        self.entries.lock().clear();
    }
}

/// Traces every action crossing the channel it is attached to.
pub struct LoggingInterceptor {
    label: String,
}

impl LoggingInterceptor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ChannelInterceptor for LoggingInterceptor {
    fn intercept(&self, direction: Direction, packet: &Packet) -> Interception {
        tracing::trace!(
            channel = %self.label,
            ?direction,
            kind = %packet.action.kind,
            id = ?packet.action.id,
            transfer = packet.transfer.len(),
            "action"
        );
        Interception::Pass
    }

    fn intercept_result(&self, direction: Direction, outcome: &InterceptOutcome, _rejected_by_self: bool) {
        if outcome.is_rejected() {
            tracing::trace!(
                channel = %self.label,
                ?direction,
                kind = %outcome.packet.action.kind,
                rejections = outcome.rejections,
                hard = outcome.hard_rejected,
                "action vetoed"
            );
        }
    }
}
