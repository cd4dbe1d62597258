//! `PROXY` envelopes and the root-side interceptor that routes them.

use serde::Deserialize;
use serde::Serialize;

use super::ChannelInterceptor;
use super::Direction;
use super::InterceptOutcome;
use super::Interception;
use super::ProxyId;
use super::WeakChannel;
use crate::action::Action;
use crate::action::Packet;
use crate::error::DisconnectReason;
use crate::error::Result;

pub(super) const PROXY: &str = "PROXY";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    proxy_id: ProxyId,
    action: Action,
}

pub(super) fn wrap(id: &ProxyId, action: Action) -> Result<Action> {
    let envelope = serde_json::to_value(Envelope {
        proxy_id: id.clone(),
        action,
    })?;
    let mut wrapped = Action::new(PROXY);
    if let serde_json::Value::Object(fields) = envelope {
        wrapped.fields = fields;
    }
    Ok(wrapped)
}

fn unwrap_for(id: &ProxyId, action: &Action) -> Option<Action> {
    if action.kind != PROXY {
        return None;
    }
    match action.field("proxyId") {
        Some(serde_json::Value::String(target)) if *target == id.0 => {}
        _ => return None,
    }
    let inner = action.field("action")?.clone();
    serde_json::from_value(inner).ok()
}

/// Registered on the parent channel while a proxy channel runs.
///
/// Soft-rejects envelopes addressed to its proxy so the parent's own
/// handlers never see them, then re-delivers the unwrapped action to the
/// proxy.
pub(super) struct ProxyReceiveInterceptor {
    id: ProxyId,
    proxy: WeakChannel,
}

impl ProxyReceiveInterceptor {
    pub(super) fn new(id: ProxyId, proxy: WeakChannel) -> Self {
        Self { id, proxy }
    }
}

impl ChannelInterceptor for ProxyReceiveInterceptor {
    fn intercept(&self, direction: Direction, packet: &Packet) -> Interception {
        if direction == Direction::Inbound && unwrap_for(&self.id, &packet.action).is_some() {
            Interception::RejectSoft
        } else {
            Interception::Pass
        }
    }

    fn intercept_result(&self, direction: Direction, outcome: &InterceptOutcome, rejected_by_self: bool) {
        if direction != Direction::Inbound || !rejected_by_self {
            return;
        }
        if outcome.rejections > 1 || outcome.hard_rejected {
            tracing::warn!(
                proxy = %self.id,
                rejections = outcome.rejections,
                "proxy envelope claimed more than once, dropping"
            );
            return;
        }

        let Some(action) = unwrap_for(&self.id, &outcome.packet.action) else {
            return;
        };
        let Some(proxy) = self.proxy.upgrade() else {
            return;
        };
        if proxy
            .deliver(Packet::with_transfer(action, outcome.packet.transfer.clone()))
            .is_err()
        {
            tracing::trace!(proxy = %self.id, "proxy stopped, envelope dropped");
        }
    }

    fn link_lost(&self, reason: DisconnectReason) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.lose(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_only_matches_its_proxy() {
        let id = ProxyId("c:4".into());
        let inner = Action::new("CUSTOM").with_field("payload", 3);
        let wrapped = wrap(&id, inner.clone()).expect("wrap");

        assert_eq!(wrapped.kind, "PROXY");
        assert_eq!(wrapped.field("proxyId"), Some(&serde_json::Value::from("c:4")));
        assert_eq!(unwrap_for(&id, &wrapped), Some(inner));
        assert_eq!(unwrap_for(&ProxyId("h:4".into()), &wrapped), None);
    }
}
