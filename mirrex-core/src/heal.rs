use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use mirrex_contracts::{HealRequest, HealSink, UpstreamNotifier};
use mirrex_model::ClusterEvent;

/// Forwards heal descriptors into an unbounded channel; the self-heal layer
/// drains the receiving end at its own pace.
#[derive(Debug)]
pub struct ChannelHealSink {
    tx: mpsc::UnboundedSender<HealRequest>,
}

impl ChannelHealSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HealRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelHealSink { tx }, rx)
    }
}

#[async_trait]
impl HealSink for ChannelHealSink {
    async fn enqueue(&self, request: HealRequest) {
        debug!(gfid = %request.gfid, data = request.data, metadata = request.metadata,
               entry = request.entry, "heal requested");
        // A closed receiver means the heal layer is gone; nothing to do.
        let _ = self.tx.send(request);
    }
}

/// Heal sink for deployments (and tests) that run without a self-heal layer.
#[derive(Debug, Default)]
pub struct NullHealSink;

#[async_trait]
impl HealSink for NullHealSink {
    async fn enqueue(&self, _request: HealRequest) {}
}

/// Upstream notifier backed by a channel, mainly for tests and embedding.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }
}

#[async_trait]
impl UpstreamNotifier for ChannelNotifier {
    async fn notify(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }
}

/// Notifier that drops every event.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl UpstreamNotifier for NullNotifier {
    async fn notify(&self, _event: ClusterEvent) {}
}
