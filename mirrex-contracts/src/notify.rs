use async_trait::async_trait;

use mirrex_model::ClusterEvent;

/// Receives the aggregate topology events the replica set propagates upward.
///
/// The core invokes this outside its topology lock and at most once per
/// aggregate transition; implementations may be as slow as they like.
#[async_trait]
pub trait UpstreamNotifier: Send + Sync {
    async fn notify(&self, event: ClusterEvent);
}
