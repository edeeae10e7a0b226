use async_trait::async_trait;

use mirrex_model::Gfid;

/// A heal descriptor handed to the self-heal layer. The core only ever
/// enqueues these; crawling, source election and the actual repair happen
/// elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealRequest {
    pub gfid: Gfid,
    pub data: bool,
    pub metadata: bool,
    pub entry: bool,
}

impl HealRequest {
    pub fn new(gfid: Gfid) -> Self {
        HealRequest {
            gfid,
            data: false,
            metadata: false,
            entry: false,
        }
    }

    pub fn any(&self) -> bool {
        self.data || self.metadata || self.entry
    }
}

/// Accepts heal descriptors. Implementations own scheduling, deduplication
/// and backpressure.
#[async_trait]
pub trait HealSink: Send + Sync {
    async fn enqueue(&self, request: HealRequest);
}
