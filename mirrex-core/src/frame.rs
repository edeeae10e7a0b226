use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use mirrex_model::{ChildMask, ReplySet};

/// Per-operation local state: the topology snapshot the operation was framed
/// against, its reply vector, and the readability masks computed for it.
///
/// The `event_generation` snapshot is the staleness watermark: replies and
/// readability computed at an older generation are rejected, never patched.
#[derive(Debug)]
pub struct FopFrame {
    pub child_up: ChildMask,
    pub event_generation: u32,
    pub replies: ReplySet,
    pub readable: ChildMask,
    pub readable2: ChildMask,
    _guard: InflightGuard,
}

impl FopFrame {
    pub(crate) fn new(child_up: ChildMask, event_generation: u32, guard: InflightGuard) -> Self {
        let child_count = child_up.len();
        FopFrame {
            child_up,
            event_generation,
            replies: ReplySet::new(child_count),
            readable: ChildMask::none(child_count),
            readable2: ChildMask::none(child_count),
            _guard: guard,
        }
    }

    pub fn up_count(&self) -> usize {
        self.child_up.count()
    }
}

/// Counts frames in flight so shutdown can wait for them to drain.
#[derive(Debug, Default)]
pub(crate) struct InflightGauge {
    count: AtomicUsize,
    drained: Notify,
}

impl InflightGauge {
    pub(crate) fn enter(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            gauge: Arc::clone(self),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until every outstanding frame has dropped its guard.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub(crate) struct InflightGuard {
    gauge: Arc<InflightGauge>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.gauge.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gauge.drained.notify_waiters();
        }
    }
}
