use crate::batch::ChannelMask;
use crate::channel::{ChannelHandle, ChannelState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Default number of activity records retained.
pub const DEFAULT_ACTIVITY_CAPACITY: usize = 1024;

/// Notable events emitted by the coordinator and the egress pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchActivity {
    ChannelAttached(ChannelHandle),
    ChannelReleased(ChannelHandle),
    ChannelTransition {
        channel: ChannelHandle,
        from: ChannelState,
        to: ChannelState,
    },
    PushRejected {
        channel: ChannelHandle,
        state: ChannelState,
    },
    GapDropped(ChannelHandle),
    Drained {
        channel: ChannelHandle,
        discarded: usize,
    },
    Assembled {
        sequence: u64,
        mask: ChannelMask,
        partial: bool,
    },
    CycleSkipped,
    EgressRejected {
        sequence: u64,
    },
    Delivered {
        sequence: u64,
    },
    DeliveryFailed {
        sequence: u64,
        reason: String,
    },
    FlushStarted,
    FlushStopped,
    EndOfStream,
    Started,
    Stopped,
}

/// Log entry captured by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchActivityRecord {
    pub at: Instant,
    pub activity: BatchActivity,
}

/// Thread-safe bounded log used for testing and diagnostics.
#[derive(Clone)]
pub struct BatchActivityLog {
    capacity: usize,
    entries: Arc<Mutex<VecDeque<BatchActivityRecord>>>,
}

impl Default for BatchActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ACTIVITY_CAPACITY)
    }
}

impl BatchActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn record(&self, activity: BatchActivity) {
        let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(BatchActivityRecord {
            at: Instant::now(),
            activity,
        });
    }

    pub fn snapshot(&self) -> Vec<BatchActivityRecord> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Activities only, oldest first.
    pub fn activities(&self) -> Vec<BatchActivity> {
        self.snapshot()
            .into_iter()
            .map(|record| record.activity)
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Default)]
struct MetricCounters {
    batches_assembled: AtomicU64,
    partial_batches: AtomicU64,
    cycles_skipped: AtomicU64,
    items_retired: AtomicU64,
    items_discarded: AtomicU64,
    pushes_rejected: AtomicU64,
    gaps_dropped: AtomicU64,
    egress_rejected: AtomicU64,
    batches_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Counters shared by the coordinator and the pump threads.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics {
    counters: Arc<MetricCounters>,
}

macro_rules! counter {
    ($record:ident, $read:ident) => {
        pub(crate) fn $record(&self, n: u64) {
            self.counters.$read.fetch_add(n, Ordering::Relaxed);
        }

        pub fn $read(&self) -> u64 {
            self.counters.$read.load(Ordering::Relaxed)
        }
    };
}

impl CoordinatorMetrics {
    counter!(record_assembled, batches_assembled);
    counter!(record_partial, partial_batches);
    counter!(record_skipped, cycles_skipped);
    counter!(record_retired, items_retired);
    counter!(record_discarded, items_discarded);
    counter!(record_push_rejected, pushes_rejected);
    counter!(record_gap_dropped, gaps_dropped);
    counter!(record_egress_rejected, egress_rejected);
    counter!(record_delivered, batches_delivered);
    counter!(record_delivery_failure, delivery_failures);

    /// Prometheus exposition of the counters plus the current egress depth.
    pub fn render_metrics(&self, egress_depth: usize) -> String {
        format!(
            "syncbatch_batches_assembled_total {}\n\
             syncbatch_partial_batches_total {}\n\
             syncbatch_cycles_skipped_total {}\n\
             syncbatch_items_retired_total {}\n\
             syncbatch_items_discarded_total {}\n\
             syncbatch_pushes_rejected_total {}\n\
             syncbatch_gaps_dropped_total {}\n\
             syncbatch_egress_rejected_total {}\n\
             syncbatch_batches_delivered_total {}\n\
             syncbatch_delivery_failures_total {}\n\
             syncbatch_egress_depth {}\n",
            self.batches_assembled(),
            self.partial_batches(),
            self.cycles_skipped(),
            self.items_retired(),
            self.items_discarded(),
            self.pushes_rejected(),
            self.gaps_dropped(),
            self.egress_rejected(),
            self.batches_delivered(),
            self.delivery_failures(),
            egress_depth
        )
    }
}
