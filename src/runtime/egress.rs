use crate::batch::CompositeBatch;
use crate::observability::{BatchActivity, BatchActivityLog, CoordinatorMetrics};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Work handed to the pump thread, delivered strictly in FIFO order.
#[derive(Debug)]
pub enum EgressSignal {
    Batch(CompositeBatch),
    FlushStart,
    FlushStop,
    EndOfStream,
}

/// Error returned when the queue no longer accepts work; ownership goes back
/// to the caller.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("egress queue is terminal")]
    Terminal(EgressSignal),
}

impl EgressError {
    pub fn into_signal(self) -> EgressSignal {
        match self {
            EgressError::Terminal(signal) => signal,
        }
    }
}

/// Failure reported by a consumer for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("consumer rejected batch: {0}")]
    Rejected(String),
    #[error("consumer is flushing")]
    Flushing,
    #[error("consumer is disconnected")]
    Disconnected,
}

/// Downstream seam invoked from the pump thread.
pub trait BatchSink: Send + 'static {
    fn deliver(&mut self, batch: CompositeBatch) -> Result<(), DeliveryError>;

    fn flush(&mut self, started: bool) {
        let _ = started;
    }

    fn end_of_stream(&mut self) {}
}

impl<F> BatchSink for F
where
    F: FnMut(CompositeBatch) -> Result<(), DeliveryError> + Send + 'static,
{
    fn deliver(&mut self, batch: CompositeBatch) -> Result<(), DeliveryError> {
        self(batch)
    }
}

/// Sink that accepts and drops every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl BatchSink for DiscardSink {
    fn deliver(&mut self, _batch: CompositeBatch) -> Result<(), DeliveryError> {
        Ok(())
    }
}

struct EgressShared {
    state: Mutex<EgressState>,
    ready: Condvar,
    idle: Condvar,
}

struct EgressState {
    buffer: VecDeque<EgressSignal>,
    terminal: bool,
    in_flight: bool,
}

impl EgressState {
    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && !self.in_flight
    }
}

/// Unbounded FIFO between batch assembly and delivery.
#[derive(Clone)]
pub struct EgressQueue {
    shared: Arc<EgressShared>,
}

impl Default for EgressQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EgressShared {
                state: Mutex::new(EgressState {
                    buffer: VecDeque::new(),
                    terminal: false,
                    in_flight: false,
                }),
                ready: Condvar::new(),
                idle: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EgressState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a batch; never blocks.
    pub fn enqueue(&self, batch: CompositeBatch) -> Result<(), EgressError> {
        self.enqueue_signal(EgressSignal::Batch(batch))
    }

    pub fn enqueue_signal(&self, signal: EgressSignal) -> Result<(), EgressError> {
        let mut guard = self.lock();
        if guard.terminal {
            return Err(EgressError::Terminal(signal));
        }
        guard.buffer.push_back(signal);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Signals queued but not yet picked up by the pump.
    pub fn depth(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().terminal
    }

    /// Nothing queued and nothing being delivered.
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Marks the queue terminal and drops pending work, returning how many
    /// signals were discarded.
    pub fn close(&self) -> usize {
        let mut guard = self.lock();
        guard.terminal = true;
        let discarded = guard.buffer.len();
        guard.buffer.clear();
        self.shared.ready.notify_all();
        if guard.is_idle() {
            self.shared.idle.notify_all();
        }
        discarded
    }

    pub fn reopen(&self) {
        let mut guard = self.lock();
        guard.terminal = false;
    }

    /// Drops pending work without changing the terminal flag.
    pub fn discard_pending(&self) -> usize {
        let mut guard = self.lock();
        let discarded = guard.buffer.len();
        guard.buffer.clear();
        if guard.is_idle() {
            self.shared.idle.notify_all();
        }
        discarded
    }

    /// Blocks until the queue is idle or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        while !guard.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .idle
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
        true
    }

    /// Blocks while empty; `None` once terminal and drained.
    fn next(&self) -> Option<EgressSignal> {
        let mut guard = self.lock();
        loop {
            if let Some(signal) = guard.buffer.pop_front() {
                guard.in_flight = true;
                return Some(signal);
            }
            if guard.terminal {
                return None;
            }
            guard = self
                .shared
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn complete(&self) {
        let mut guard = self.lock();
        guard.in_flight = false;
        if guard.is_idle() {
            self.shared.idle.notify_all();
        }
    }
}

/// Spawns the delivery thread. The sink is handed back when the thread exits
/// so the coordinator can restart with the same consumer.
pub(crate) fn spawn_pump(
    name: &str,
    queue: EgressQueue,
    mut sink: Box<dyn BatchSink>,
    metrics: CoordinatorMetrics,
    log: BatchActivityLog,
) -> io::Result<thread::JoinHandle<Box<dyn BatchSink>>> {
    let coordinator = name.to_string();
    thread::Builder::new()
        .name(format!("{}_pump", name))
        .spawn(move || {
            while let Some(signal) = queue.next() {
                pump_signal(&coordinator, sink.as_mut(), signal, &metrics, &log);
                queue.complete();
            }
            debug!(coordinator = %coordinator, "egress pump exiting");
            sink
        })
}

fn pump_signal(
    coordinator: &str,
    sink: &mut dyn BatchSink,
    signal: EgressSignal,
    metrics: &CoordinatorMetrics,
    log: &BatchActivityLog,
) {
    match signal {
        EgressSignal::Batch(batch) => {
            let sequence = batch.sequence();
            trace!(
                coordinator = %coordinator,
                sequence,
                mask = batch.mask().bits(),
                timestamp = ?batch.timestamp(),
                flags = batch.flags().bits(),
                "delivering batch"
            );
            match sink.deliver(batch) {
                Ok(()) => {
                    metrics.record_delivered(1);
                    log.record(BatchActivity::Delivered { sequence });
                }
                Err(err) => {
                    warn!(coordinator = %coordinator, sequence, error = %err, "delivery failed");
                    metrics.record_delivery_failure(1);
                    log.record(BatchActivity::DeliveryFailed {
                        sequence,
                        reason: err.to_string(),
                    });
                }
            }
        }
        EgressSignal::FlushStart => sink.flush(true),
        EgressSignal::FlushStop => sink.flush(false),
        EgressSignal::EndOfStream => sink.end_of_stream(),
    }
}
