use crate::batch::{ChannelContribution, CompositeBatch};
use crate::channel::{ChannelError, ChannelHandle, ChannelState, IngestChannel};
use crate::config::{ConfigError, ConfigKnobClass, CoordinatorConfig};
use crate::item::SharedItem;
use crate::observability::{
    BatchActivity, BatchActivityLog, CoordinatorMetrics, DEFAULT_ACTIVITY_CAPACITY,
};
use crate::runtime::egress::{spawn_pump, BatchSink, DiscardSink, EgressQueue, EgressSignal};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Re-check interval while an EOS waits for complete windows to be consumed.
pub const EOS_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Rejected push; the caller keeps ownership of the item.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("channel {channel} is flushing")]
    Flushing {
        channel: ChannelHandle,
        item: SharedItem,
    },
    #[error("channel {channel} reached end of stream")]
    EndOfStream {
        channel: ChannelHandle,
        item: SharedItem,
    },
    #[error("channel {channel} is not attached")]
    UnknownChannel {
        channel: ChannelHandle,
        item: SharedItem,
    },
}

impl PushError {
    pub fn into_item(self) -> SharedItem {
        match self {
            PushError::Flushing { item, .. }
            | PushError::EndOfStream { item, .. }
            | PushError::UnknownChannel { item, .. } => item,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: io::Error,
    },
    #[error("coordinator failed during a previous stop and cannot be restarted")]
    Failed,
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("failed to join {thread} thread")]
    Join { thread: String },
}

/// Lifecycle phase of the coordinator threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Stopped,
    Running,
    Failed,
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub handle: ChannelHandle,
    pub state: ChannelState,
    pub length: usize,
}

struct CoordinatorState {
    config: CoordinatorConfig,
    channels: BTreeMap<u32, IngestChannel>,
    next_index: u32,
    released: BTreeSet<u32>,
    endtime: Option<Instant>,
    position: Duration,
    sequence: u64,
    flush_forwarded: bool,
}

impl CoordinatorState {
    fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            channels: BTreeMap::new(),
            next_index: 0,
            released: BTreeSet::new(),
            endtime: None,
            position: Duration::ZERO,
            sequence: 0,
            flush_forwarded: false,
        }
    }

    /// At least one active channel, and every active channel holds `depth` items.
    fn ready(&self) -> bool {
        let depth = self.config.depth();
        let mut participating = self
            .channels
            .values()
            .filter(|channel| channel.participates())
            .peekable();
        participating.peek().is_some() && participating.all(|channel| channel.length() >= depth)
    }

    fn qualifying(&self) -> Vec<u32> {
        let depth = self.config.depth();
        self.channels
            .values()
            .filter(|channel| channel.qualifies(depth))
            .map(IngestChannel::index)
            .collect()
    }

    fn participating(&self) -> usize {
        self.channels
            .values()
            .filter(|channel| channel.participates())
            .count()
    }

    /// Cadence is kept independent of how long assembly took.
    fn advance_deadline(&mut self) {
        let duration = self.config.duration();
        self.endtime = Some(match self.endtime {
            Some(endtime) => endtime + duration,
            None => Instant::now() + duration,
        });
    }

    fn assemble(&mut self, qualifying: &[u32]) -> CompositeBatch {
        let depth = self.config.depth();
        let duration = self.config.duration();
        let contributions = qualifying
            .iter()
            .filter_map(|index| self.channels.get(index))
            .map(|channel| {
                ChannelContribution::new(
                    channel.handle(),
                    channel.peek_window(depth).cloned().collect(),
                    duration,
                )
            })
            .collect();
        let batch = CompositeBatch::assemble(self.sequence, contributions, self.position, duration);
        self.sequence += 1;
        self.position += duration;
        batch
    }

    fn retire(&mut self, contributed: &[u32]) -> usize {
        let window = self.config.moving_window_size();
        let mut retired = 0;
        for index in contributed {
            if let Some(channel) = self.channels.get_mut(index) {
                retired += channel.retire(window);
            }
        }
        retired
    }

    fn channel(&self, handle: ChannelHandle) -> Result<&IngestChannel, ChannelError> {
        self.channels
            .get(&handle.index())
            .ok_or(ChannelError::Unknown(handle))
    }

    fn channel_mut(&mut self, handle: ChannelHandle) -> Result<&mut IngestChannel, ChannelError> {
        self.channels
            .get_mut(&handle.index())
            .ok_or(ChannelError::Unknown(handle))
    }

    fn all_in(&self, state: ChannelState) -> bool {
        !self.channels.is_empty() && self.channels.values().all(|channel| channel.state() == state)
    }

    fn none_in(&self, state: ChannelState) -> bool {
        self.channels.values().all(|channel| channel.state() != state)
    }
}

/// State shared by the coordinator handle, producer handles and the worker.
struct CoordinatorShared {
    name: String,
    state: Mutex<CoordinatorState>,
    wakeup: Condvar,
    active: AtomicBool,
    egress: EgressQueue,
    metrics: CoordinatorMetrics,
    log: BatchActivityLog,
}

impl CoordinatorShared {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn record_transition(&self, channel: ChannelHandle, from: ChannelState, to: ChannelState) {
        if from == to {
            return;
        }
        trace!(coordinator = %self.name, %channel, %from, %to, "channel state");
        self.log
            .record(BatchActivity::ChannelTransition { channel, from, to });
    }

    fn push(&self, handle: ChannelHandle, item: SharedItem) -> Result<(), PushError> {
        let mut state = self.lock_state();
        let depth = state.config.depth();
        let duration = state.config.duration();
        let Some(channel) = state.channels.get_mut(&handle.index()) else {
            return Err(PushError::UnknownChannel {
                channel: handle,
                item,
            });
        };
        let channel_state = channel.state();
        if !channel_state.is_terminal_for_push() && depth > 1 && item.is_gap() {
            drop(state);
            self.metrics.record_gap_dropped(1);
            self.log.record(BatchActivity::GapDropped(handle));
            debug!(coordinator = %self.name, channel = %handle, "gap items with depth > 1 are not supported, dropping");
            return Ok(());
        }
        if let Err(item) = channel.push(item) {
            drop(state);
            self.metrics.record_push_rejected(1);
            self.log.record(BatchActivity::PushRejected {
                channel: handle,
                state: channel_state,
            });
            debug!(coordinator = %self.name, channel = %handle, state = %channel_state, "push rejected");
            return Err(match channel_state {
                ChannelState::Flushing => PushError::Flushing {
                    channel: handle,
                    item,
                },
                _ => PushError::EndOfStream {
                    channel: handle,
                    item,
                },
            });
        }
        trace!(coordinator = %self.name, channel = %handle, length = channel.length(), "queued item");
        if self.is_active() && state.endtime.is_none() {
            state.endtime = Some(Instant::now() + duration);
        }
        self.wakeup.notify_all();
        Ok(())
    }
}

/// Producer-side handle bound to one channel.
#[derive(Clone)]
pub struct ChannelSender {
    handle: ChannelHandle,
    shared: Arc<CoordinatorShared>,
}

impl ChannelSender {
    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    /// Appends an item without blocking on downstream progress.
    pub fn push(&self, item: impl Into<SharedItem>) -> Result<(), PushError> {
        self.shared.push(self.handle, item.into())
    }
}

struct Lifecycle {
    phase: CoordinatorPhase,
    sink: Option<Box<dyn BatchSink>>,
    worker: Option<thread::JoinHandle<()>>,
    pump: Option<thread::JoinHandle<Box<dyn BatchSink>>>,
}

/// Builder for a coordinator with optional overrides.
pub struct BatchCoordinatorBuilder {
    name: String,
    config: CoordinatorConfig,
    sink: Box<dyn BatchSink>,
    activity_capacity: usize,
}

impl BatchCoordinatorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CoordinatorConfig::default(),
            sink: Box::new(DiscardSink),
            activity_capacity: DEFAULT_ACTIVITY_CAPACITY,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink(mut self, sink: impl BatchSink) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn activity_capacity(mut self, capacity: usize) -> Self {
        self.activity_capacity = capacity;
        self
    }

    pub fn build(self) -> BatchCoordinator {
        BatchCoordinator::with_sink(
            self.name,
            self.config,
            self.sink,
            BatchActivityLog::with_capacity(self.activity_capacity),
        )
    }
}

/// Synchronizes N ingest channels into composite batches.
///
/// One worker thread assembles batches once every active channel holds
/// `depth` items, or, when the per-cycle deadline passes, from whichever
/// channels do. A second thread drains the egress queue into the sink so a
/// slow consumer never stalls assembly.
pub struct BatchCoordinator {
    shared: Arc<CoordinatorShared>,
    lifecycle: Mutex<Lifecycle>,
}

impl BatchCoordinator {
    pub fn new(name: impl Into<String>, config: CoordinatorConfig, sink: impl BatchSink) -> Self {
        Self::with_sink(
            name.into(),
            config,
            Box::new(sink),
            BatchActivityLog::default(),
        )
    }

    fn with_sink(
        name: String,
        config: CoordinatorConfig,
        sink: Box<dyn BatchSink>,
        log: BatchActivityLog,
    ) -> Self {
        let egress = EgressQueue::new();
        egress.close();
        Self {
            shared: Arc::new(CoordinatorShared {
                name,
                state: Mutex::new(CoordinatorState::new(config)),
                wakeup: Condvar::new(),
                active: AtomicBool::new(false),
                egress,
                metrics: CoordinatorMetrics::default(),
                log,
            }),
            lifecycle: Mutex::new(Lifecycle {
                phase: CoordinatorPhase::Stopped,
                sink: Some(sink),
                worker: None,
                pump: None,
            }),
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.lock_lifecycle().phase
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_active()
    }

    /// Spawns the coordinator and pump threads and arms every channel.
    pub fn start(&self) -> Result<(), StartError> {
        let mut lifecycle = self.lock_lifecycle();
        match lifecycle.phase {
            CoordinatorPhase::Running => return Ok(()),
            CoordinatorPhase::Failed => return Err(StartError::Failed),
            CoordinatorPhase::Stopped => {}
        }
        let Some(sink) = lifecycle.sink.take() else {
            lifecycle.phase = CoordinatorPhase::Failed;
            return Err(StartError::Failed);
        };

        self.shared.egress.reopen();
        {
            let mut state = self.shared.lock_state();
            for channel in state.channels.values_mut() {
                let from = channel.arm();
                self.shared
                    .record_transition(channel.handle(), from, ChannelState::Active);
            }
            state.endtime = None;
            state.position = Duration::ZERO;
            state.sequence = 0;
            state.flush_forwarded = false;
            state.released.clear();
            // Backlog queued while stopped arms the deadline like a first push.
            if !state.qualifying().is_empty() {
                state.advance_deadline();
            }
            self.shared.active.store(true, Ordering::Release);
        }

        let pump = match spawn_pump(
            &self.shared.name,
            self.shared.egress.clone(),
            sink,
            self.shared.metrics.clone(),
            self.shared.log.clone(),
        ) {
            Ok(pump) => pump,
            Err(source) => {
                self.deactivate();
                self.shared.egress.close();
                lifecycle.phase = CoordinatorPhase::Failed;
                return Err(StartError::Spawn {
                    thread: format!("{}_pump", self.shared.name),
                    source,
                });
            }
        };

        let shared = self.shared.clone();
        let worker = match thread::Builder::new()
            .name(format!("{}_coordinator", self.shared.name))
            .spawn(move || run_coordinator(shared))
        {
            Ok(worker) => worker,
            Err(source) => {
                self.deactivate();
                self.shared.egress.close();
                match pump.join() {
                    Ok(sink) => {
                        lifecycle.sink = Some(sink);
                        lifecycle.phase = CoordinatorPhase::Stopped;
                    }
                    Err(_) => lifecycle.phase = CoordinatorPhase::Failed,
                }
                return Err(StartError::Spawn {
                    thread: format!("{}_coordinator", self.shared.name),
                    source,
                });
            }
        };

        lifecycle.worker = Some(worker);
        lifecycle.pump = Some(pump);
        lifecycle.phase = CoordinatorPhase::Running;
        self.shared.log.record(BatchActivity::Started);
        info!(coordinator = %self.shared.name, "started worker threads");
        Ok(())
    }

    /// Hard cancellation: wakes and joins both threads, then clears every
    /// channel backlog and the egress queue.
    pub fn stop(&self) -> Result<(), StopError> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.phase != CoordinatorPhase::Running {
            return Ok(());
        }
        info!(coordinator = %self.shared.name, "stopping worker threads");
        self.deactivate();

        let mut failed = None;
        if let Some(worker) = lifecycle.worker.take() {
            if worker.join().is_err() {
                failed = Some(format!("{}_coordinator", self.shared.name));
            }
        }

        let discarded = self.shared.egress.close();
        if discarded > 0 {
            debug!(coordinator = %self.shared.name, discarded, "dropped undelivered egress signals");
        }
        if let Some(pump) = lifecycle.pump.take() {
            match pump.join() {
                Ok(sink) => lifecycle.sink = Some(sink),
                Err(_) => failed = Some(format!("{}_pump", self.shared.name)),
            }
        }

        {
            let mut state = self.shared.lock_state();
            let mut cleared = 0;
            for channel in state.channels.values_mut() {
                cleared += channel.clear();
                let from = channel.disarm();
                self.shared
                    .record_transition(channel.handle(), from, ChannelState::Idle);
            }
            self.shared.metrics.record_discarded(cleared as u64);
            state.endtime = None;
            state.position = Duration::ZERO;
            self.shared.wakeup.notify_all();
        }

        self.shared.log.record(BatchActivity::Stopped);
        if let Some(thread) = failed {
            warn!(coordinator = %self.shared.name, %thread, "failed to join worker thread");
            lifecycle.phase = CoordinatorPhase::Failed;
            return Err(StopError::Join { thread });
        }
        lifecycle.phase = CoordinatorPhase::Stopped;
        Ok(())
    }

    fn deactivate(&self) {
        let _state = self.shared.lock_state();
        self.shared.active.store(false, Ordering::Release);
        self.shared.wakeup.notify_all();
    }

    /// Attaches a channel at the next free index. New channels start idle.
    pub fn create_channel(&self) -> Result<ChannelHandle, ChannelError> {
        let mut state = self.shared.lock_state();
        let mut index = state.next_index;
        while state.channels.contains_key(&index) || state.released.contains(&index) {
            index += 1;
        }
        self.attach(&mut state, index)
    }

    /// Attaches a channel at an explicit index.
    pub fn create_channel_at(&self, index: u32) -> Result<ChannelHandle, ChannelError> {
        let mut state = self.shared.lock_state();
        if state.channels.contains_key(&index) || state.released.contains(&index) {
            return Err(ChannelError::IndexInUse(index));
        }
        self.attach(&mut state, index)
    }

    fn attach(
        &self,
        state: &mut CoordinatorState,
        index: u32,
    ) -> Result<ChannelHandle, ChannelError> {
        let handle = ChannelHandle::new(index)?;
        state.channels.insert(index, IngestChannel::new(handle));
        state.next_index = state.next_index.max(index + 1);
        self.shared.log.record(BatchActivity::ChannelAttached(handle));
        debug!(coordinator = %self.shared.name, channel = %handle, "created channel");
        Ok(handle)
    }

    /// Detaches a channel; only legal once stopped or after EOS drained it.
    pub fn remove_channel(&self, handle: ChannelHandle) -> Result<(), ChannelError> {
        let mut state = self.shared.lock_state();
        let channel = state.channel(handle)?;
        let active = self.shared.is_active();
        if active && !(channel.state() == ChannelState::Eos && channel.is_empty()) {
            return Err(ChannelError::Busy(handle));
        }
        state.channels.remove(&handle.index());
        if active {
            state.released.insert(handle.index());
        }
        self.shared.wakeup.notify_all();
        self.shared.log.record(BatchActivity::ChannelReleased(handle));
        debug!(coordinator = %self.shared.name, channel = %handle, "released channel");
        Ok(())
    }

    pub fn sender(&self, handle: ChannelHandle) -> Result<ChannelSender, ChannelError> {
        self.shared.lock_state().channel(handle)?;
        Ok(ChannelSender {
            handle,
            shared: self.shared.clone(),
        })
    }

    pub fn push(&self, handle: ChannelHandle, item: impl Into<SharedItem>) -> Result<(), PushError> {
        self.shared.push(handle, item.into())
    }

    pub fn channel_len(&self, handle: ChannelHandle) -> Result<usize, ChannelError> {
        Ok(self.shared.lock_state().channel(handle)?.length())
    }

    pub fn channel_state(&self, handle: ChannelHandle) -> Result<ChannelState, ChannelError> {
        Ok(self.shared.lock_state().channel(handle)?.state())
    }

    /// Snapshot of every attached channel, ordered by index.
    pub fn channels(&self) -> Vec<ChannelSnapshot> {
        self.shared
            .lock_state()
            .channels
            .values()
            .map(|channel| ChannelSnapshot {
                handle: channel.handle(),
                state: channel.state(),
                length: channel.length(),
            })
            .collect()
    }

    /// Excludes or re-includes a channel in readiness evaluation.
    pub fn set_idle(&self, handle: ChannelHandle, idle: bool) -> Result<(), ChannelError> {
        let mut state = self.shared.lock_state();
        let channel = state.channel_mut(handle)?;
        let from = channel.set_idle(idle)?;
        let to = channel.state();
        self.shared.record_transition(handle, from, to);
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Discards the backlog and suspends the channel until `flush_stop`.
    pub fn flush_start(&self, handle: ChannelHandle) -> Result<(), ChannelError> {
        let mut state = self.shared.lock_state();
        let channel = state.channel_mut(handle)?;
        let discarded = channel.length();
        let from = channel.set_flushing(true)?;
        self.shared.metrics.record_discarded(discarded as u64);
        self.shared
            .record_transition(handle, from, ChannelState::Flushing);
        self.shared.wakeup.notify_all();

        if state.all_in(ChannelState::Flushing) && !state.flush_forwarded && self.shared.is_active() {
            let dropped = self.shared.egress.discard_pending();
            if self
                .shared
                .egress
                .enqueue_signal(EgressSignal::FlushStart)
                .is_ok()
            {
                state.flush_forwarded = true;
                self.shared.log.record(BatchActivity::FlushStarted);
                debug!(coordinator = %self.shared.name, dropped, "all channels flushing");
            }
        }
        Ok(())
    }

    /// Re-arms a flushing channel.
    pub fn flush_stop(&self, handle: ChannelHandle) -> Result<(), ChannelError> {
        let mut state = self.shared.lock_state();
        let channel = state.channel_mut(handle)?;
        let from = channel.set_flushing(false)?;
        self.shared
            .record_transition(handle, from, ChannelState::Active);
        self.shared.wakeup.notify_all();

        if state.flush_forwarded && state.none_in(ChannelState::Flushing) {
            state.flush_forwarded = false;
            if self
                .shared
                .egress
                .enqueue_signal(EgressSignal::FlushStop)
                .is_ok()
            {
                self.shared.log.record(BatchActivity::FlushStopped);
                debug!(coordinator = %self.shared.name, "all channels left flushing");
            }
        }
        Ok(())
    }

    /// Ends a channel's stream. Waits until complete windows still queued on
    /// the channel were consumed, then discards the remainder.
    pub fn mark_eos(&self, handle: ChannelHandle) -> Result<(), ChannelError> {
        let mut state = self.shared.lock_state();
        loop {
            let depth = state.config.depth();
            let channel = state.channel(handle)?;
            if !self.shared.is_active() || !channel.qualifies(depth) {
                break;
            }
            trace!(coordinator = %self.shared.name, channel = %handle, "waiting until idle");
            let (guard, wait) = self
                .shared
                .wakeup
                .wait_timeout(state, EOS_WAIT_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if wait.timed_out() {
                warn!(coordinator = %self.shared.name, channel = %handle, "timeout while waiting for idle");
            }
        }

        let channel = state.channel_mut(handle)?;
        if channel.state() == ChannelState::Eos {
            return Ok(());
        }
        let discarded = channel.length();
        let from = channel.mark_eos();
        self.shared.metrics.record_discarded(discarded as u64);
        self.shared.record_transition(handle, from, ChannelState::Eos);
        self.shared.wakeup.notify_all();

        if state.all_in(ChannelState::Eos)
            && self.shared.is_active()
            && self
                .shared
                .egress
                .enqueue_signal(EgressSignal::EndOfStream)
                .is_ok()
        {
            self.shared.log.record(BatchActivity::EndOfStream);
            info!(coordinator = %self.shared.name, "all channels reached end of stream");
        }
        Ok(())
    }

    /// Discards a channel's backlog without changing its state.
    pub fn drain_channel(&self, handle: ChannelHandle) -> Result<usize, ChannelError> {
        let mut state = self.shared.lock_state();
        let discarded = state.channel_mut(handle)?.clear();
        self.shared.metrics.record_discarded(discarded as u64);
        self.shared.log.record(BatchActivity::Drained {
            channel: handle,
            discarded,
        });
        self.shared.wakeup.notify_all();
        Ok(discarded)
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.shared.lock_state().config
    }

    /// Hot knob; applies from the next retirement on.
    pub fn set_moving_window_size(&self, size: usize) -> Result<(), ConfigError> {
        let mut state = self.shared.lock_state();
        state.config = state.config.with_moving_window_size(size)?;
        Ok(())
    }

    /// Replaces the configuration. Restart-class knobs need a stopped coordinator.
    pub fn reconfigure(&self, config: CoordinatorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut state = self.shared.lock_state();
        if self.shared.is_active() {
            if let Some(knob) = state
                .config
                .changed_knobs(&config)
                .into_iter()
                .find(|knob| knob.class() == ConfigKnobClass::Restart)
            {
                return Err(ConfigError::RequiresRestart { knob });
            }
        }
        state.config = config;
        Ok(())
    }

    /// Timestamp the next batch will carry.
    pub fn position(&self) -> Duration {
        self.shared.lock_state().position
    }

    pub fn egress_depth(&self) -> usize {
        self.shared.egress.depth()
    }

    /// Blocks until every enqueued batch was handed to the sink.
    pub fn wait_egress_idle(&self, timeout: Duration) -> bool {
        self.shared.egress.wait_idle(timeout)
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.shared.metrics
    }

    pub fn render_metrics(&self) -> String {
        self.shared.metrics.render_metrics(self.egress_depth())
    }

    pub fn activity_log(&self) -> BatchActivityLog {
        self.shared.log.clone()
    }
}

impl Drop for BatchCoordinator {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_coordinator(shared: Arc<CoordinatorShared>) {
    let mut state = shared.lock_state();
    loop {
        let mut timed_out = false;
        while shared.is_active() && !state.ready() {
            match state.endtime {
                None => {
                    state = shared
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(endtime) => {
                    let now = Instant::now();
                    if now >= endtime {
                        debug!(coordinator = %shared.name, "clock timeout, not all channels have items");
                        timed_out = true;
                        break;
                    }
                    let (guard, _) = shared
                        .wakeup
                        .wait_timeout(state, endtime - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }

        if !shared.is_active() {
            let cleared: usize = state.channels.values_mut().map(IngestChannel::clear).sum();
            shared.metrics.record_discarded(cleared as u64);
            break;
        }

        let qualifying = state.qualifying();
        if qualifying.is_empty() {
            debug!(coordinator = %shared.name, "no channel accumulated enough items");
            state.advance_deadline();
            shared.metrics.record_skipped(1);
            shared.log.record(BatchActivity::CycleSkipped);
            continue;
        }
        let partial = timed_out && qualifying.len() < state.participating();

        state.advance_deadline();
        let batch = state.assemble(&qualifying);
        let sequence = batch.sequence();
        let mask = batch.mask();
        shared.metrics.record_assembled(1);
        if partial {
            shared.metrics.record_partial(1);
        }
        shared.log.record(BatchActivity::Assembled {
            sequence,
            mask,
            partial,
        });
        trace!(coordinator = %shared.name, sequence, mask = mask.bits(), partial, "submitting batch");

        if let Err(err) = shared.egress.enqueue(batch) {
            drop(err.into_signal());
            shared.metrics.record_egress_rejected(1);
            shared.log.record(BatchActivity::EgressRejected { sequence });
            debug!(coordinator = %shared.name, sequence, "egress queue is terminal, batch released");
        }

        let retired = state.retire(&qualifying);
        shared.metrics.record_retired(retired as u64);
        shared.wakeup.notify_all();
    }
    debug!(coordinator = %shared.name, "coordinator worker exiting");
}
