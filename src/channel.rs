use crate::item::SharedItem;
use std::collections::vec_deque::Iter;
use std::collections::VecDeque;
use std::fmt;
use std::iter::Take;
use thiserror::Error;

/// Width of the provenance bitmask and therefore the channel index space.
pub const MAX_CHANNELS: u32 = 64;

/// Stable index of a channel inside the coordinator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(u32);

impl ChannelHandle {
    pub(crate) fn new(index: u32) -> Result<Self, ChannelError> {
        if index >= MAX_CHANNELS {
            return Err(ChannelError::IndexOutOfRange(index));
        }
        Ok(Self(index))
    }

    pub fn index(self) -> u32 {
        self.0
    }

    /// Bit position of this channel inside a batch mask.
    pub fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink_{}", self.0)
    }
}

/// Lifecycle of an ingest channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Active,
    Idle,
    Flushing,
    Eos,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Active => "active",
            ChannelState::Idle => "idle",
            ChannelState::Flushing => "flushing",
            ChannelState::Eos => "eos",
        }
    }

    /// Whether pushes are refused in this state.
    pub fn is_terminal_for_push(self) -> bool {
        matches!(self, ChannelState::Flushing | ChannelState::Eos)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by channel management calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("unknown channel {0}")]
    Unknown(ChannelHandle),
    #[error("channel index {0} is outside the 64-bit provenance mask")]
    IndexOutOfRange(u32),
    #[error("channel index {0} is already attached")]
    IndexInUse(u32),
    #[error("channel {channel} cannot move from {from} to {to}")]
    InvalidTransition {
        channel: ChannelHandle,
        from: ChannelState,
        to: ChannelState,
    },
    #[error("channel {0} is busy; stop the coordinator or drain it to EOS first")]
    Busy(ChannelHandle),
}

/// Per-producer backlog plus lifecycle state.
///
/// Items leave the backlog only through [`IngestChannel::retire`] or
/// [`IngestChannel::clear`]; nothing else removes them.
#[derive(Debug)]
pub struct IngestChannel {
    handle: ChannelHandle,
    state: ChannelState,
    items: VecDeque<SharedItem>,
}

impl IngestChannel {
    /// New channels start idle until the coordinator arms them.
    pub fn new(handle: ChannelHandle) -> Self {
        Self {
            handle,
            state: ChannelState::Idle,
            items: VecDeque::new(),
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Appends to the tail; a flushing or EOS channel hands the item back.
    pub fn push(&mut self, item: SharedItem) -> Result<(), SharedItem> {
        if self.state.is_terminal_for_push() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest `depth` items, oldest first.
    pub fn peek_window(&self, depth: usize) -> Take<Iter<'_, SharedItem>> {
        self.items.iter().take(depth)
    }

    /// Removes up to `n` of the oldest items, returning how many were removed.
    pub fn retire(&mut self, n: usize) -> usize {
        let count = n.min(self.items.len());
        self.items.drain(..count);
        count
    }

    /// Discards the whole backlog, returning how many items were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    /// Whether this channel takes part in readiness evaluation.
    pub fn participates(&self) -> bool {
        self.state == ChannelState::Active
    }

    /// A participating channel holding at least `depth` items.
    pub fn qualifies(&self, depth: usize) -> bool {
        self.participates() && self.items.len() >= depth
    }

    /// Active ⇄ Idle. Other states are left to flush/EOS handling.
    pub fn set_idle(&mut self, idle: bool) -> Result<ChannelState, ChannelError> {
        let target = if idle {
            ChannelState::Idle
        } else {
            ChannelState::Active
        };
        match self.state {
            ChannelState::Active | ChannelState::Idle => Ok(self.transition(target)),
            from => Err(ChannelError::InvalidTransition {
                channel: self.handle,
                from,
                to: target,
            }),
        }
    }

    /// Flush start discards the backlog; flush stop re-arms the channel.
    pub fn set_flushing(&mut self, flushing: bool) -> Result<ChannelState, ChannelError> {
        if flushing {
            if self.state == ChannelState::Eos {
                return Err(ChannelError::InvalidTransition {
                    channel: self.handle,
                    from: self.state,
                    to: ChannelState::Flushing,
                });
            }
            self.items.clear();
            Ok(self.transition(ChannelState::Flushing))
        } else {
            if self.state != ChannelState::Flushing {
                return Err(ChannelError::InvalidTransition {
                    channel: self.handle,
                    from: self.state,
                    to: ChannelState::Active,
                });
            }
            Ok(self.transition(ChannelState::Active))
        }
    }

    /// Terminal transition; any remaining backlog is discarded.
    pub fn mark_eos(&mut self) -> ChannelState {
        self.items.clear();
        self.transition(ChannelState::Eos)
    }

    /// Re-arms the channel when the coordinator starts.
    pub(crate) fn arm(&mut self) -> ChannelState {
        self.transition(ChannelState::Active)
    }

    pub(crate) fn disarm(&mut self) -> ChannelState {
        self.items.clear();
        self.transition(ChannelState::Idle)
    }

    fn transition(&mut self, next: ChannelState) -> ChannelState {
        std::mem::replace(&mut self.state, next)
    }
}
