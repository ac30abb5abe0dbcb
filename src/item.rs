use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

/// Item shared between a channel backlog and any batch that references it.
pub type SharedItem = Arc<Item>;

/// Flag set carried by items and composite batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ItemFlags(u32);

impl ItemFlags {
    pub const NONE: ItemFlags = ItemFlags(0);
    /// Item carries no payload for its time slot.
    pub const GAP: ItemFlags = ItemFlags(1 << 0);
    pub const DISCONT: ItemFlags = ItemFlags(1 << 1);
    pub const DELTA_UNIT: ItemFlags = ItemFlags(1 << 2);
    pub const MARKER: ItemFlags = ItemFlags(1 << 3);
    pub const CORRUPTED: ItemFlags = ItemFlags(1 << 4);

    pub const fn from_bits(bits: u32) -> Self {
        ItemFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: ItemFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for ItemFlags {
    type Output = ItemFlags;

    fn bitor(self, rhs: ItemFlags) -> ItemFlags {
        ItemFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ItemFlags {
    fn bitor_assign(&mut self, rhs: ItemFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Binary for ItemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Binary::fmt(&self.0, f)
    }
}

/// Opaque payload plus timing metadata produced by one channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Item {
    payload: Arc<[u8]>,
    timestamp: Option<Duration>,
    duration: Option<Duration>,
    flags: ItemFlags,
}

impl Item {
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: None,
            duration: None,
            flags: ItemFlags::NONE,
        }
    }

    /// Zero-size placeholder flagged as a gap.
    pub fn gap() -> Self {
        Self::new(Vec::new()).with_flags(ItemFlags::GAP)
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_flags(mut self, flags: ItemFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn into_shared(self) -> SharedItem {
        Arc::new(self)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    /// True for zero-size items flagged `GAP`.
    pub fn is_gap(&self) -> bool {
        self.payload.is_empty() && self.flags.contains(ItemFlags::GAP)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("size", &self.payload.len())
            .field("timestamp", &self.timestamp)
            .field("duration", &self.duration)
            .field("flags", &format_args!("{:#b}", self.flags))
            .finish()
    }
}
