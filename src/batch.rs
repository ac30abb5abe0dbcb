use crate::channel::ChannelHandle;
use crate::item::{ItemFlags, SharedItem};
use std::fmt;
use std::time::Duration;

/// Provenance bitmask: bit `i` is set iff channel `i` contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask(u64);

impl ChannelMask {
    pub const fn empty() -> Self {
        ChannelMask(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        ChannelMask(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn set(&mut self, channel: ChannelHandle) {
        self.0 |= channel.bit();
    }

    pub fn contains(self, channel: ChannelHandle) -> bool {
        self.0 & channel.bit() != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Binary for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Binary::fmt(&self.0, f)
    }
}

/// `depth` consecutive items taken from one channel, oldest first.
#[derive(Debug, Clone)]
pub struct ChannelContribution {
    channel: ChannelHandle,
    items: Vec<SharedItem>,
    timestamp: Option<Duration>,
    duration: Duration,
    flags: ItemFlags,
}

impl ChannelContribution {
    pub(crate) fn new(channel: ChannelHandle, items: Vec<SharedItem>, duration: Duration) -> Self {
        let timestamp = items.first().and_then(|item| item.timestamp());
        let flags = items
            .iter()
            .fold(ItemFlags::NONE, |acc, item| acc | item.flags());
        Self {
            channel,
            items,
            timestamp,
            duration,
            flags,
        }
    }

    pub fn channel(&self) -> ChannelHandle {
        self.channel
    }

    pub fn items(&self) -> &[SharedItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Timestamp of the oldest contributing item.
    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    /// A gap contribution adds no payload to the batch.
    pub fn is_gap(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.is_gap())
    }

    /// Payload bytes this contribution adds to the batch.
    pub fn size(&self) -> usize {
        if self.is_gap() {
            return 0;
        }
        self.items.iter().map(|item| item.size()).sum()
    }
}

/// Output unit assembled from every qualifying channel in one cycle.
#[derive(Debug, Clone)]
pub struct CompositeBatch {
    sequence: u64,
    contributions: Vec<ChannelContribution>,
    mask: ChannelMask,
    flags: ItemFlags,
    timestamp: Duration,
    duration: Duration,
}

impl CompositeBatch {
    pub(crate) fn assemble(
        sequence: u64,
        contributions: Vec<ChannelContribution>,
        timestamp: Duration,
        duration: Duration,
    ) -> Self {
        let mut mask = ChannelMask::empty();
        let mut flags = ItemFlags::NONE;
        for contribution in &contributions {
            mask.set(contribution.channel());
            flags |= contribution.flags();
        }
        if contributions.iter().all(ChannelContribution::is_gap) {
            flags |= ItemFlags::GAP;
        }
        Self {
            sequence,
            contributions,
            mask,
            flags,
            timestamp,
            duration,
        }
    }

    /// Assembly cycle counter, starting at zero after each start.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn contributions(&self) -> &[ChannelContribution] {
        &self.contributions
    }

    pub fn contribution(&self, channel: ChannelHandle) -> Option<&ChannelContribution> {
        self.contributions
            .iter()
            .find(|contribution| contribution.channel() == channel)
    }

    pub fn mask(&self) -> ChannelMask {
        self.mask
    }

    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// True when every contribution is a gap, i.e. the batch carries no payload.
    pub fn is_gap(&self) -> bool {
        self.flags.contains(ItemFlags::GAP) && self.size() == 0
    }

    pub fn size(&self) -> usize {
        self.contributions.iter().map(ChannelContribution::size).sum()
    }

    pub fn item_count(&self) -> usize {
        self.contributions.iter().map(ChannelContribution::len).sum()
    }
}
