//! Latch buffer - per-entity ring of timed latches keyed by `stamp & LAGAND`

use crate::{
    constants::{LAGAND, MAXLAG},
    latch::{Latch, TimedLatch},
    pool::Handle,
};

/// Where a received stamp falls relative to the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampOrder {
    InOrder,
    /// Older than expected. The cursor does not move.
    OutOfOrder,
    /// Newer than expected. The cursor jumps forward to the stamp.
    Missed,
}

/// Outcome of [`LatchBuffer::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampReceipt {
    pub order: StampOrder,
    /// The frame was already simulated when the packet arrived.
    pub late: bool,
}

impl StampReceipt {
    pub fn is_clean(&self) -> bool {
        self.order == StampOrder::InOrder && !self.late
    }
}

/// Ring buffer of latches for every entity slot of one session.
///
/// Samples are written ahead of time (local capture stamps `current_frame + 1`,
/// received packets carry their own stamp) and consumed when the simulation
/// reaches their frame.
pub struct LatchBuffer {
    samples: Vec<[Option<TimedLatch>; MAXLAG]>,
    next_timestamp: Option<u32>,
    current_frame: u32,
    pending_count: u32,
    out_of_sync: bool,
}

impl LatchBuffer {
    pub fn new(slots: usize) -> Self {
        LatchBuffer {
            samples: vec![[None; MAXLAG]; slots],
            next_timestamp: None,
            current_frame: 0,
            pending_count: 0,
            out_of_sync: false,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.samples.len()
    }

    pub fn lag_frame(stamp: u32) -> usize {
        (stamp & LAGAND) as usize
    }

    /// Last frame the simulation has completed.
    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    pub fn set_current_frame(&mut self, frame: u32) {
        self.current_frame = frame;
    }

    pub fn advance_frame(&mut self) -> u32 {
        self.current_frame = self.current_frame.wrapping_add(1);
        self.current_frame
    }

    pub fn next_timestamp(&self) -> Option<u32> {
        self.next_timestamp
    }

    pub fn set_next_timestamp(&mut self, stamp: Option<u32>) {
        self.next_timestamp = stamp;
    }

    /// Number of received frames not yet consumed.
    pub fn pending_count(&self) -> u32 {
        self.pending_count
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    /// Invalidates every sample of every slot and forgets the expected stamp.
    pub fn reset_all(&mut self) {
        for slot in self.samples.iter_mut() {
            *slot = [None; MAXLAG];
        }
        self.next_timestamp = None;
        self.pending_count = 0;
        self.out_of_sync = false;
    }

    /// Invalidates the history of one slot, e.g. when its entity respawns.
    pub fn reset_slot(&mut self, handle: Handle) {
        if let Some(slot) = self.samples.get_mut(handle.index()) {
            *slot = [None; MAXLAG];
        }
    }

    /// Stores `latch` for `handle` at frame `stamp`.
    pub fn capture_local(&mut self, handle: Handle, stamp: u32, latch: Latch) -> bool {
        let Some(slot) = self.samples.get_mut(handle.index()) else {
            log::warn!("latch for out of range slot {}", handle);
            return false;
        };
        slot[Self::lag_frame(stamp)] = Some(TimedLatch { stamp, latch });
        true
    }

    /// Stages local input for the frame after the current one.
    pub fn capture_next(&mut self, handle: Handle, latch: Latch) -> bool {
        let stamp = self.current_frame.wrapping_add(1);
        self.capture_local(handle, stamp, latch)
    }

    pub fn sample(&self, handle: Handle, stamp: u32) -> Option<&TimedLatch> {
        self.samples
            .get(handle.index())?
            .get(Self::lag_frame(stamp))?
            .as_ref()
            .filter(|sample| sample.stamp == stamp)
    }

    /// Classifies an incoming stamp against the cursor and advances it.
    ///
    /// In-order and missed stamps count as a pending frame; out-of-order
    /// stamps do not. Lateness is judged against the current frame on its own.
    pub fn classify(&mut self, stamp: u32) -> StampReceipt {
        let expected = *self.next_timestamp.get_or_insert(stamp);

        let late = stamp <= self.current_frame;
        if late {
            log::warn!(
                "late latch packet: stamp {} but frame {} is done",
                stamp,
                self.current_frame
            );
            self.out_of_sync = true;
        }

        let order = if stamp < expected {
            log::warn!("out of order latch packet: stamp {} expected {}", stamp, expected);
            self.out_of_sync = true;
            StampOrder::OutOfOrder
        } else if stamp > expected {
            log::warn!("missed latch packets: stamp {} expected {}", stamp, expected);
            self.out_of_sync = true;
            StampOrder::Missed
        } else {
            StampOrder::InOrder
        };

        if order != StampOrder::OutOfOrder {
            self.pending_count += 1;
            self.next_timestamp = Some(stamp.wrapping_add(1));
        }

        StampReceipt { order, late }
    }

    /// Classifies `stamp`, then writes every entry whatever the outcome.
    ///
    /// Out-of-order samples are written too: a stale motion sample in a slot
    /// that gets overwritten before it is consumed does no harm.
    pub fn receive<I>(&mut self, stamp: u32, entries: I) -> StampReceipt
    where
        I: IntoIterator<Item = (Handle, Latch)>,
    {
        let receipt = self.classify(stamp);
        for (handle, latch) in entries {
            self.capture_local(handle, stamp, latch);
        }
        receipt
    }

    /// Valid samples for `stamp`, left in place.
    pub fn peek(&self, stamp: u32) -> impl Iterator<Item = (Handle, Latch)> + '_ {
        let frame = Self::lag_frame(stamp);
        self.samples
            .iter()
            .enumerate()
            .filter_map(move |(index, slot)| match slot[frame] {
                Some(sample) if sample.stamp == stamp => Some((Handle::new(index), sample.latch)),
                _ => None,
            })
    }

    /// Takes every valid sample for `stamp`, invalidating them.
    pub fn consume(&mut self, stamp: u32) -> Vec<(Handle, Latch)> {
        let frame = Self::lag_frame(stamp);
        let mut out = Vec::new();
        for (index, slot) in self.samples.iter_mut().enumerate() {
            if let Some(sample) = slot[frame].filter(|sample| sample.stamp == stamp) {
                out.push((Handle::new(index), sample.latch));
                slot[frame] = None;
            }
        }
        self.pending_count = self.pending_count.saturating_sub(1);
        out
    }
}
