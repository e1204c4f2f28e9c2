// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Position-based SPMC broadcast ring.
//!
//! # Memory layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | writer position   (slot, epoch)          1 cache line        |
//! +--------------------------------------------------------------+
//! | reader positions  (slot, epoch) x N      1 cache line each   |
//! +--------------------------------------------------------------+
//! | slot[0] .. slot[num_slots-1]             1 cache line each   |
//! +--------------------------------------------------------------+
//! ```
//!
//! A position packs the slot index into the low 32 bits and a one-bit
//! epoch into bit 32. The epoch flips exactly when the position wraps
//! from `num_slots - 1` to `0`; it is the single atomicity point that
//! distinguishes a position from its wrapped-around counterpart.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::message::{Message, MSG_WORDS};
use crate::{Error, Result};

const EPOCH_BIT: u64 = 1 << 32;

#[inline]
const fn pack(slot: u32, epoch: bool) -> u64 {
    slot as u64 | if epoch { EPOCH_BIT } else { 0 }
}

#[inline]
const fn unpack(pos: u64) -> (u32, bool) {
    (pos as u32, pos & EPOCH_BIT != 0)
}

/// Advance a position by one slot, flipping the epoch on wrap.
#[inline]
const fn advance(pos: u64, num_slots: u32) -> u64 {
    let (slot, epoch) = unpack(pos);
    if slot + 1 == num_slots {
        pack(0, !epoch)
    } else {
        pack(slot + 1, epoch)
    }
}

/// `reader` lies strictly before `target` in cyclic order.
///
/// Both positions are always within one epoch of each other, which makes
/// the comparison unambiguous despite the one-bit epoch.
#[inline]
const fn strictly_before(reader: u64, target: u64) -> bool {
    let (rs, re) = unpack(reader);
    let (ts, te) = unpack(target);
    (re == te && rs < ts) || (re != te && rs >= ts)
}

/// Slot writable: the reader either trails the writer in the same epoch,
/// or sits ahead of it in the opposite epoch (it already consumed up to
/// the writer's previous traversal of this slot).
#[inline]
const fn reader_behind(reader: u64, writer: u64) -> bool {
    let (rs, re) = unpack(reader);
    let (ws, we) = unpack(writer);
    (rs <= ws && re == we) || (rs > ws && re != we)
}

/// Slot readable: the writer is ahead of the reader in the same epoch, or
/// already wrapped into the next one.
#[inline]
const fn writer_ahead(writer: u64, reader: u64) -> bool {
    let (ws, we) = unpack(writer);
    let (rs, re) = unpack(reader);
    (ws > rs && we == re) || (ws <= rs && we != re)
}

#[repr(align(64))]
struct Slot {
    words: UnsafeCell<[u64; MSG_WORDS]>,
}

struct RingState {
    num_slots: u32,
    writer_pos: CachePadded<AtomicU64>,
    reader_pos: Box<[CachePadded<AtomicU64>]>,
    slots: Box<[Slot]>,
}

// SAFETY: the slot payloads are plain words behind UnsafeCell. Mutual
// exclusion is positional: the writer only writes slot s after every
// reader's position has passed s (Acquire on reader positions), and a
// reader only reads slot s after the writer's position passed it
// (Acquire on the writer position, which Release-publishes the payload).
unsafe impl Send for RingState {}
unsafe impl Sync for RingState {}

/// Factory for one writer plus its readers.
pub struct ShmQueue;

impl ShmQueue {
    /// Create a ring with `num_slots` slots and `num_readers` readers.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `num_slots` is not a power of two or there
    /// are no readers.
    pub fn create(num_slots: usize, num_readers: usize) -> Result<(ShmWriter, Vec<ShmReader>)> {
        if !num_slots.is_power_of_two() || num_slots < 2 {
            return Err(Error::InvalidArgument(format!(
                "ring capacity must be a power of two >= 2, got {num_slots}"
            )));
        }
        if num_readers == 0 || num_readers > crate::MAX_NUM_REPLICAS {
            return Err(Error::InvalidArgument(format!(
                "ring needs 1..={} readers, got {num_readers}",
                crate::MAX_NUM_REPLICAS
            )));
        }

        let state = Arc::new(RingState {
            num_slots: num_slots as u32,
            writer_pos: CachePadded::new(AtomicU64::new(pack(0, false))),
            reader_pos: (0..num_readers)
                .map(|_| CachePadded::new(AtomicU64::new(pack(0, false))))
                .collect(),
            slots: (0..num_slots)
                .map(|_| Slot {
                    words: UnsafeCell::new([0; MSG_WORDS]),
                })
                .collect(),
        });

        let readers = (0..num_readers)
            .map(|id| ShmReader {
                state: Arc::clone(&state),
                id,
                pos: pack(0, false),
            })
            .collect();

        Ok((
            ShmWriter {
                state,
                pos: pack(0, false),
            },
            readers,
        ))
    }
}

/// The single producer of a ring.
pub struct ShmWriter {
    state: Arc<RingState>,
    /// Local mirror of the shared writer position.
    pos: u64,
}

impl ShmWriter {
    #[inline]
    fn slot_writable(&self) -> bool {
        self.state
            .reader_pos
            .iter()
            .all(|r| reader_behind(r.load(Ordering::Acquire), self.pos))
    }

    #[inline]
    fn write_and_publish(&mut self, msg: &Message) {
        let (slot, _) = unpack(self.pos);
        // SAFETY: slot index is < num_slots by construction, and no reader
        // touches this slot until the writer position advances past it
        // (checked via slot_writable / the caller's spin).
        unsafe {
            *self.state.slots[slot as usize].words.get() = msg.words;
        }
        self.pos = advance(self.pos, self.state.num_slots);
        self.state.writer_pos.store(self.pos, Ordering::Release);
    }

    /// Publish without blocking. Returns `false` when any reader still
    /// occupies the write slot.
    pub fn try_send(&mut self, msg: &Message) -> bool {
        if !self.slot_writable() {
            return false;
        }
        self.write_and_publish(msg);
        true
    }

    /// Publish, spinning until every reader has vacated the write slot.
    ///
    /// A permanently stuck reader blocks this call forever - the ring has
    /// bounded-buffer semantics with no eviction.
    pub fn send(&mut self, msg: &Message) {
        let mut spin = Spinner::new();
        while !self.slot_writable() {
            spin.idle();
        }
        self.write_and_publish(msg);
    }

    /// Publish and wait until every reader has consumed this message.
    ///
    /// This is the tier-2 acknowledgement gate: when it returns, the
    /// command has been delivered to (and taken by) every reader.
    pub fn send_acked(&mut self, msg: &Message) {
        let written = self.pos;
        self.send(msg);
        let target = advance(written, self.state.num_slots);
        for reader in self.state.reader_pos.iter() {
            let mut spin = Spinner::new();
            while strictly_before(reader.load(Ordering::Acquire), target) {
                spin.idle();
            }
        }
    }

    pub fn num_readers(&self) -> usize {
        self.state.reader_pos.len()
    }

    pub fn num_slots(&self) -> usize {
        self.state.num_slots as usize
    }
}

/// One consumer of a ring. Every reader observes the full sequence.
pub struct ShmReader {
    state: Arc<RingState>,
    id: usize,
    /// Local mirror of this reader's shared position.
    pos: u64,
}

impl ShmReader {
    /// Consume the next message if one is published.
    pub fn try_recv(&mut self) -> Option<Message> {
        let writer = self.state.writer_pos.load(Ordering::Acquire);
        if !writer_ahead(writer, self.pos) {
            return None;
        }

        let (slot, _) = unpack(self.pos);
        // SAFETY: the writer position is ahead of ours (Acquire above
        // pairs with the writer's Release), so the payload of this slot
        // is fully written and the writer will not touch it again until
        // our position advances past it.
        let words = unsafe { *self.state.slots[slot as usize].words.get() };

        self.pos = advance(self.pos, self.state.num_slots);
        self.state.reader_pos[self.id].store(self.pos, Ordering::Release);
        Some(Message { words })
    }

    /// Consume the next message, spinning until one is published.
    pub fn recv(&mut self) -> Message {
        let mut spin = Spinner::new();
        loop {
            if let Some(msg) = self.try_recv() {
                return msg;
            }
            spin.idle();
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

/// Escalating busy-wait: pure spin first, then yields, then micro-sleeps
/// so saturated test machines still make progress.
pub(crate) struct Spinner {
    count: u32,
}

impl Spinner {
    pub(crate) fn new() -> Spinner {
        Spinner { count: 0 }
    }

    #[inline]
    pub(crate) fn idle(&mut self) {
        self.count = self.count.saturating_add(1);
        if self.count < 256 {
            std::hint::spin_loop();
        } else if self.count < 4096 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(std::time::Duration::from_micros(10));
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}
