// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Self-clearing SPMC ring.
//!
//! Instead of per-reader position cache lines, each slot carries a reader
//! bitmap in its header word. The writer publishes by storing the full
//! mask; each reader clears its own bit with a CAS after copying the
//! payload; a slot is reusable once the bitmap reaches zero. Same
//! message-level contract as [`super::ring`]: every reader sees every
//! message in enqueue order, and a stuck reader eventually blocks the
//! writer one lap later.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::message::{Message, MSG_WORDS};
use crate::{Error, Result};

#[repr(align(64))]
struct BitmapSlot {
    /// Reader bitmap; bit r set means reader r has not consumed yet.
    mask: AtomicU64,
    words: UnsafeCell<[u64; MSG_WORDS]>,
}

struct BitmapState {
    num_slots: usize,
    full_mask: u64,
    slots: Box<[BitmapSlot]>,
}

// SAFETY: payload words are only written while mask == 0 (no reader holds
// the slot; the Release store of the full mask publishes them) and only
// read while the reader's own bit is set (the reader clears it after the
// copy, and the writer waits for zero before rewriting).
unsafe impl Send for BitmapState {}
unsafe impl Sync for BitmapState {}

/// Factory for the self-clearing variant.
pub struct BitmapQueue;

impl BitmapQueue {
    pub fn create(
        num_slots: usize,
        num_readers: usize,
    ) -> Result<(BitmapWriter, Vec<BitmapReader>)> {
        if !num_slots.is_power_of_two() || num_slots < 2 {
            return Err(Error::InvalidArgument(format!(
                "ring capacity must be a power of two >= 2, got {num_slots}"
            )));
        }
        if num_readers == 0 || num_readers > 64 {
            return Err(Error::InvalidArgument(format!(
                "bitmap ring needs 1..=64 readers, got {num_readers}"
            )));
        }

        let full_mask = if num_readers == 64 {
            u64::MAX
        } else {
            (1u64 << num_readers) - 1
        };

        let state = Arc::new(BitmapState {
            num_slots,
            full_mask,
            slots: (0..num_slots)
                .map(|_| BitmapSlot {
                    mask: AtomicU64::new(0),
                    words: UnsafeCell::new([0; MSG_WORDS]),
                })
                .collect(),
        });

        let readers = (0..num_readers)
            .map(|id| BitmapReader {
                state: Arc::clone(&state),
                bit: 1u64 << id,
                pos: 0,
            })
            .collect();

        Ok((BitmapWriter { state, pos: 0 }, readers))
    }
}

/// Single producer of a bitmap ring.
pub struct BitmapWriter {
    state: Arc<BitmapState>,
    pos: usize,
}

impl BitmapWriter {
    /// Publish without blocking; `false` while the slot still carries
    /// unconsumed bits from the previous lap.
    pub fn try_send(&mut self, msg: &Message) -> bool {
        let slot = &self.state.slots[self.pos];
        if slot.mask.load(Ordering::Acquire) != 0 {
            return false;
        }
        // SAFETY: mask == 0 means no reader may touch the payload until
        // the full mask is stored below.
        unsafe {
            *slot.words.get() = msg.words;
        }
        slot.mask.store(self.state.full_mask, Ordering::Release);
        self.pos = (self.pos + 1) % self.state.num_slots;
        true
    }

    /// Publish, spinning until the slot is free.
    pub fn send(&mut self, msg: &Message) {
        let mut spin = super::ring::Spinner::new();
        while !self.try_send(msg) {
            spin.idle();
        }
    }
}

/// One consumer of a bitmap ring.
pub struct BitmapReader {
    state: Arc<BitmapState>,
    bit: u64,
    pos: usize,
}

impl BitmapReader {
    pub fn try_recv(&mut self) -> Option<Message> {
        let slot = &self.state.slots[self.pos];
        if slot.mask.load(Ordering::Acquire) & self.bit == 0 {
            return None;
        }
        // SAFETY: our bit is set, so the writer published this payload
        // and will not rewrite the slot until every bit (ours included)
        // is cleared.
        let words = unsafe { *slot.words.get() };

        // Clear our bit. CAS loop because other readers clear theirs
        // concurrently.
        let mut current = slot.mask.load(Ordering::Relaxed);
        loop {
            debug_assert!(current & self.bit != 0);
            match slot.mask.compare_exchange_weak(
                current,
                current & !self.bit,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        self.pos = (self.pos + 1) % self.state.num_slots;
        Some(Message { words })
    }

    pub fn recv(&mut self) -> Message {
        let mut spin = super::ring::Spinner::new();
        loop {
            if let Some(msg) = self.try_recv() {
                return msg;
            }
            spin.idle();
        }
    }
}
