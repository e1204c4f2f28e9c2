// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pairwise reliable FIFO channel.
//!
//! A channel is two single-writer single-reader rings (one per direction)
//! of epoch-tagged, cache-line slots, plus one shared wake word. The slot
//! control word packs:
//!
//! ```text
//! bit 31      epoch (flips on every ring wrap)
//! bits 16-30  frame tag (0 = data, 0x7FFF = explicit ACK)
//! bits  0-15  piggybacked ack: sender's last received sequence number
//! ```
//!
//! Flow control is credit based: a side may have at most `capacity`
//! frames outstanding (`next_id - ack_id <= capacity`, wrapping u16
//! arithmetic). Acks normally piggyback on reverse traffic; a receiver
//! that has consumed `capacity - 1` frames since its last ack sends an
//! explicit zero-payload ACK frame so a one-directional stream never
//! starves the sender of credit.
//!
//! Blocking operations spin for a budget, then CAS the shared wake word
//! from RUNNING into their side's WAIT state, re-check (the double-check
//! closes the lost-wake race), and park on a condvar. The peer's submit
//! path notifies the parked side.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::message::{Message, MSG_WORDS};
use crate::{Error, Result};

/// Frame tag of an explicit ACK (all tag bits set).
const ACK_FRAME: u16 = 0x7FFF;
/// Frame tag of application data.
const DATA_FRAME: u16 = 0;

/// Wake word states.
const RUNNING: u32 = 0;
const WAIT_SIDE: [u32; 2] = [1, 2];

/// Iterations of the polling budget before a blocked side tries to park.
const POLL_BUDGET: u32 = 4096;

#[inline]
const fn ctrl_word(epoch: bool, tag: u16, ack: u16) -> u32 {
    ((epoch as u32) << 31) | ((tag as u32) << 16) | ack as u32
}

#[inline]
const fn ctrl_epoch(ctrl: u32) -> bool {
    ctrl >> 31 != 0
}

#[inline]
const fn ctrl_tag(ctrl: u32) -> u16 {
    ((ctrl >> 16) & 0x7FFF) as u16
}

#[inline]
const fn ctrl_ack(ctrl: u32) -> u16 {
    ctrl as u16
}

#[repr(align(64))]
struct UmpSlot {
    ctrl: AtomicU32,
    data: UnsafeCell<[u64; MSG_WORDS]>,
}

struct Direction {
    slots: Box<[UmpSlot]>,
}

/// Parking spot for one side: an atomic flag for the lock-free fast path
/// and a condvar for the idle path.
struct Parker {
    ready: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    fn new() -> Parker {
        Parker {
            ready: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        self.ready.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Park until notified or the timeout elapses. The caller re-checks
    /// its condition either way.
    fn wait(&self, timeout: Duration) {
        if self.ready.swap(false, Ordering::Acquire) {
            return;
        }
        let mut sleeping = self.sleeping.lock();
        if self.ready.swap(false, Ordering::Acquire) {
            return;
        }
        *sleeping = true;
        self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;
        self.ready.store(false, Ordering::Release);
    }
}

pub(crate) struct ChannelCore {
    capacity: u16,
    dirs: [Direction; 2],
    wake: AtomicU32,
    parkers: [Parker; 2],
}

// SAFETY: each direction's slots have exactly one writer (the endpoint of
// that side, unique by construction) and one reader. The epoch bit in the
// control word is the atomicity point: payload writes happen before the
// Release store of the control word, and the reader's Acquire load of it
// orders the payload read after.
unsafe impl Send for ChannelCore {}
unsafe impl Sync for ChannelCore {}

impl ChannelCore {
    pub(crate) fn new(capacity: usize) -> Result<Arc<ChannelCore>> {
        if !capacity.is_power_of_two() || capacity < 2 || capacity > 1 << 14 {
            return Err(Error::InvalidArgument(format!(
                "channel capacity must be a power of two in [2, 16384], got {capacity}"
            )));
        }
        let make_dir = || Direction {
            slots: (0..capacity)
                .map(|_| UmpSlot {
                    ctrl: AtomicU32::new(0),
                    data: UnsafeCell::new([0; MSG_WORDS]),
                })
                .collect(),
        };
        Ok(Arc::new(ChannelCore {
            capacity: capacity as u16,
            dirs: [make_dir(), make_dir()],
            wake: AtomicU32::new(RUNNING),
            parkers: [Parker::new(), Parker::new()],
        }))
    }
}

/// Factory for a standalone channel (the mesh creates its endpoints
/// directly from [`ChannelCore`]).
pub struct ChannelPair;

impl ChannelPair {
    /// Create both endpoints of a channel with `capacity` slots per
    /// direction.
    pub fn create(capacity: usize) -> Result<(Endpoint, Endpoint)> {
        let core = ChannelCore::new(capacity)?;
        Ok((Endpoint::new(Arc::clone(&core), 0), Endpoint::new(core, 1)))
    }
}

/// One side of a channel. Owns the private sequence state; not shareable
/// between threads.
pub struct Endpoint {
    core: Arc<ChannelCore>,
    side: usize,

    tx_pos: u16,
    tx_epoch: bool,
    rx_pos: u16,
    rx_epoch: bool,

    /// Sequence number of the next frame to send.
    next_id: u16,
    /// Last sequence number received from the peer.
    seq_id: u16,
    /// Last of our frames the peer acknowledged.
    ack_id: u16,
    /// Last ack we delivered to the peer.
    last_ack: u16,
}

impl Endpoint {
    pub(crate) fn new(core: Arc<ChannelCore>, side: usize) -> Endpoint {
        debug_assert!(side < 2);
        Endpoint {
            core,
            side,
            tx_pos: 0,
            tx_epoch: true,
            rx_pos: 0,
            rx_epoch: true,
            next_id: 1,
            seq_id: 0,
            ack_id: 0,
            last_ack: 0,
        }
    }

    #[inline]
    fn tx_dir(&self) -> &Direction {
        &self.core.dirs[self.side]
    }

    #[inline]
    fn rx_dir(&self) -> &Direction {
        &self.core.dirs[1 - self.side]
    }

    /// Credit check: at most `capacity` frames outstanding.
    #[inline]
    fn can_submit(&self) -> bool {
        self.next_id.wrapping_sub(self.ack_id) <= self.core.capacity
    }

    /// A frame (data or ack) is ready at our read position.
    #[inline]
    fn rx_ready(&self) -> bool {
        let slot = &self.rx_dir().slots[self.rx_pos as usize];
        ctrl_epoch(slot.ctrl.load(Ordering::Acquire)) == self.rx_epoch
    }

    fn submit(&mut self, msg: &Message, tag: u16) {
        debug_assert!(self.can_submit());
        let slot = &self.tx_dir().slots[self.tx_pos as usize];
        // SAFETY: flow control guarantees the peer consumed this slot on
        // the previous lap (at most `capacity` frames outstanding), so we
        // are the only party touching the payload until the control word
        // below publishes it.
        unsafe {
            *slot.data.get() = msg.words;
        }
        slot.ctrl.store(
            ctrl_word(self.tx_epoch, tag, self.seq_id),
            Ordering::Release,
        );
        self.last_ack = self.seq_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.tx_pos += 1;
        if self.tx_pos == self.core.capacity {
            self.tx_pos = 0;
            self.tx_epoch = !self.tx_epoch;
        }

        // Wake the peer if it parked.
        let peer = 1 - self.side;
        if self.core.wake.load(Ordering::Acquire) == WAIT_SIDE[peer] {
            self.core.parkers[peer].notify();
        }
    }

    /// Take the frame at the read position. Caller checked `rx_ready`.
    fn take(&mut self) -> (u16, Message) {
        let slot = &self.rx_dir().slots[self.rx_pos as usize];
        let ctrl = slot.ctrl.load(Ordering::Acquire);
        debug_assert_eq!(ctrl_epoch(ctrl), self.rx_epoch);
        // SAFETY: the epoch matched under an Acquire load, so the peer's
        // payload write happens-before this read, and the peer will not
        // rewrite the slot until we grant credit for a full lap.
        let words = unsafe { *slot.data.get() };

        self.ack_id = ctrl_ack(ctrl);
        self.seq_id = self.seq_id.wrapping_add(1);

        self.rx_pos += 1;
        if self.rx_pos == self.core.capacity {
            self.rx_pos = 0;
            self.rx_epoch = !self.rx_epoch;
        }

        self.maybe_ack();
        (ctrl_tag(ctrl), Message { words })
    }

    /// Explicit ack once the distance to our last ack reaches
    /// `capacity - 1`; piggybacking alone cannot keep a one-directional
    /// stream alive.
    fn maybe_ack(&mut self) {
        if self.seq_id.wrapping_sub(self.last_ack) >= self.core.capacity - 1 && self.can_submit() {
            self.submit(&Message::default(), ACK_FRAME);
        }
    }

    /// Consume any explicit ACK frames queued ahead of data.
    fn drain_acks(&mut self) {
        while self.rx_ready() {
            let slot = &self.rx_dir().slots[self.rx_pos as usize];
            if ctrl_tag(slot.ctrl.load(Ordering::Acquire)) != ACK_FRAME {
                break;
            }
            let _ = self.take();
        }
    }

    /// Non-blocking send. `false` means the credit window is exhausted.
    pub fn try_send(&mut self, msg: &Message) -> bool {
        if !self.can_submit() {
            self.drain_acks();
        }
        if !self.can_submit() {
            return false;
        }
        self.submit(msg, DATA_FRAME);
        true
    }

    /// Non-blocking receive of the next data message.
    pub fn try_recv(&mut self) -> Option<Message> {
        while self.rx_ready() {
            let (tag, msg) = self.take();
            if tag != ACK_FRAME {
                return Some(msg);
            }
        }
        None
    }

    /// A data message is available.
    pub fn can_recv(&mut self) -> bool {
        self.drain_acks();
        self.rx_ready()
    }

    /// Blocking send: poll budget, then CAS into WAIT and park.
    pub fn send(&mut self, msg: &Message) {
        if self.try_send(msg) {
            return;
        }
        loop {
            for _ in 0..POLL_BUDGET {
                if self.try_send(msg) {
                    return;
                }
                std::hint::spin_loop();
            }
            if self.try_wait() {
                self.core.parkers[self.side].wait(Duration::from_millis(1));
                self.wake_self();
            }
        }
    }

    /// Blocking receive.
    pub fn recv(&mut self) -> Message {
        if let Some(msg) = self.try_recv() {
            return msg;
        }
        loop {
            for _ in 0..POLL_BUDGET {
                if let Some(msg) = self.try_recv() {
                    return msg;
                }
                std::hint::spin_loop();
            }
            if self.try_wait() {
                self.core.parkers[self.side].wait(Duration::from_millis(1));
                self.wake_self();
            }
            if let Some(msg) = self.try_recv() {
                return msg;
            }
        }
    }

    /// Transition into our WAIT state. Returns `false` when a frame
    /// arrived during the CAS (the lost-wake double check).
    fn try_wait(&mut self) -> bool {
        if self.rx_ready() {
            return false;
        }
        if self
            .core
            .wake
            .compare_exchange(
                RUNNING,
                WAIT_SIDE[self.side],
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        if self.rx_ready() {
            // Frame raced with the CAS: wake up again.
            self.core.wake.store(RUNNING, Ordering::Release);
            return false;
        }
        true
    }

    fn wake_self(&mut self) {
        self.core.wake.store(RUNNING, Ordering::Release);
    }
}
