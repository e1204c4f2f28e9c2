// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread affinity and time sources.
//!
//! The engine pins one thread per participating core. Pinning is
//! best-effort: when the process is confined to fewer CPUs than the
//! configuration names (containers, CI), the thread keeps its inherited
//! mask and a warning is logged, but the logical core id is still used as
//! the transport address.

use std::time::Instant;

/// Pin the calling thread to a CPU.
///
/// Returns `true` when the affinity mask was applied.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> bool {
    // SAFETY: cpu_set_t is a plain bitmask; CPU_ZERO/CPU_SET only touch
    // the local variable, and sched_setaffinity(0, ...) targets the
    // calling thread with a mask of the correct size.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            log::warn!("could not pin thread to cpu {cpu}, continuing unpinned");
            return false;
        }
        true
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> bool {
    log::warn!("thread pinning unsupported on this platform (cpu {cpu})");
    false
}

/// Monotonic cycle counter.
///
/// Used only for seeding and coarse poll budgets; all protocol timeouts
/// are computed in milliseconds from `Instant`s at the edges.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn cycles() -> u64 {
    // SAFETY: RDTSC has no memory effects and is available on every
    // x86_64 target this crate supports.
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn cycles() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Small xorshift generator for randomized protocol backoff.
///
/// Seeded from the cycle counter so replicas started in the same
/// millisecond still draw different backoffs.
#[derive(Debug)]
pub struct BackoffRng {
    state: u64,
}

impl BackoffRng {
    pub fn new() -> BackoffRng {
        BackoffRng::from_seed(cycles() | 1)
    }

    pub fn from_seed(seed: u64) -> BackoffRng {
        BackoffRng {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform draw from `[0, range)` milliseconds. `range == 0` yields 0.
    pub fn backoff_ms(&mut self, range: u64) -> u64 {
        if range == 0 {
            return 0;
        }
        self.next_u64() % range
    }
}

impl Default for BackoffRng {
    fn default() -> Self {
        BackoffRng::new()
    }
}
