//! # Tunables
//!
//! The knobs of the scheduler, with the documented defaults and the
//! clamping the attribute surface applies before a value reaches the
//! engine. Time-valued tunables are set in milliseconds and kept
//! internally in microsecond ticks; `back_seek_max` is in KiB (two sectors
//! per KiB).

use crate::Service;

/// Built-in global maximum budget (sectors), also the autotune fallback.
pub const DEFAULT_MAX_BUDGET: Service = 16 * 1024;

/// Max dispatches in one round of service.
pub const DEFAULT_QUANTUM: u32 = 4;

/// Scheduler tunables for one device.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Max requests pulled from the active queue per dispatch round
    pub quantum: u32,
    /// FIFO deadlines (µs): [async, sync]
    pub fifo_expire: [u64; 2],
    /// Maximum backward seek, in KiB
    pub back_seek_max: u64,
    /// Cost multiplier of a backward seek
    pub back_seek_penalty: u32,
    /// Idle-window duration (µs); zero disables idling
    pub slice_idle: u64,
    /// Effective global maximum budget (sectors)
    pub max_budget: Service,
    /// User-pinned maximum budget; zero means autotune from the peak rate
    pub user_max_budget: Service,
    /// Per-slice request quota of async queues
    pub max_budget_async_rq: u32,
    /// Slice timeouts (µs): [async, sync]
    pub timeout: [u64; 2],
    /// Responsiveness mode: always idle on sync non-idle-class queues
    pub desktop: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            fifo_expire: [125_000, 250_000],
            back_seek_max: 16 * 1024,
            back_seek_penalty: 2,
            slice_idle: 8_000,
            max_budget: DEFAULT_MAX_BUDGET,
            user_max_budget: 0,
            max_budget_async_rq: 4,
            timeout: [40_000, 125_000],
            desktop: true,
        }
    }
}

impl Tunables {
    /// FIFO deadline for the given direction (µs).
    pub fn fifo_expire(&self, sync: bool) -> u64 {
        self.fifo_expire[sync as usize]
    }

    /// Slice timeout for the given direction (µs).
    pub fn timeout(&self, sync: bool) -> u64 {
        self.timeout[sync as usize]
    }

    /// Maximum backward seek in sectors.
    pub fn back_seek_max_sectors(&self) -> u64 {
        self.back_seek_max * 2
    }

    pub fn set_quantum(&mut self, value: u32) {
        self.quantum = value.max(1);
    }

    pub fn set_fifo_expire_sync(&mut self, ms: u64) {
        self.fifo_expire[1] = ms.max(1) * 1000;
    }

    pub fn set_fifo_expire_async(&mut self, ms: u64) {
        self.fifo_expire[0] = ms.max(1) * 1000;
    }

    pub fn set_back_seek_max(&mut self, kib: u64) {
        self.back_seek_max = kib;
    }

    pub fn set_back_seek_penalty(&mut self, value: u32) {
        self.back_seek_penalty = value.max(1);
    }

    pub fn set_slice_idle(&mut self, ms: u64) {
        self.slice_idle = ms * 1000;
    }

    pub fn set_max_budget_async_rq(&mut self, value: u32) {
        self.max_budget_async_rq = value.max(1);
    }

    pub fn set_timeout_async(&mut self, ms: u64) {
        self.timeout[0] = ms.max(1) * 1000;
    }

    pub fn set_desktop(&mut self, enabled: bool) {
        self.desktop = enabled;
    }

    // `timeout_sync` and `max_budget` interact with the autotuned maximum
    // budget and are set through the scheduler.
}
