//! Per-operation RPC counters backing the RpcStat surface.
//!
//! Each op keeps a lifetime total and a one-second window; a ticker rolls the
//! window into the "current" value clients see.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatOp {
    Put,
    Get,
    Delete,
    Scan,
    KeepAlive,
    Lock,
    Unlock,
    Watch,
}

impl StatOp {
    pub const ALL: [StatOp; 8] = [
        StatOp::Put,
        StatOp::Get,
        StatOp::Delete,
        StatOp::Scan,
        StatOp::KeepAlive,
        StatOp::Lock,
        StatOp::Unlock,
        StatOp::Watch,
    ];

    /// Wire code, 1-based in declaration order.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code.checked_sub(1)? as usize).copied()
    }

    fn slot(self) -> usize {
        match self {
            StatOp::Put => 0,
            StatOp::Get => 1,
            StatOp::Delete => 2,
            StatOp::Scan => 3,
            StatOp::KeepAlive => 4,
            StatOp::Lock => 5,
            StatOp::Unlock => 6,
            StatOp::Watch => 7,
        }
    }
}

#[derive(Default)]
struct OpCounter {
    total: AtomicU64,
    window: AtomicU64,
    current: AtomicI64,
}

pub struct RpcStats {
    started: Instant,
    ops: [OpCounter; 8],
}

impl Default for RpcStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ops: Default::default(),
        }
    }

    pub fn record(&self, op: StatOp) {
        let counter = &self.ops[op.slot()];
        counter.total.fetch_add(1, Ordering::Relaxed);
        counter.window.fetch_add(1, Ordering::Relaxed);
    }

    /// Roll the window counters over; driven by a one-second ticker.
    pub fn tick(&self) {
        for counter in &self.ops {
            let window = counter.window.swap(0, Ordering::Relaxed);
            counter.current.store(window as i64, Ordering::Relaxed);
        }
    }

    /// Ops observed in the last full window.
    pub fn current(&self, op: StatOp) -> i64 {
        self.ops[op.slot()].current.load(Ordering::Relaxed)
    }

    /// Lifetime ops per second.
    pub fn average(&self, op: StatOp) -> i64 {
        let elapsed = self.started.elapsed().as_secs().max(1);
        (self.ops[op.slot()].total.load(Ordering::Relaxed) / elapsed) as i64
    }
}
