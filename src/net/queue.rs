//! RX/TX queue assignment for functional blocks.
//!
//! Each block instance (one per lcore) asks its interface for a queue once;
//! the assignment is idempotent and the identifier is drawn from a
//! monotonic per-(interface, direction) counter. Queue counts are fixed
//! before stage-1 device configuration, so exceeding them here is a
//! configuration bug, not a runtime condition.

use std::sync::atomic::{AtomicI16, Ordering};

use crate::error::{Error, Result};

/// Maximum number of lcores tracked per interface.
pub const MAX_LCORES: usize = 128;

/// Out-of-band value marking a queue that was never requested.
///
/// The monotonic counter cannot legally reach this value because queue
/// counts are validated at configuration time; the runtime check below is
/// a backstop.
pub const QUEUE_UNALLOCATED: i16 = i16::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Rx,
    Tx,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Rx => "RX",
            QueueType::Tx => "TX",
        }
    }
}

/// Per-direction queue assignment table of one interface.
pub struct QueueMap {
    iface: String,
    ty: QueueType,
    /// Number of queues the device was configured with.
    num_queues: u16,
    /// Assignment per lcore.
    assigned: Vec<AtomicI16>,
    /// The next queue to be handed out. Atomic because multiple blocks
    /// configure their queues on the same interface during stage 1.
    next: AtomicI16,
}

impl QueueMap {
    pub fn new(iface: impl Into<String>, ty: QueueType, num_queues: u16) -> Self {
        let assigned = (0..MAX_LCORES)
            .map(|_| AtomicI16::new(QUEUE_UNALLOCATED))
            .collect();
        Self {
            iface: iface.into(),
            ty,
            num_queues,
            assigned,
            next: AtomicI16::new(-1),
        }
    }

    /// Queue already assigned to `lcore`, if any.
    pub fn get(&self, lcore: usize) -> Option<u16> {
        let v = self.assigned.get(lcore)?.load(Ordering::Acquire);
        (v != QUEUE_UNALLOCATED).then_some(v as u16)
    }

    /// Assign a queue to `lcore`, running `setup` exactly once for a fresh
    /// assignment. Subsequent calls return the cached identifier.
    pub fn take(&self, lcore: usize, setup: impl FnOnce(u16) -> Result<()>) -> Result<u16> {
        if lcore >= MAX_LCORES {
            return Err(Error::Config(format!("lcore {lcore} out of range")));
        }
        if let Some(queue) = self.get(lcore) {
            return Ok(queue);
        }

        let new_id = self.next.fetch_add(1, Ordering::AcqRel) + 1;
        if new_id == QUEUE_UNALLOCATED {
            return Err(Error::QueueExhausted(format!(
                "exhausted all {} queues for the {} interface; this is likely a bug",
                self.ty.as_str(),
                self.iface
            )));
        }
        if new_id < 0 || new_id as u16 >= self.num_queues {
            return Err(Error::QueueExhausted(format!(
                "{} queue request exceeds the {} configured on the {} interface",
                self.ty.as_str(),
                self.num_queues,
                self.iface
            )));
        }

        setup(new_id as u16)?;
        self.assigned[lcore].store(new_id, Ordering::Release);
        Ok(new_id as u16)
    }
}
