// ABOUTME: Host port allocator handing out ports from a configured inclusive range
// ABOUTME: Process-local, mutex-guarded; the set is rebuilt empty on daemon restart

use std::collections::BTreeSet;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("port range exhausted: all {0} ports allocated")]
    Exhausted(usize),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Pool of free host ports in `[min, max]`. `allocate` returns the lowest
/// free port; `release` is idempotent.
pub struct PortAllocator {
    min: u16,
    max: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free port in the range.
    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self.allocated.lock().expect("port allocator poisoned");
        for port in self.min..=self.max {
            if !allocated.contains(&port) {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(PortError::Exhausted(allocated.len()))
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        let mut allocated = self.allocated.lock().expect("port allocator poisoned");
        allocated.remove(&port);
    }

    pub fn used_count(&self) -> usize {
        self.allocated.lock().expect("port allocator poisoned").len()
    }
}
