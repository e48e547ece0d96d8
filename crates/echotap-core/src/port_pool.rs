//! Fixed-range UDP port allocator shared by all channel wiring.

use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
/// Errors surfaced by [`PortPool`].
pub enum PortPoolError {
    #[error("no free port in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
}

/// Hands out unique UDP ports from a fixed inclusive interval.
///
/// One allocation bitset under one mutex; both operations are brief. The
/// pool lives for the whole process and never shrinks.
#[derive(Debug)]
pub struct PortPool {
    min: u16,
    max: u16,
    allocated: Mutex<Vec<bool>>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Result<Self, PortPoolError> {
        if min == 0 || min > max {
            return Err(PortPoolError::InvalidRange { min, max });
        }
        let size = usize::from(max - min) + 1;
        Ok(Self {
            min,
            max,
            allocated: Mutex::new(vec![false; size]),
        })
    }

    /// Returns the lowest-numbered free port, marking it allocated.
    pub fn allocate(&self) -> Result<u16, PortPoolError> {
        let mut slots = self.allocated.lock().expect("port pool lock poisoned");
        for (index, taken) in slots.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return Ok(self.min + index as u16);
            }
        }
        Err(PortPoolError::Exhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Returns a port to the pool. Idempotent; out-of-range and
    /// already-free ports are ignored.
    pub fn release(&self, port: u16) {
        if port < self.min || port > self.max {
            return;
        }
        let mut slots = self.allocated.lock().expect("port pool lock poisoned");
        slots[usize::from(port - self.min)] = false;
    }

    pub fn in_use_count(&self) -> usize {
        let slots = self.allocated.lock().expect("port pool lock poisoned");
        slots.iter().filter(|taken| **taken).count()
    }
}
