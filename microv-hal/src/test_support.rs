//! In-memory backings shared by the unit tests.

extern crate std;
use std::vec;
use std::vec::Vec;

use crate::memory::{FrameAllocator, GuestMemory, MemoryError, PhysicalAddress, PAGE_SIZE};

/// Flat buffer standing in for system-physical memory.
pub struct TestMemory {
    pub bytes: Vec<u8>,
}

impl TestMemory {
    pub fn new(frames: usize) -> Self {
        Self { bytes: vec![0u8; frames * PAGE_SIZE as usize] }
    }
}

impl GuestMemory for TestMemory {
    fn read(&self, spa: PhysicalAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let start = spa as usize;
        let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfRange)?;
        if end > self.bytes.len() {
            return Err(MemoryError::OutOfRange);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, spa: PhysicalAddress, buf: &[u8]) -> Result<(), MemoryError> {
        let start = spa as usize;
        let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfRange)?;
        if end > self.bytes.len() {
            return Err(MemoryError::OutOfRange);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Hands out frames from the low end of a [`TestMemory`]; the buffer is
/// already zeroed, so fresh frames come back clean.
pub struct BumpAllocator {
    next: PhysicalAddress,
    limit: PhysicalAddress,
}

impl BumpAllocator {
    pub fn new(start_frame: u64, frames: u64) -> Self {
        Self {
            next: start_frame * PAGE_SIZE,
            limit: (start_frame + frames) * PAGE_SIZE,
        }
    }
}

impl FrameAllocator for BumpAllocator {
    fn alloc_frame(&mut self) -> Result<PhysicalAddress, MemoryError> {
        if self.next >= self.limit {
            return Err(MemoryError::OutOfFrames);
        }
        let frame = self.next;
        self.next += PAGE_SIZE;
        Ok(frame)
    }
}
