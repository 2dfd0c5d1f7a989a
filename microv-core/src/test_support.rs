//! In-memory backings shared by the unit tests.

extern crate std;
use std::vec;
use std::vec::Vec;

use microv_hal::arch_impl::ept::{Slat, SlatFlags};
use microv_hal::memory::{
    FrameAllocator, GuestMemory, MemoryError, PhysicalAddress, PAGE_SIZE,
};

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

/// Identity second-level mapping over the first `frames` frames.
pub fn identity_slat(mem: &mut TestMemory, alloc: &mut BumpAllocator, frames: u64) -> Slat {
    let mut slat = Slat::new(alloc).unwrap();
    let flags = SlatFlags::READ | SlatFlags::WRITE | SlatFlags::EXEC;
    slat.map(mem, alloc, 0, 0, frames * PAGE_SIZE, flags).unwrap();
    slat
}

/// A flat guest page table mapping gla == gpa for the first `pages` pages.
/// Tables are placed starting at `table_base` (page aligned).
pub fn flat_guest_tables(mem: &mut TestMemory, table_base: u64, pages: u64) -> u64 {
    const PRESENT_RW: u64 = 0x3;
    let pml4 = table_base;
    let pdpt = table_base + PAGE_SIZE;
    let pd = table_base + 2 * PAGE_SIZE;
    let pt = table_base + 3 * PAGE_SIZE;

    mem.write_u64(pml4, pdpt | PRESENT_RW).unwrap();
    mem.write_u64(pdpt, pd | PRESENT_RW).unwrap();
    mem.write_u64(pd, pt | PRESENT_RW).unwrap();
    for i in 0..pages {
        mem.write_u64(pt + i * 8, (i * PAGE_SIZE) | PRESENT_RW).unwrap();
    }
    pml4
}
