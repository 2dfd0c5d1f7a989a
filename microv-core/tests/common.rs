//! Common test helpers and in-memory backings used across integration
//! tests.

use std::collections::VecDeque;

use microv_core::dispatch::{EntryError, GuestEntry, VmExit};
use microv_core::vcpu::Vcpu;
use microv_hal::memory::{
    FrameAllocator, GuestMemory, MemoryError, PhysicalAddress, PAGE_SIZE,
};

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

/// Hands out zeroed frames from a fixed window of a [`TestMemory`].
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

/// A flat guest page table mapping gla == gpa for the first `pages`
/// pages, placed at `table_base`.
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

/// Guest entry backend that replays a scripted exit stream; an exhausted
/// script halts the guest.
pub struct ScriptedEntry {
    pub script: VecDeque<VmExit>,
}

impl ScriptedEntry {
    pub fn new(events: &[VmExit]) -> Self {
        Self { script: events.iter().copied().collect() }
    }
}

impl GuestEntry for ScriptedEntry {
    fn enter(
        &mut self,
        _vcpu: &mut Vcpu,
        _mem: &mut dyn GuestMemory,
    ) -> Result<VmExit, EntryError> {
        Ok(self.script.pop_front().unwrap_or(VmExit::Hlt))
    }
}
