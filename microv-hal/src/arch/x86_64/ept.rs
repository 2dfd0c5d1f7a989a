//! Second-level address translation (EPT on VMX, NPT on SVM)
//!
//! One [`Slat`] hierarchy backs one domain. Tables live in system memory
//! and are reached through [`GuestMemory`], so the same walk code serves
//! the hypervisor and the test harness.

use bitflags::bitflags;

use crate::memory::{FrameAllocator, GuestMemory, MemoryError, PhysicalAddress};
use crate::memory::{PAGE_MASK, PAGE_SIZE};

bitflags! {
    /// Second-level entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlatFlags: u64 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXEC      = 1 << 2;
        const HUGE      = 1 << 7; // 2-MiB or 1-GiB leaf depending on level
        const MEMORY_WB = 6 << 3; // write-back memory type (bits 3..5)
    }
}

const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const ENTRIES_PER_TABLE: u64 = 512;

/// Second-level translation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlatError {
    OutOfFrames,
    NotMapped,
    Misaligned,
    Memory(MemoryError),
}

impl From<MemoryError> for SlatError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::OutOfFrames => SlatError::OutOfFrames,
            other => SlatError::Memory(other),
        }
    }
}

/// A 4-level second-level page-table hierarchy.
pub struct Slat {
    root: PhysicalAddress,
}

fn index(gpa: u64, level: u32) -> u64 {
    (gpa >> (12 + 9 * level)) & (ENTRIES_PER_TABLE - 1)
}

impl Slat {
    /// Allocate an empty hierarchy rooted at a fresh frame.
    pub fn new(alloc: &mut dyn FrameAllocator) -> Result<Self, SlatError> {
        Ok(Self { root: alloc.alloc_frame()? })
    }

    /// Physical address of the root table (bits 12+ of the EPTP / nCR3).
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// EPT pointer value: write-back paging structures, 4-level walk.
    pub fn eptp(&self) -> u64 {
        self.root | (6 << 0) | (3 << 3)
    }

    /// Map `size` bytes of guest-physical space onto system-physical
    /// frames, 4 KiB at a time. Both addresses must be page aligned.
    pub fn map(
        &mut self,
        mem: &mut dyn GuestMemory,
        alloc: &mut dyn FrameAllocator,
        gpa: u64,
        spa: PhysicalAddress,
        size: u64,
        flags: SlatFlags,
    ) -> Result<(), SlatError> {
        if gpa & !PAGE_MASK != 0 || spa & !PAGE_MASK != 0 {
            return Err(SlatError::Misaligned);
        }
        let mut offset = 0;
        while offset < size {
            self.map_page(mem, alloc, gpa + offset, spa + offset, flags)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    fn map_page(
        &mut self,
        mem: &mut dyn GuestMemory,
        alloc: &mut dyn FrameAllocator,
        gpa: u64,
        spa: PhysicalAddress,
        flags: SlatFlags,
    ) -> Result<(), SlatError> {
        let mut table = self.root;
        for level in (1..=3).rev() {
            let entry_spa = table + index(gpa, level) * 8;
            let entry = mem.read_u64(entry_spa)?;
            table = if entry & SlatFlags::READ.bits() == 0 {
                let next = alloc.alloc_frame()?;
                let flags = SlatFlags::READ | SlatFlags::WRITE | SlatFlags::EXEC;
                mem.write_u64(entry_spa, next | flags.bits())?;
                next
            } else {
                entry & ENTRY_ADDR_MASK
            };
        }

        let leaf_spa = table + index(gpa, 0) * 8;
        mem.write_u64(leaf_spa, (spa & ENTRY_ADDR_MASK) | flags.bits())?;
        Ok(())
    }

    /// Remove the mappings covering `[gpa, gpa + size)`. Unmapped pages in
    /// the range are ignored. The caller is responsible for the TLB
    /// invalidation that must follow.
    pub fn unmap(
        &mut self,
        mem: &mut dyn GuestMemory,
        gpa: u64,
        size: u64,
    ) -> Result<(), SlatError> {
        let mut offset = 0;
        while offset < size {
            self.unmap_page(mem, gpa + offset)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    fn unmap_page(&mut self, mem: &mut dyn GuestMemory, gpa: u64) -> Result<(), SlatError> {
        let mut table = self.root;
        for level in (1..=3).rev() {
            let entry = mem.read_u64(table + index(gpa, level) * 8)?;
            if entry & SlatFlags::READ.bits() == 0 {
                return Ok(());
            }
            if entry & SlatFlags::HUGE.bits() != 0 {
                mem.write_u64(table + index(gpa, level) * 8, 0)?;
                return Ok(());
            }
            table = entry & ENTRY_ADDR_MASK;
        }
        mem.write_u64(table + index(gpa, 0) * 8, 0)?;
        Ok(())
    }

    /// Walk the hierarchy for `gpa` and return the system-physical address.
    pub fn translate(
        &self,
        mem: &dyn GuestMemory,
        gpa: u64,
    ) -> Result<PhysicalAddress, SlatError> {
        let mut table = self.root;
        for level in (1..=3).rev() {
            let entry = mem.read_u64(table + index(gpa, level) * 8)?;
            if entry & SlatFlags::READ.bits() == 0 {
                return Err(SlatError::NotMapped);
            }
            if entry & SlatFlags::HUGE.bits() != 0 {
                // 1-GiB leaf at level 2, 2-MiB leaf at level 1
                let page_bits = 12 + 9 * level;
                let page_mask = (1u64 << page_bits) - 1;
                return Ok((entry & ENTRY_ADDR_MASK & !page_mask) | (gpa & page_mask));
            }
            table = entry & ENTRY_ADDR_MASK;
        }

        let entry = mem.read_u64(table + index(gpa, 0) * 8)?;
        if entry & SlatFlags::READ.bits() == 0 {
            return Err(SlatError::NotMapped);
        }
        Ok((entry & ENTRY_ADDR_MASK) | (gpa & !PAGE_MASK))
    }
}
