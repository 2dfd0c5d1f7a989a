//! Guest page-table walk (gla → gpa)
//!
//! The guest's own 4-level tables live in guest-physical space, so every
//! table access is itself pushed through the domain's second-level tables
//! before the entry can be read. 4-KiB, 2-MiB and 1-GiB leaves are
//! handled.
//!
//! TODO: the walk assumes flat segmentation; a 16-bit guest with non-zero
//! segment bases needs the effective-address adjustment before the walk.

use crate::memory::{GuestMemory, MemoryError, MemoryFlags, VirtualAddress};
use super::ept::{Slat, SlatError};

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_HUGE: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Guest walk errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// A paging-structure entry at the given level (3 = PML4E) was not
    /// present.
    NotPresent(u32),
    Slat(SlatError),
    Memory(MemoryError),
}

impl From<SlatError> for WalkError {
    fn from(e: SlatError) -> Self {
        WalkError::Slat(e)
    }
}

impl From<MemoryError> for WalkError {
    fn from(e: MemoryError) -> Self {
        WalkError::Memory(e)
    }
}

/// Result of a guest-linear translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlaTranslation {
    /// The virtual address as presented by the guest.
    pub vaddr: VirtualAddress,
    /// The linear address that was walked (equal to `vaddr` under flat
    /// segmentation).
    pub laddr: VirtualAddress,
    /// The resulting guest-physical address.
    pub gpa: u64,
    /// Effective permissions accumulated across the walk.
    pub flags: MemoryFlags,
}

fn entry_at(
    mem: &dyn GuestMemory,
    slat: &Slat,
    table_gpa: u64,
    index: u64,
) -> Result<u64, WalkError> {
    let spa = slat.translate(mem, table_gpa + index * 8)?;
    Ok(mem.read_u64(spa)?)
}

/// Walk the guest's page tables rooted at `cr3` for `gla`.
pub fn walk_guest(
    mem: &dyn GuestMemory,
    slat: &Slat,
    cr3: u64,
    gla: VirtualAddress,
) -> Result<GlaTranslation, WalkError> {
    let mut table = cr3 & PTE_ADDR_MASK;
    let mut flags = MemoryFlags::READABLE | MemoryFlags::WRITABLE | MemoryFlags::EXECUTABLE;

    for level in (0..=3).rev() {
        let index = (gla >> (12 + 9 * level)) & 0x1FF;
        let entry = entry_at(mem, slat, table, index)?;

        if entry & PTE_PRESENT == 0 {
            return Err(WalkError::NotPresent(level));
        }
        if entry & PTE_WRITABLE == 0 {
            flags.remove(MemoryFlags::WRITABLE);
        }
        if entry & PTE_NX != 0 {
            flags.remove(MemoryFlags::EXECUTABLE);
        }
        if entry & PTE_USER != 0 {
            flags.insert(MemoryFlags::USER_ACCESSIBLE);
        }

        let is_leaf = level == 0 || (level < 3 && entry & PTE_HUGE != 0);
        if is_leaf {
            let page_bits = 12 + 9 * level;
            let page_mask = (1u64 << page_bits) - 1;
            let gpa = (entry & PTE_ADDR_MASK & !page_mask) | (gla & page_mask);
            return Ok(GlaTranslation { vaddr: gla, laddr: gla, gpa, flags });
        }

        table = entry & PTE_ADDR_MASK;
    }

    unreachable!("level 0 always terminates the walk");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::ept::SlatFlags;
    use crate::memory::PAGE_SIZE;
    use crate::test_support::{BumpAllocator, TestMemory};

    // Identity second-level mapping over the first `frames` frames, so the
    // guest-physical layout written below is also the system-physical one.
    fn identity_slat(mem: &mut TestMemory, alloc: &mut BumpAllocator, frames: u64) -> Slat {
        let mut slat = Slat::new(alloc).unwrap();
        let flags = SlatFlags::READ | SlatFlags::WRITE | SlatFlags::EXEC;
        slat.map(mem, alloc, 0, 0, frames * PAGE_SIZE, flags).unwrap();
        slat
    }

    // Lay out a tiny guest page table: PML4 @ 0x10000, PDPT @ 0x11000,
    // PD @ 0x12000, PT @ 0x13000, mapping gla 0x0000..0x2000 to
    // gpa 0x20000..0x22000.
    fn build_guest_tables(mem: &mut TestMemory) -> u64 {
        let cr3 = 0x10000u64;
        mem.write_u64(0x10000, 0x11000 | PTE_PRESENT | PTE_WRITABLE).unwrap();
        mem.write_u64(0x11000, 0x12000 | PTE_PRESENT | PTE_WRITABLE).unwrap();
        mem.write_u64(0x12000, 0x13000 | PTE_PRESENT | PTE_WRITABLE).unwrap();
        mem.write_u64(0x13000, 0x20000 | PTE_PRESENT | PTE_WRITABLE).unwrap();
        mem.write_u64(0x13008, 0x21000 | PTE_PRESENT).unwrap();
        cr3
    }

    #[test]
    fn four_level_walk_resolves() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(40, 24);
        let slat = identity_slat(&mut mem, &mut alloc, 40);
        let cr3 = build_guest_tables(&mut mem);

        let t = walk_guest(&mem, &slat, cr3, 0x0ABC).unwrap();
        assert_eq!(t.gpa, 0x20ABC);
        assert!(t.flags.contains(MemoryFlags::WRITABLE));
    }

    #[test]
    fn write_protection_is_accumulated() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(40, 24);
        let slat = identity_slat(&mut mem, &mut alloc, 40);
        let cr3 = build_guest_tables(&mut mem);

        // Second page's PTE lacks the writable bit.
        let t = walk_guest(&mem, &slat, cr3, 0x1008).unwrap();
        assert_eq!(t.gpa, 0x21008);
        assert!(!t.flags.contains(MemoryFlags::WRITABLE));
    }

    #[test]
    fn non_present_entry_reports_level() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(40, 24);
        let slat = identity_slat(&mut mem, &mut alloc, 40);
        let cr3 = build_guest_tables(&mut mem);

        assert_eq!(
            walk_guest(&mem, &slat, cr3, 0x0000_8000_0000),
            Err(WalkError::NotPresent(2))
        );
    }

    #[test]
    fn huge_2m_leaf_resolves() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(40, 24);
        let slat = identity_slat(&mut mem, &mut alloc, 40);

        let cr3 = 0x10000u64;
        mem.write_u64(0x10000, 0x11000 | PTE_PRESENT | PTE_WRITABLE).unwrap();
        mem.write_u64(0x11000, 0x12000 | PTE_PRESENT | PTE_WRITABLE).unwrap();
        // 2-MiB leaf at PD level covering gla 0..2M onto gpa 0
        mem.write_u64(0x12000, PTE_PRESENT | PTE_WRITABLE | PTE_HUGE).unwrap();

        let t = walk_guest(&mem, &slat, cr3, 0x12345).unwrap();
        assert_eq!(t.gpa, 0x12345);
    }
}
