//! Composed address translation: gva → gpa → spa
//!
//! The guest walk resolves the linear address against the guest's own page
//! tables; the resulting guest-physical address is then pushed through the
//! domain's second-level tables. A failure at either level fails the
//! current emulation, never the hypervisor.

use microv_hal::arch_impl::ept::{Slat, SlatError};
use microv_hal::arch_impl::paging::{walk_guest, WalkError};
use microv_hal::memory::{GuestMemory, MemoryFlags, PhysicalAddress, PAGE_MASK, PAGE_SIZE};

/// Translation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    Walk(WalkError),
    Slat(SlatError),
}

impl From<WalkError> for TranslateError {
    fn from(e: WalkError) -> Self {
        TranslateError::Walk(e)
    }
}

impl From<SlatError> for TranslateError {
    fn from(e: SlatError) -> Self {
        TranslateError::Slat(e)
    }
}

/// A fully resolved guest-linear address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub vaddr: u64,
    pub laddr: u64,
    pub gpa: u64,
    pub spa: PhysicalAddress,
    pub flags: MemoryFlags,
}

/// Resolve `gva` through both translation levels.
pub fn gva_to_spa(
    mem: &dyn GuestMemory,
    slat: &Slat,
    cr3: u64,
    gva: u64,
) -> Result<Translation, TranslateError> {
    let walk = walk_guest(mem, slat, cr3, gva)?;
    let spa = slat.translate(mem, walk.gpa)?;
    Ok(Translation {
        vaddr: walk.vaddr,
        laddr: walk.laddr,
        gpa: walk.gpa,
        spa,
        flags: walk.flags,
    })
}

/// Byte spans of a linear-address transfer, split at the page boundary.
/// At most one boundary may be crossed; longer transfers are rejected by
/// the caller before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSpans {
    /// Bytes covered by the first page.
    pub first_len: u64,
    /// Bytes on the following page, zero when the transfer fits one page.
    pub second_len: u64,
}

impl TransferSpans {
    pub fn pages(&self) -> u64 {
        if self.second_len == 0 {
            1
        } else {
            2
        }
    }
}

/// Number of pages touched by `[addr, addr + bytes)`. A range that wraps
/// the address space reports `u64::MAX` so callers reject it.
pub fn pages_spanned(addr: u64, bytes: u64) -> u64 {
    if bytes == 0 {
        return 1;
    }
    let Some(end) = addr.checked_add(bytes) else {
        return u64::MAX;
    };
    1 + (end >> 12) - (addr >> 12) - u64::from(end & !PAGE_MASK == 0)
}

/// Split a transfer at the page boundary. Callers have already bounded
/// `bytes` to at most two pages.
pub fn split_transfer(addr: u64, bytes: u64) -> TransferSpans {
    let offset = addr & !PAGE_MASK;
    if offset + bytes <= PAGE_SIZE {
        TransferSpans { first_len: bytes, second_len: 0 }
    } else {
        let first_len = PAGE_SIZE - offset;
        TransferSpans { first_len, second_len: bytes - first_len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_within_one_page() {
        let s = split_transfer(0x1F00, 6);
        assert_eq!(s, TransferSpans { first_len: 6, second_len: 0 });
        assert_eq!(pages_spanned(0x1F00, 6), 1);
    }

    #[test]
    fn spans_across_boundary() {
        let s = split_transfer(0x1FFD, 6);
        assert_eq!(s, TransferSpans { first_len: 3, second_len: 3 });
        assert_eq!(s.pages(), 2);
        assert_eq!(pages_spanned(0x1FFD, 6), 2);
    }

    #[test]
    fn transfer_ending_exactly_at_boundary_stays_on_one_page() {
        let s = split_transfer(0x1FFC, 4);
        assert_eq!(s, TransferSpans { first_len: 4, second_len: 0 });
        assert_eq!(pages_spanned(0x1FFC, 4), 1);
    }

    #[test]
    fn long_transfer_spans_many_pages() {
        assert_eq!(pages_spanned(0x1800, 0x2000), 3);
    }

    #[test]
    fn wrapping_range_is_rejected_not_miscounted() {
        assert_eq!(pages_spanned(u64::MAX - 2, 8), u64::MAX);
    }
}
