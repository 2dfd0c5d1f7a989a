//! Xen compatibility shim
//!
//! A thin, optional per-domain surface for paravirtualized Windows/Linux
//! front-ends: version reporting, the grant-table frames, and the
//! add-to-physmap path that exposes them. Domains without the shim never
//! see it.

pub mod gnttab;
pub mod xenver;

pub use gnttab::XenGnttab;
pub use xenver::XenVer;

use microv_hal::arch_impl::ept::Slat;
use microv_hal::memory::{FrameAllocator, GuestMemory};

/// Xen shim errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XenError {
    BadSpace,
    BadIndex,
    BadVersion,
    MapFailed,
}

/// XENMAPSPACE values the shim accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XenMapSpace {
    GrantTable,
}

impl XenMapSpace {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::GrantTable),
            _ => None,
        }
    }
}

/// Per-domain Xen state.
pub struct XenHandle {
    pub gnttab: XenGnttab,
    pub ver: XenVer,
}

impl XenHandle {
    pub fn new() -> Self {
        Self { gnttab: XenGnttab::new(), ver: XenVer::new() }
    }

    /// XENMEM_add_to_physmap: place the requested frame at `gpa` in the
    /// domain's physmap.
    pub fn add_to_physmap(
        &mut self,
        slat: &mut Slat,
        mem: &mut dyn GuestMemory,
        alloc: &mut dyn FrameAllocator,
        space: u32,
        idx: u32,
        gpa: u64,
    ) -> Result<(), XenError> {
        match XenMapSpace::from_raw(space).ok_or(XenError::BadSpace)? {
            XenMapSpace::GrantTable => self.gnttab.mapspace_grant_table(slat, mem, alloc, idx, gpa),
        }
    }
}

impl Default for XenHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAllocator, TestMemory};

    #[test]
    fn unknown_mapspace_rejected() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(0, 32);
        let mut slat = Slat::new(&mut alloc).unwrap();
        let mut xen = XenHandle::new();

        assert_eq!(
            xen.add_to_physmap(&mut slat, &mut mem, &mut alloc, 99, 0, 0x10000),
            Err(XenError::BadSpace)
        );
    }

    #[test]
    fn grant_table_frame_lands_in_physmap() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(0, 32);
        let mut slat = Slat::new(&mut alloc).unwrap();
        let mut xen = XenHandle::new();

        xen.add_to_physmap(&mut slat, &mut mem, &mut alloc, 1, 0, 0x0002_0000).unwrap();
        assert!(slat.translate(&mem, 0x0002_0000).is_ok());
        assert_eq!(xen.gnttab.nr_frames(), 1);
    }
}
