//! Grant tables
//!
//! Only the shared-frame plumbing front-ends actually exercise: version
//! selection, size queries, and mapping grant frames into the domain's
//! physmap. Grant entries themselves are guest-managed memory.

extern crate alloc;

use alloc::vec::Vec;

use microv_hal::arch_impl::ept::{Slat, SlatFlags};
use microv_hal::memory::{FrameAllocator, GuestMemory, PhysicalAddress, PAGE_SIZE};

use super::XenError;

/// Upper bound on grant-table frames a domain may place.
pub const MAX_NR_FRAMES: u32 = 64;

pub struct XenGnttab {
    version: u32,
    frames: Vec<PhysicalAddress>,
}

impl XenGnttab {
    pub fn new() -> Self {
        Self { version: 1, frames: Vec::new() }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// GNTTABOP_set_version: only versions 1 and 2 exist.
    pub fn set_version(&mut self, version: u32) -> Result<(), XenError> {
        if version != 1 && version != 2 {
            return Err(XenError::BadVersion);
        }
        self.version = version;
        Ok(())
    }

    /// GNTTABOP_query_size: frames placed so far and the ceiling.
    pub fn query_size(&self) -> (u32, u32) {
        (self.frames.len() as u32, MAX_NR_FRAMES)
    }

    pub fn nr_frames(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Back grant-table frame `idx` and map it at `gpa`. Frames must be
    /// placed densely from zero; re-placing an existing frame moves it.
    pub fn mapspace_grant_table(
        &mut self,
        slat: &mut Slat,
        mem: &mut dyn GuestMemory,
        alloc: &mut dyn FrameAllocator,
        idx: u32,
        gpa: u64,
    ) -> Result<(), XenError> {
        if idx >= MAX_NR_FRAMES || idx as usize > self.frames.len() {
            return Err(XenError::BadIndex);
        }

        let spa = if (idx as usize) < self.frames.len() {
            self.frames[idx as usize]
        } else {
            let spa = alloc.alloc_frame().map_err(|_| XenError::MapFailed)?;
            self.frames.push(spa);
            spa
        };

        let flags = SlatFlags::READ | SlatFlags::WRITE | SlatFlags::MEMORY_WB;
        slat.map(mem, alloc, gpa, spa, PAGE_SIZE, flags).map_err(|_| XenError::MapFailed)?;
        Ok(())
    }
}

impl Default for XenGnttab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAllocator, TestMemory};

    #[test]
    fn version_must_be_1_or_2() {
        let mut gnttab = XenGnttab::new();
        assert_eq!(gnttab.version(), 1);
        gnttab.set_version(2).unwrap();
        assert_eq!(gnttab.version(), 2);
        assert_eq!(gnttab.set_version(3), Err(XenError::BadVersion));
    }

    #[test]
    fn frames_place_densely() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(0, 32);
        let mut slat = Slat::new(&mut alloc).unwrap();
        let mut gnttab = XenGnttab::new();

        gnttab.mapspace_grant_table(&mut slat, &mut mem, &mut alloc, 0, 0x10000).unwrap();
        gnttab.mapspace_grant_table(&mut slat, &mut mem, &mut alloc, 1, 0x11000).unwrap();
        assert_eq!(gnttab.query_size(), (2, MAX_NR_FRAMES));

        // A hole is rejected.
        assert_eq!(
            gnttab.mapspace_grant_table(&mut slat, &mut mem, &mut alloc, 5, 0x15000),
            Err(XenError::BadIndex)
        );
    }

    #[test]
    fn replacing_a_frame_keeps_its_backing() {
        let mut mem = TestMemory::new(64);
        let mut alloc = BumpAllocator::new(0, 32);
        let mut slat = Slat::new(&mut alloc).unwrap();
        let mut gnttab = XenGnttab::new();

        gnttab.mapspace_grant_table(&mut slat, &mut mem, &mut alloc, 0, 0x10000).unwrap();
        let spa0 = slat.translate(&mem, 0x10000).unwrap();
        gnttab.mapspace_grant_table(&mut slat, &mut mem, &mut alloc, 0, 0x18000).unwrap();
        let spa1 = slat.translate(&mem, 0x18000).unwrap();
        assert_eq!(spa0, spa1);
        assert_eq!(gnttab.nr_frames(), 1);
    }
}
