//! Per-physical-CPU shared page
//!
//! One page per physical CPU carries `mv_exit_*` records from guest-context
//! emulation to root-context userspace and run requests back. The page has
//! exactly one holder at a time; acquisition hands out a guard whose drop
//! releases the page, so every exit path (including error returns) gives
//! it back.

extern crate alloc;

use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;

use crate::abi::{
    MvExitFailure, MvExitIo, MvExitMmio, MvExitMsr, MvExitReason, MvExitYield,
};

/// Bytes available for the exit record after the page header.
pub const RECORD_SIZE: usize = 4088;

/// Sentinel meaning "no exit posted".
const NO_EXIT: u64 = u64::MAX;

/// Shared-page errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedPageError {
    /// The page for this physical CPU is already held.
    AlreadyHeld,
    /// No page exists for this physical CPU.
    NoSuchCpu,
}

/// The fixed page layout: a one-slot single-writer/single-reader message
/// channel. Guest context posts an exit reason plus a record; the parent
/// context takes it after the world switch.
#[repr(C, align(4096))]
pub struct SharedPage {
    exit_reason: u64,
    record: [u8; RECORD_SIZE],
}

const_assert_eq!(core::mem::size_of::<SharedPage>(), 4096);
const_assert_eq!(core::mem::size_of::<MvExitIo>(), RECORD_SIZE);

macro_rules! record_view {
    ($ref_fn:ident, $mut_fn:ident, $ty:ty) => {
        pub fn $ref_fn(&self) -> &$ty {
            const _: () = assert!(core::mem::size_of::<$ty>() <= RECORD_SIZE);
            // All record types are plain integers/byte arrays, so any page
            // content is a valid value; the record area is 8-byte aligned.
            unsafe { &*(self.record.as_ptr() as *const $ty) }
        }

        pub fn $mut_fn(&mut self) -> &mut $ty {
            unsafe { &mut *(self.record.as_mut_ptr() as *mut $ty) }
        }
    };
}

impl SharedPage {
    pub const fn new() -> Self {
        Self { exit_reason: NO_EXIT, record: [0u8; RECORD_SIZE] }
    }

    record_view!(exit_io, exit_io_mut, MvExitIo);
    record_view!(exit_mmio, exit_mmio_mut, MvExitMmio);
    record_view!(exit_msr, exit_msr_mut, MvExitMsr);
    record_view!(exit_failure, exit_failure_mut, MvExitFailure);
    record_view!(exit_yield, exit_yield_mut, MvExitYield);

    /// Post an exit to the parent side of the channel.
    pub fn post_exit(&mut self, reason: MvExitReason) {
        self.exit_reason = reason as u64;
    }

    /// Take the posted exit, leaving the slot empty.
    pub fn take_exit(&mut self) -> Option<MvExitReason> {
        let reason = MvExitReason::from_u64(self.exit_reason)?;
        self.exit_reason = NO_EXIT;
        Some(reason)
    }
}

/// Scoped access to one physical CPU's page.
pub type SharedPageGuard<'a> = MutexGuard<'a, SharedPage>;

/// All shared pages, indexed by physical CPU id. Pages live for the
/// lifetime of the hypervisor.
pub struct SharedPagePool {
    pages: Vec<Mutex<SharedPage>>,
}

impl SharedPagePool {
    pub fn new(nr_pps: usize) -> Self {
        let mut pages = Vec::with_capacity(nr_pps);
        for _ in 0..nr_pps {
            pages.push(Mutex::new(SharedPage::new()));
        }
        Self { pages }
    }

    pub fn nr_pps(&self) -> usize {
        self.pages.len()
    }

    /// Acquire the page for `pp`. Fails if another holder exists; the
    /// returned guard releases on drop.
    pub fn acquire(&self, pp: usize) -> Result<SharedPageGuard<'_>, SharedPageError> {
        self.pages
            .get(pp)
            .ok_or(SharedPageError::NoSuchCpu)?
            .try_lock()
            .ok_or(SharedPageError::AlreadyHeld)
    }
}
