#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! MicroV core: the per-vCPU vmexit dispatch and emulation engine
//!
//! This crate owns the domains and vCPUs, decodes every trapped event into
//! an emulation or a world switch to the parent vCPU, and speaks the
//! hypercall ABI that the root-side shim adapts to KVM's ioctl surface.

extern crate alloc;

pub mod log;

pub mod abi;
pub mod config;
pub mod cpuid;
pub mod dispatch;
pub mod domain;
pub mod hypercall;
pub mod io;
pub mod iommu;
pub mod lapic;
pub mod msi;
pub mod msr;
pub mod shared_page;
pub mod translate;
pub mod vcpu;
pub mod xen;

#[cfg(test)]
pub(crate) mod test_support;

use alloc::boxed::Box;
use once_cell::race::OnceBox;
use spin::Mutex;

use domain::{DomainError, DomainManager};
use microv_hal::memory::FrameAllocator;
use shared_page::SharedPagePool;

/// Core error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrovError {
    AlreadyInitialized,
    Domain(DomainError),
    Hal(microv_hal::HalError),
}

impl From<DomainError> for MicrovError {
    fn from(e: DomainError) -> Self {
        MicrovError::Domain(e)
    }
}

impl From<microv_hal::HalError> for MicrovError {
    fn from(e: microv_hal::HalError) -> Self {
        MicrovError::Hal(e)
    }
}

static MANAGER: OnceBox<Mutex<DomainManager>> = OnceBox::new();
static SHARED_PAGES: OnceBox<SharedPagePool> = OnceBox::new();

/// Bring up the engine: the domain arena (with the root domain), and one
/// shared page per physical CPU. Called exactly once at early boot; there
/// is no re-initialization.
pub fn init(
    cfg: config::BootConfig,
    nr_pps: usize,
    alloc: &mut dyn FrameAllocator,
) -> Result<(), MicrovError> {
    config::init(cfg);

    let mgr = DomainManager::new(alloc)?;
    MANAGER
        .set(Box::new(Mutex::new(mgr)))
        .map_err(|_| MicrovError::AlreadyInitialized)?;
    SHARED_PAGES
        .set(Box::new(SharedPagePool::new(nr_pps)))
        .map_err(|_| MicrovError::AlreadyInitialized)?;

    log!("microv core initialized ({} physical cpus)", nr_pps);
    Ok(())
}

/// The domain/vCPU arena. Panics if called before [`init`]; boot ordering
/// is a bootstrap invariant, not a guest-reachable path.
pub fn manager() -> &'static Mutex<DomainManager> {
    MANAGER.get().expect("microv_core::init has not run")
}

/// The per-physical-CPU shared pages.
pub fn shared_pages() -> &'static SharedPagePool {
    SHARED_PAGES.get().expect("microv_core::init has not run")
}
