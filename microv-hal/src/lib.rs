#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Architectural support for the MicroV hypervisor
//!
//! This crate holds everything the vmexit engine needs from the machine:
//! per-vCPU register and XSAVE state, VMCS/VMCB exit decoding, and the two
//! address translation walks (guest page tables and second-level tables).

extern crate alloc;

pub mod cpu;
pub mod memory;
pub mod arch;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export core types
pub use cpu::{CpuState, SegmentRegister, XsaveArea};
pub use memory::{FrameAllocator, GuestMemory, MemoryError, MemoryFlags};
pub use memory::{PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};

// The decode and walk logic is pure; only the entry glue in
// `arch::x86_64::vmx` is gated on the `hw` feature.
pub use arch::x86_64 as arch_impl;

/// HAL-specific error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    UnsupportedArchitecture,
    HardwareNotSupported,
    InitializationFailed,
    TranslationFault,
}

impl From<MemoryError> for HalError {
    fn from(_: MemoryError) -> Self {
        HalError::TranslationFault
    }
}
