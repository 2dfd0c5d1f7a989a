#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! KVM-compatible shim for MicroV
//!
//! Adapts the KVM ioctl surface a userspace VMM expects to the MicroV
//! hypercall ABI: ioctls become `mv_*` calls, exit records from the
//! per-physical-CPU shared page become `kvm_run` fields, and the run
//! page's request flags are honored before every entry.

extern crate alloc;

pub mod ioctl;
pub mod kvm_run;
pub mod platform;
pub mod run_loop;

pub use ioctl::{ShimError, ShimVcpu, ShimVm};
pub use kvm_run::{vcpu_mmap_size, KvmRun};
pub use platform::{NullPlatform, Platform};
pub use run_loop::{handle_vcpu_kvm_run, ShimStatus};

use microv_core::abi::{MvExitFailure, MvExitIo, MvExitReason, MvExitYield, MvStatus};

/// The hypercall surface the shim drives. In a deployed root domain each
/// method is a vmcall plus the mapped shared page; in-process backends
/// call straight into the engine.
pub trait MvHypercall {
    // -- vm ops -------------------------------------------------------------
    fn vm_op_create_vm(&mut self, flags: u64) -> Result<u16, MvStatus>;
    fn vm_op_destroy_vm(&mut self, vmid: u16) -> Result<(), MvStatus>;
    fn vm_op_map_memory(&mut self, vmid: u16, gpa: u64, spa: u64, size: u64)
        -> Result<(), MvStatus>;

    // -- vcpu / vs ops ------------------------------------------------------
    fn vcpu_op_create_vcpu(&mut self, vmid: u16) -> Result<u32, MvStatus>;
    fn vcpu_op_destroy_vcpu(&mut self, vsid: u32) -> Result<(), MvStatus>;
    fn vs_op_reg_get(&mut self, vsid: u32, reg: u64) -> Result<u64, MvStatus>;
    fn vs_op_reg_set(&mut self, vsid: u32, reg: u64, value: u64) -> Result<(), MvStatus>;

    /// mv_vs_op_run: enter the guest until the next exit the parent must
    /// see. The exit record is in the shared page afterwards.
    fn vs_op_run(&mut self, vsid: u32) -> MvExitReason;

    // -- shared page --------------------------------------------------------
    fn read_exit_io(&mut self) -> MvExitIo;
    fn write_exit_io(&mut self, io: &MvExitIo);
    fn read_exit_failure(&mut self) -> MvExitFailure;
    fn read_exit_yield(&mut self) -> MvExitYield;

    /// Release the per-physical-CPU shared page. Every exit path of the
    /// run loop funnels through this.
    fn release_shared_page(&mut self);
}
