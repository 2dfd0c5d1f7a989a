//! KVM ioctl surface
//!
//! `CREATE_VM`, `CREATE_VCPU`, `GET_VCPU_MMAP_SIZE`,
//! `SET_USER_MEMORY_REGION`, `GET/SET_REGS`, `GET/SET_SREGS` and
//! `DESTROY_VM`, each a thin translation onto the hypercall surface. RUN
//! lives in [`crate::run_loop`].

extern crate alloc;

use alloc::vec::Vec;
use spin::Mutex;

use microv_core::abi::MvStatus;
use microv_core::hypercall::vcpu_op::Reg;

use crate::kvm_run::KvmRun;
use crate::MvHypercall;

/// Shim errors surfaced to the ioctl caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimError {
    /// The VM still has live vCPUs; retry after they halt.
    VcpusRunning,
    InvalidArg,
    Hypervisor(MvStatus),
}

fn status_err(status: MvStatus) -> ShimError {
    match status {
        MvStatus::Busy => ShimError::VcpusRunning,
        MvStatus::InvalidArg => ShimError::InvalidArg,
        other => ShimError::Hypervisor(other),
    }
}

/// Shim-side VM state.
pub struct ShimVm {
    pub vmid: u16,
    /// Serializes VM-scoped ioctls, destroyed with the VM.
    pub mutex: Mutex<()>,
    pub vcpus: Vec<u32>,
}

/// Shim-side vCPU state: the hypervisor id plus the mmap'd run page.
pub struct ShimVcpu {
    pub vsid: u32,
    pub run: KvmRun,
}

/// KVM_GET_REGS / KVM_SET_REGS payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// The subset of KVM_GET_SREGS / KVM_SET_SREGS the hypervisor exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KvmSregs {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// KVM_SET_USER_MEMORY_REGION payload. The userspace address has already
/// been pinned and resolved to system-physical memory by the kernel side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// KVM_CREATE_VM
pub fn handle_system_kvm_create_vm(hv: &mut dyn MvHypercall) -> Result<ShimVm, ShimError> {
    let vmid = hv.vm_op_create_vm(0).map_err(status_err)?;
    Ok(ShimVm { vmid, mutex: Mutex::new(()), vcpus: Vec::new() })
}

/// KVM_DESTROY_VM. Succeeds only once every vCPU of the VM has
/// acknowledged its halt; until then the hypervisor answers busy and
/// nothing is torn down. The VM mutex is held across the teardown and
/// released on every path.
pub fn handle_system_kvm_destroy_vm(
    vm: &ShimVm,
    hv: &mut dyn MvHypercall,
) -> Result<(), ShimError> {
    let _guard = vm.mutex.lock();
    for &vsid in &vm.vcpus {
        hv.vcpu_op_destroy_vcpu(vsid).map_err(status_err)?;
    }
    hv.vm_op_destroy_vm(vm.vmid).map_err(status_err)
}

/// KVM_CREATE_VCPU
pub fn handle_vm_kvm_create_vcpu(
    vm: &mut ShimVm,
    hv: &mut dyn MvHypercall,
) -> Result<ShimVcpu, ShimError> {
    let _guard = vm.mutex.lock();
    let vsid = hv.vcpu_op_create_vcpu(vm.vmid).map_err(status_err)?;
    vm.vcpus.push(vsid);
    Ok(ShimVcpu { vsid, run: KvmRun::new() })
}

/// KVM_SET_USER_MEMORY_REGION
pub fn handle_vm_kvm_set_user_memory_region(
    vm: &ShimVm,
    hv: &mut dyn MvHypercall,
    region: &KvmUserspaceMemoryRegion,
) -> Result<(), ShimError> {
    let _guard = vm.mutex.lock();
    if region.memory_size == 0 || region.memory_size & 0xFFF != 0 {
        return Err(ShimError::InvalidArg);
    }
    hv.vm_op_map_memory(
        vm.vmid,
        region.guest_phys_addr,
        region.userspace_addr,
        region.memory_size,
    )
    .map_err(status_err)
}

/// KVM_GET_REGS
pub fn handle_vcpu_kvm_get_regs(
    vcpu: &ShimVcpu,
    hv: &mut dyn MvHypercall,
) -> Result<KvmRegs, ShimError> {
    let mut regs = KvmRegs::default();
    let pairs: [(&mut u64, Reg); 18] = [
        (&mut regs.rax, Reg::Rax),
        (&mut regs.rbx, Reg::Rbx),
        (&mut regs.rcx, Reg::Rcx),
        (&mut regs.rdx, Reg::Rdx),
        (&mut regs.rsi, Reg::Rsi),
        (&mut regs.rdi, Reg::Rdi),
        (&mut regs.rsp, Reg::Rsp),
        (&mut regs.rbp, Reg::Rbp),
        (&mut regs.r8, Reg::R8),
        (&mut regs.r9, Reg::R9),
        (&mut regs.r10, Reg::R10),
        (&mut regs.r11, Reg::R11),
        (&mut regs.r12, Reg::R12),
        (&mut regs.r13, Reg::R13),
        (&mut regs.r14, Reg::R14),
        (&mut regs.r15, Reg::R15),
        (&mut regs.rip, Reg::Rip),
        (&mut regs.rflags, Reg::Rflags),
    ];
    for (slot, reg) in pairs {
        *slot = hv.vs_op_reg_get(vcpu.vsid, reg as u64).map_err(status_err)?;
    }
    Ok(regs)
}

/// KVM_SET_REGS
pub fn handle_vcpu_kvm_set_regs(
    vcpu: &ShimVcpu,
    hv: &mut dyn MvHypercall,
    regs: &KvmRegs,
) -> Result<(), ShimError> {
    let pairs: [(u64, Reg); 18] = [
        (regs.rax, Reg::Rax),
        (regs.rbx, Reg::Rbx),
        (regs.rcx, Reg::Rcx),
        (regs.rdx, Reg::Rdx),
        (regs.rsi, Reg::Rsi),
        (regs.rdi, Reg::Rdi),
        (regs.rsp, Reg::Rsp),
        (regs.rbp, Reg::Rbp),
        (regs.r8, Reg::R8),
        (regs.r9, Reg::R9),
        (regs.r10, Reg::R10),
        (regs.r11, Reg::R11),
        (regs.r12, Reg::R12),
        (regs.r13, Reg::R13),
        (regs.r14, Reg::R14),
        (regs.r15, Reg::R15),
        (regs.rip, Reg::Rip),
        (regs.rflags, Reg::Rflags),
    ];
    for (value, reg) in pairs {
        hv.vs_op_reg_set(vcpu.vsid, reg as u64, value).map_err(status_err)?;
    }
    Ok(())
}

/// KVM_GET_SREGS
pub fn handle_vcpu_kvm_get_sregs(
    vcpu: &ShimVcpu,
    hv: &mut dyn MvHypercall,
) -> Result<KvmSregs, ShimError> {
    Ok(KvmSregs {
        cr0: hv.vs_op_reg_get(vcpu.vsid, Reg::Cr0 as u64).map_err(status_err)?,
        cr3: hv.vs_op_reg_get(vcpu.vsid, Reg::Cr3 as u64).map_err(status_err)?,
        cr4: hv.vs_op_reg_get(vcpu.vsid, Reg::Cr4 as u64).map_err(status_err)?,
        efer: hv.vs_op_reg_get(vcpu.vsid, Reg::Efer as u64).map_err(status_err)?,
    })
}

/// KVM_SET_SREGS
pub fn handle_vcpu_kvm_set_sregs(
    vcpu: &ShimVcpu,
    hv: &mut dyn MvHypercall,
    sregs: &KvmSregs,
) -> Result<(), ShimError> {
    hv.vs_op_reg_set(vcpu.vsid, Reg::Cr0 as u64, sregs.cr0).map_err(status_err)?;
    hv.vs_op_reg_set(vcpu.vsid, Reg::Cr3 as u64, sregs.cr3).map_err(status_err)?;
    hv.vs_op_reg_set(vcpu.vsid, Reg::Cr4 as u64, sregs.cr4).map_err(status_err)?;
    hv.vs_op_reg_set(vcpu.vsid, Reg::Efer as u64, sregs.efer).map_err(status_err)
}
