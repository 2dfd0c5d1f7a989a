//! vmexit dispatch
//!
//! One entry per architecture: [`dispatch`] takes the trapped event and
//! either fully emulates it and resumes the guest, or packages an exit
//! record into the physical CPU's shared page and transfers to the parent.
//! Guest-induced errors surface as a fault exit, never a panic; only an
//! unknown exit reason kills the vCPU.

use microv_hal::arch_impl::vmcs::EptQualification;
use microv_hal::memory::{FrameAllocator, GuestMemory};

use crate::abi::MvExitReason;
use crate::cpuid::{self, CpuidRegs};
use crate::domain::DomainManager;
use crate::io::{self, IoError};
use crate::lapic::LapicAction;
use crate::msr::{self, MsrOutcome};
use crate::shared_page::SharedPage;
use crate::translate::TranslateError;
use crate::vcpu::VcpuId;

/// Sleep granted to a spinning guest, in microseconds.
const YIELD_USEC: u64 = 100;

/// Fault code reported when an inner emulation error is surfaced to
/// userspace as a failed entry.
pub const FAULT_EMULATION: u64 = 0x10;
/// Fault code for a gva→gpa / gpa→spa translation failure.
pub const FAULT_TRANSLATION: u64 = 0x11;

/// A trapped event, decoded from the raw exit by the entry glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    Cpuid,
    ExternalInterrupt { vector: u8 },
    Io { exitinfo1: u64 },
    MsrRead,
    MsrWrite,
    Vmcall,
    Yield,
    EptViolation { gpa: u64, gla: u64, qualification: u64 },
    TripleFault,
    Hlt,
    Unknown(u64),
}

/// What the caller does next with the vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    ResumeGuest,
    SwitchToParent(MvExitReason),
    KillVcpu,
}

/// Entry-glue errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    /// VMLAUNCH/VMRESUME refused the state.
    EntryFailed(u64),
}

/// The seam to the hardware (or to a scripted guest in tests): runs the
/// vCPU until the next trapped event.
pub trait GuestEntry {
    fn enter(
        &mut self,
        vcpu: &mut crate::vcpu::Vcpu,
        mem: &mut dyn GuestMemory,
    ) -> Result<VmExit, EntryError>;
}

/// Everything a handler may touch besides the vCPU itself.
pub struct DispatchCtx<'a> {
    pub mem: &'a mut dyn GuestMemory,
    pub alloc: &'a mut dyn FrameAllocator,
    pub page: &'a mut SharedPage,
    pub entry: &'a mut dyn GuestEntry,
    pub native_cpuid: &'a mut dyn FnMut(u32, u32) -> CpuidRegs,
}

/// Dispatch one trapped event for `vcpu_id`.
pub fn dispatch(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    exit: VmExit,
    ctx: &mut DispatchCtx<'_>,
) -> ExitOutcome {
    let outcome = match exit {
        VmExit::Cpuid => handle_cpuid(mgr, vcpu_id, ctx),
        VmExit::ExternalInterrupt { vector } => handle_external_interrupt(mgr, vcpu_id, ctx, vector),
        VmExit::Io { exitinfo1 } => handle_io(mgr, vcpu_id, ctx, exitinfo1),
        VmExit::MsrRead => handle_msr(mgr, vcpu_id, ctx, false),
        VmExit::MsrWrite => handle_msr(mgr, vcpu_id, ctx, true),
        VmExit::Vmcall => crate::hypercall::handle_vmcall(mgr, vcpu_id, ctx),
        VmExit::Yield => handle_yield(mgr, vcpu_id, ctx),
        VmExit::EptViolation { gpa, gla, qualification } => {
            handle_ept_violation(mgr, vcpu_id, ctx, gpa, gla, qualification)
        }
        VmExit::TripleFault => handle_triple_fault(mgr, vcpu_id, ctx),
        VmExit::Hlt => handle_hlt(mgr, vcpu_id, ctx),
        VmExit::Unknown(raw) => {
            crate::log!("unknown exit reason {:#x} on vcpu {}", raw, vcpu_id);
            if let Some(vcpu) = mgr.vcpu_mut(vcpu_id) {
                vcpu.halt("unknown exit reason");
            }
            ExitOutcome::KillVcpu
        }
    };

    if outcome == ExitOutcome::ResumeGuest {
        prepare_injection(mgr, vcpu_id);
    }
    outcome
}

/// At every safe resume point, move the next pending virq into the entry
/// interrupt-info field, or ask for an interrupt-window exit if the guest
/// cannot take it yet.
fn prepare_injection(mgr: &mut DomainManager, vcpu_id: VcpuId) {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return;
    };
    if !vcpu.lapic.has_pending() {
        return;
    }
    let state = vcpu.state.clone();
    if let Some(vector) = vcpu.lapic.next_injectable(&state) {
        vcpu.state.entry_intr_info = 0x8000_0000 | vector as u32;
    } else {
        vcpu.state.intr_window_requested = true;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn handle_cpuid(mgr: &mut DomainManager, vcpu_id: VcpuId, ctx: &mut DispatchCtx<'_>) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };

    let regs = CpuidRegs {
        rax: vcpu.state.rax,
        rbx: vcpu.state.rbx,
        rcx: vcpu.state.rcx,
        rdx: vcpu.state.rdx,
    };
    let out = cpuid::filter(&vcpu.cpuid_ctx(), &regs, ctx.native_cpuid);

    vcpu.state.rax = out.rax;
    vcpu.state.rbx = out.rbx;
    vcpu.state.rcx = out.rcx;
    vcpu.state.rdx = out.rdx;
    vcpu.state.advance();
    ExitOutcome::ResumeGuest
}

fn handle_external_interrupt(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    vector: u8,
) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };

    // The interrupt arrived on this physical CPU; a remapped vector means
    // an assigned device fired for this guest.
    let key = crate::msi::msi_key(vcpu.pcpu, vector);
    if let Some(guest) = vcpu.msi.find_guest_msi(key).copied() {
        let domain = vcpu.domain_id();
        mgr.queue_virq(domain, guest.dest_apic_id(), guest.vector());
        return ExitOutcome::ResumeGuest;
    }

    // Not ours: hand control back so the root can service it, with the
    // guest still live.
    vcpu.return_resume_after_interrupt(ctx.page);
    ExitOutcome::SwitchToParent(MvExitReason::Interrupt)
}

fn handle_io(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    exitinfo1: u64,
) -> ExitOutcome {
    let Some((vcpu, domain)) = mgr.vcpu_and_domain_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };

    // Most specific handler first: the PCI config-space ports are emulated
    // in place, everything else goes to the parent.
    let info = microv_hal::arch_impl::vmcs::IoExitInfo::decode(exitinfo1);
    if info.port == 0xCF8 || info.port == 0xCFC {
        crate::iommu::handle_pci_cfg(vcpu, &info);
        vcpu.state.advance();
        return ExitOutcome::ResumeGuest;
    }

    let xfer = match io::decode_and_translate(vcpu, domain.slat(), ctx.mem, exitinfo1) {
        Ok(xfer) => xfer,
        Err(e) => return fault(mgr, vcpu_id, ctx, io_fault_code(&e)),
    };

    if let Err(e) = io::stage_exit(vcpu, ctx.mem, &xfer, ctx.page.exit_io_mut()) {
        return fault(mgr, vcpu_id, ctx, io_fault_code(&e));
    }

    io::retire_string(vcpu, &xfer);
    vcpu.pending_io = Some(xfer);
    vcpu.state.advance();
    vcpu.post_exit_to_parent(ctx.page, MvExitReason::Io);
    ExitOutcome::SwitchToParent(MvExitReason::Io)
}

fn io_fault_code(e: &IoError) -> u64 {
    match e {
        IoError::Translation(TranslateError::Walk(_)) => FAULT_TRANSLATION,
        IoError::Translation(TranslateError::Slat(_)) => FAULT_TRANSLATION,
        _ => FAULT_EMULATION,
    }
}

fn fault(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    code: u64,
) -> ExitOutcome {
    if let Some(vcpu) = mgr.vcpu_mut(vcpu_id) {
        vcpu.return_fault(ctx.page, code);
    }
    ExitOutcome::SwitchToParent(MvExitReason::Failure)
}

fn handle_msr(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    is_write: bool,
) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };

    let num = vcpu.state.rcx as u32;
    let outcome = if is_write {
        let value = msr::edx_eax(vcpu);
        msr::handle_wrmsr(vcpu, num, value)
    } else {
        msr::handle_rdmsr(vcpu, num)
    };

    match outcome {
        MsrOutcome::Handled => {
            vcpu.state.advance();
            ExitOutcome::ResumeGuest
        }
        MsrOutcome::Apic(action) => {
            vcpu.state.advance();
            let domain = vcpu.domain_id();
            match action {
                LapicAction::Ipi { dest_apic_id, vector } => {
                    mgr.queue_virq(domain, dest_apic_id, vector);
                }
                LapicAction::Startup { dest_apic_id, vector } => {
                    crate::log!("INIT/SIPI to apic {} vector {:#x}", dest_apic_id, vector);
                }
                LapicAction::Eoi | LapicAction::None => {}
            }
            ExitOutcome::ResumeGuest
        }
        MsrOutcome::ForwardToParent => {
            let record = ctx.page.exit_msr_mut();
            record.msr = num as u64;
            record.is_write = is_write as u64;
            record.value = if is_write { msr::edx_eax(vcpu) } else { 0 };
            vcpu.state.advance();
            vcpu.post_exit_to_parent(ctx.page, MvExitReason::Msr);
            ExitOutcome::SwitchToParent(MvExitReason::Msr)
        }
    }
}

fn handle_yield(mgr: &mut DomainManager, vcpu_id: VcpuId, ctx: &mut DispatchCtx<'_>) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };
    vcpu.state.advance();
    vcpu.return_yield(ctx.page, YIELD_USEC);
    ExitOutcome::SwitchToParent(MvExitReason::Yield)
}

fn handle_ept_violation(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    gpa: u64,
    _gla: u64,
    qualification: u64,
) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };

    let qual = EptQualification::decode(qualification);
    let record = ctx.page.exit_mmio_mut();
    record.gpa = gpa;
    record.is_write = qual.write as u64;
    record.nbytes = 0;
    record.data = [0u8; 8];

    // RIP is left in place: the access is re-executed once userspace has
    // satisfied it.
    vcpu.post_exit_to_parent(ctx.page, MvExitReason::Mmio);
    ExitOutcome::SwitchToParent(MvExitReason::Mmio)
}

fn handle_triple_fault(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
) -> ExitOutcome {
    if let Some(vcpu) = mgr.vcpu_mut(vcpu_id) {
        crate::log!("triple fault on vcpu {}", vcpu_id);
        vcpu.post_exit_to_parent(ctx.page, MvExitReason::Shutdown);
    }
    ExitOutcome::SwitchToParent(MvExitReason::Shutdown)
}

fn handle_hlt(mgr: &mut DomainManager, vcpu_id: VcpuId, ctx: &mut DispatchCtx<'_>) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu_mut(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };
    vcpu.return_hlt(ctx.page);
    ExitOutcome::SwitchToParent(MvExitReason::Hlt)
}
