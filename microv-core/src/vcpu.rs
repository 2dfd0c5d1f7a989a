//! Virtual CPUs
//!
//! Each vCPU that is executing must have a parent; the only exception is
//! the host vCPUs. If a vCPU can no longer execute (crash, interrupt,
//! hlt), the parent vCPU is the one that will be resumed. The parent can
//! change on every exit — the host OS is free to move the userspace thread
//! hosting a guest vCPU between physical CPUs — so it is looked up fresh
//! each time and never cached.

extern crate alloc;

use alloc::collections::BTreeSet;
use heapless::Vec as FixedVec;

use microv_hal::cpu::{CpuState, SegmentRegister, XsaveArea};
use microv_hal::memory::PhysicalAddress;

use crate::abi::MvExitReason;
use crate::cpuid::CpuidCtx;
use crate::lapic::VirtLapic;
use crate::msi::MsiMap;
use crate::shared_page::SharedPage;

pub type VcpuId = u32;
pub type DomainId = u16;

/// Run-state machine of one vCPU.
///
/// `New → Running ↔ ExitedToParent → Killed`; `Killed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    New,
    Running,
    ExitedToParent,
    Killed,
}

/// vCPU state-machine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuError {
    /// The vCPU was killed and cannot be re-entered.
    Killed,
    /// The transition is not legal from the current state.
    BadState,
}

pub struct Vcpu {
    id: VcpuId,
    domain: DomainId,
    /// Physical CPU the vCPU last ran on; may change across exits.
    pub pcpu: u32,

    pub state: CpuState,
    pub xsave: XsaveArea,
    run_state: RunState,

    /// Back reference to the parent, refreshed on every run.
    parent: Option<VcpuId>,
    /// Children hold ids only; the arena resolves them.
    children: BTreeSet<VcpuId>,

    pub lapic: VirtLapic,
    pub msi: MsiMap,

    /// Per-exit scratch: up to two system-physical page translations for a
    /// string I/O transfer.
    pub io_spas: FixedVec<PhysicalAddress, 2>,
    /// PCI config-space address latch (port 0xCF8).
    pub pci_cfg_addr: u32,
    /// IA32_MTRR_DEF_TYPE as last written by the guest.
    pub mtrr_def_type: u64,
    /// An I/O exit waiting for its userspace response.
    pub pending_io: Option<crate::io::IoTransfer>,
    /// EOI handling policy as set by event_op.
    pub eoi_policy: u64,

    /// Second-level invpcid support as configured for this vCPU.
    pub invpcid_enabled: bool,
}

impl Vcpu {
    pub fn new(id: VcpuId, domain: DomainId, apic_id: u32) -> Self {
        Self {
            id,
            domain,
            pcpu: 0,
            state: CpuState::default(),
            xsave: XsaveArea::new(1),
            run_state: RunState::New,
            parent: None,
            children: BTreeSet::new(),
            lapic: VirtLapic::new(apic_id),
            msi: MsiMap::new(),
            io_spas: FixedVec::new(),
            pci_cfg_addr: 0,
            // enabled, fixed ranges enabled, default type write-back
            mtrr_def_type: 0xC06,
            pending_io: None,
            eoi_policy: 0,
            invpcid_enabled: false,
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain
    }

    pub fn is_root(&self) -> bool {
        self.domain == 0
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn cpuid_ctx(&self) -> CpuidCtx {
        CpuidCtx {
            is_root: self.is_root(),
            invpcid_enabled: self.invpcid_enabled,
            cr4_osxsave: self.state.osxsave_enabled(),
        }
    }

    // -----------------------------------------------------------------------
    // Initial guest state
    // -----------------------------------------------------------------------

    /// Root-domain vCPUs take over a running OS: long mode, flat
    /// segmentation, paging live. The concrete control-register values are
    /// captured from the host by the entry glue; this sets the shape.
    pub fn write_root_state(&mut self, cr3: u64, rip: u64, rsp: u64) {
        let flat = SegmentRegister { selector: 0x8, base: 0, limit: !0, access_rights: 0xA09B };
        self.state.cs = flat;
        self.state.ds = SegmentRegister { selector: 0x10, access_rights: 0xC093, ..flat };
        self.state.es = self.state.ds;
        self.state.ss = self.state.ds;
        self.state.cr0 = microv_hal::cpu::CR0_FIXED | (1 << 5); // + NE
        self.state.cr3 = cr3;
        self.state.cr4 = 1 << 5; // PAE
        self.state.ia32_efer = (1 << 8) | microv_hal::cpu::EFER_LMA; // LME + LMA
        self.state.rip = rip;
        self.state.rsp = rsp;
    }

    /// Guest-domain vCPUs start at the architectural reset vector in real
    /// mode; the VMM brings them up from there.
    pub fn write_guest_state(&mut self) {
        self.state = CpuState::default();
        self.state.cr0 = 1 << 5; // NE only; unrestricted guest
        self.state.cs = SegmentRegister {
            selector: 0xF000,
            base: 0xFFFF_0000,
            limit: 0xFFFF,
            access_rights: 0x9B,
        };
        self.state.rip = 0xFFF0;
    }

    // -----------------------------------------------------------------------
    // Parent / children
    // -----------------------------------------------------------------------

    /// Record the parent for the current run. Called on every run-op entry;
    /// the previous value is irrelevant by design.
    pub fn set_parent(&mut self, parent: VcpuId) {
        self.parent = Some(parent);
    }

    /// The vCPU to resume when this one stops executing. Never cache the
    /// result across exits.
    pub fn parent(&self) -> Option<VcpuId> {
        self.parent
    }

    pub fn add_child(&mut self, id: VcpuId) {
        self.children.insert(id);
    }

    pub fn remove_child(&mut self, id: VcpuId) {
        self.children.remove(&id);
    }

    pub fn has_child(&self, id: VcpuId) -> bool {
        self.children.contains(&id)
    }

    pub fn children(&self) -> impl Iterator<Item = VcpuId> + '_ {
        self.children.iter().copied()
    }

    // -----------------------------------------------------------------------
    // Run-state transitions
    // -----------------------------------------------------------------------

    /// Enter the guest (first launch or resume after a completed exit).
    pub fn enter(&mut self) -> Result<(), VcpuError> {
        match self.run_state {
            RunState::New | RunState::ExitedToParent => {
                self.run_state = RunState::Running;
                Ok(())
            }
            RunState::Running => Ok(()),
            RunState::Killed => Err(VcpuError::Killed),
        }
    }

    /// Tells the vCPU to stop execution. Terminal: a killed vCPU keeps its
    /// resources until the owning domain is torn down, but is never
    /// re-entered.
    pub fn kill(&mut self) {
        self.run_state = RunState::Killed;
    }

    pub fn is_alive(&self) -> bool {
        self.run_state != RunState::Killed
    }

    pub fn is_killed(&self) -> bool {
        self.run_state == RunState::Killed
    }

    /// Halt the vCPU, recording why. Used for guest-induced conditions the
    /// dispatcher cannot recover from.
    pub fn halt(&mut self, reason: &str) {
        crate::log!("vcpu {} halted: {}", self.id, reason);
        self.kill();
    }

    // -----------------------------------------------------------------------
    // Returns to the parent
    // -----------------------------------------------------------------------

    fn exit_to_parent(&mut self, page: &mut SharedPage, reason: MvExitReason) {
        if self.run_state == RunState::Running {
            self.run_state = RunState::ExitedToParent;
        }
        page.post_exit(reason);
    }

    /// Post an exit record and transfer to the parent; used by the
    /// emulation paths that already filled the shared-page record.
    pub fn post_exit_to_parent(&mut self, page: &mut SharedPage, reason: MvExitReason) {
        self.exit_to_parent(page, reason);
    }

    /// Resume the parent and tell it to stop this vCPU.
    pub fn return_hlt(&mut self, page: &mut SharedPage) {
        self.kill();
        self.exit_to_parent(page, MvExitReason::Hlt);
    }

    /// Resume the parent and report a fault; userspace sees a failed entry.
    pub fn return_fault(&mut self, page: &mut SharedPage, code: u64) {
        page.exit_failure_mut().code = code;
        self.exit_to_parent(page, MvExitReason::Failure);
    }

    /// Resume the parent even though the guest is still live; userspace is
    /// expected to re-enter promptly.
    pub fn return_resume_after_interrupt(&mut self, page: &mut SharedPage) {
        self.exit_to_parent(page, MvExitReason::Interrupt);
    }

    /// Resume the parent and ask it to sleep this vCPU for `usec`.
    pub fn return_yield(&mut self, page: &mut SharedPage, usec: u64) {
        page.exit_yield_mut().usec = usec;
        self.exit_to_parent(page, MvExitReason::Yield);
    }

    /// The parent consumed the exit and completed it; the vCPU may run
    /// again.
    pub fn complete_exit(&mut self) -> Result<(), VcpuError> {
        match self.run_state {
            RunState::ExitedToParent => {
                self.run_state = RunState::Running;
                Ok(())
            }
            RunState::Killed => Err(VcpuError::Killed),
            _ => Err(VcpuError::BadState),
        }
    }
}
