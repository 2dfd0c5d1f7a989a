//! Full-stack scenarios: the KVM shim drives the real engine through the
//! hypercall surface, with scripted guest entries standing in for the
//! hardware.

use std::collections::VecDeque;

use microv_core::abi::{self, MvExitFailure, MvExitIo, MvExitReason, MvExitYield, MvStatus};
use microv_core::cpuid::CpuidRegs;
use microv_core::dispatch::{DispatchCtx, EntryError, GuestEntry, VmExit};
use microv_core::domain::DomainManager;
use microv_core::hypercall::{self, MV_SPEC_VERSION};
use microv_core::shared_page::SharedPagePool;
use microv_core::vcpu::{Vcpu, VcpuId};
use microv_hal::arch_impl::vmcs::IoExitInfo;
use microv_hal::memory::{FrameAllocator, GuestMemory, MemoryError, PhysicalAddress, PAGE_SIZE};

use microv_shim::ioctl::{
    handle_system_kvm_create_vm, handle_system_kvm_destroy_vm, handle_vcpu_kvm_get_regs,
    handle_vcpu_kvm_set_regs, handle_vm_kvm_create_vcpu, handle_vm_kvm_set_user_memory_region,
    KvmUserspaceMemoryRegion, ShimError,
};
use microv_shim::kvm_run::{
    KvmRun, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_INTR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
    KVM_EXIT_IRQ_WINDOW_OPEN,
};
use microv_shim::platform::Platform;
use microv_shim::run_loop::{handle_vcpu_kvm_run, ShimStatus};
use microv_shim::{MvHypercall, NullPlatform};

// ---------------------------------------------------------------------------
// In-process backend: MvHypercall implemented directly over the engine
// ---------------------------------------------------------------------------

struct TestMemory {
    bytes: Vec<u8>,
}

impl GuestMemory for TestMemory {
    fn read(&self, spa: PhysicalAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let start = spa as usize;
        let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfRange)?;
        if end > self.bytes.len() {
            return Err(MemoryError::OutOfRange);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, spa: PhysicalAddress, buf: &[u8]) -> Result<(), MemoryError> {
        let start = spa as usize;
        let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfRange)?;
        if end > self.bytes.len() {
            return Err(MemoryError::OutOfRange);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

struct Bump {
    next: PhysicalAddress,
    limit: PhysicalAddress,
}

impl FrameAllocator for Bump {
    fn alloc_frame(&mut self) -> Result<PhysicalAddress, MemoryError> {
        if self.next >= self.limit {
            return Err(MemoryError::OutOfFrames);
        }
        let frame = self.next;
        self.next += PAGE_SIZE;
        Ok(frame)
    }
}

struct ScriptedEntry {
    script: VecDeque<VmExit>,
}

impl GuestEntry for ScriptedEntry {
    fn enter(
        &mut self,
        _vcpu: &mut Vcpu,
        _mem: &mut dyn GuestMemory,
    ) -> Result<VmExit, EntryError> {
        Ok(self.script.pop_front().unwrap_or(VmExit::Hlt))
    }
}

struct CoreBackend {
    mgr: DomainManager,
    mem: TestMemory,
    alloc: Bump,
    pool: SharedPagePool,
    entry: ScriptedEntry,
    root: VcpuId,
    handle: u64,
}

impl CoreBackend {
    fn new() -> Self {
        let mem = TestMemory { bytes: vec![0u8; 128 * PAGE_SIZE as usize] };
        let mut alloc = Bump { next: 64 * PAGE_SIZE, limit: 128 * PAGE_SIZE };
        let mut mgr = DomainManager::new(&mut alloc).unwrap();
        let root = mgr.create_vcpu(0).unwrap();

        let mut backend = Self {
            mgr,
            mem,
            alloc,
            pool: SharedPagePool::new(1),
            entry: ScriptedEntry { script: VecDeque::new() },
            root,
            handle: 0,
        };
        let (handle, _) = backend
            .vmcall(abi::MV_HANDLE_OP_OPEN_HANDLE, MV_SPEC_VERSION, 0, 0)
            .expect("open handle");
        backend.handle = handle;
        backend
    }

    fn script(&mut self, events: &[VmExit]) {
        self.entry.script = events.iter().copied().collect();
    }

    /// Build flat guest page tables at 0x10000 and point the vCPU at them.
    fn setup_guest_paging(&mut self, vsid: u32) {
        const PRESENT_RW: u64 = 0x3;
        let base = 0x10000u64;
        self.mem.write_u64(base, (base + PAGE_SIZE) | PRESENT_RW).unwrap();
        self.mem.write_u64(base + PAGE_SIZE, (base + 2 * PAGE_SIZE) | PRESENT_RW).unwrap();
        self.mem.write_u64(base + 2 * PAGE_SIZE, (base + 3 * PAGE_SIZE) | PRESENT_RW).unwrap();
        for i in 0..32 {
            self.mem
                .write_u64(base + 3 * PAGE_SIZE + i * 8, (i * PAGE_SIZE) | PRESENT_RW)
                .unwrap();
        }
        self.mgr.vcpu_mut(vsid).unwrap().state.cr3 = base;
    }

    fn vmcall(&mut self, id: u64, arg0: u64, arg1: u64, arg2: u64) -> Result<(u64, u64), MvStatus> {
        {
            let vcpu = self.mgr.vcpu_mut(self.root).unwrap();
            vcpu.state.rax = id;
            vcpu.state.r10 = self.handle;
            vcpu.state.rdi = arg0;
            vcpu.state.rsi = arg1;
            vcpu.state.rdx = arg2;
        }

        let mut page = self.pool.acquire(0).expect("page free");
        let mut native = |_: u32, _: u32| CpuidRegs { rax: !0, rbx: !0, rcx: !0, rdx: !0 };
        let mut ctx = DispatchCtx {
            mem: &mut self.mem,
            alloc: &mut self.alloc,
            page: &mut page,
            entry: &mut self.entry,
            native_cpuid: &mut native,
        };
        hypercall::handle_vmcall(&mut self.mgr, self.root, &mut ctx);

        let vcpu = self.mgr.vcpu(self.root).unwrap();
        if vcpu.state.rax == MvStatus::Success as u64 {
            Ok((vcpu.state.rdi, vcpu.state.rsi))
        } else if vcpu.state.rax == MvStatus::Busy as u64 {
            Err(MvStatus::Busy)
        } else if vcpu.state.rax == MvStatus::InvalidHandle as u64 {
            Err(MvStatus::InvalidHandle)
        } else if vcpu.state.rax == MvStatus::InvalidPerm as u64 {
            Err(MvStatus::InvalidPerm)
        } else {
            Err(MvStatus::InvalidArg)
        }
    }
}

impl MvHypercall for CoreBackend {
    fn vm_op_create_vm(&mut self, flags: u64) -> Result<u16, MvStatus> {
        let (vmid, _) = self.vmcall(abi::MV_VM_OP_CREATE_VM, flags, 0, 0)?;
        Ok(vmid as u16)
    }

    fn vm_op_destroy_vm(&mut self, vmid: u16) -> Result<(), MvStatus> {
        self.vmcall(abi::MV_VM_OP_DESTROY_VM, vmid as u64, 0, 0)?;
        Ok(())
    }

    fn vm_op_map_memory(
        &mut self,
        vmid: u16,
        gpa: u64,
        spa: u64,
        size: u64,
    ) -> Result<(), MvStatus> {
        self.vmcall(abi::MV_VM_OP_MAP_MEMORY, ((vmid as u64) << 48) | gpa, spa, size)?;
        Ok(())
    }

    fn vcpu_op_create_vcpu(&mut self, vmid: u16) -> Result<u32, MvStatus> {
        let (vsid, _) = self.vmcall(abi::MV_VCPU_OP_CREATE_VCPU, vmid as u64, 0, 0)?;
        Ok(vsid as u32)
    }

    fn vcpu_op_destroy_vcpu(&mut self, vsid: u32) -> Result<(), MvStatus> {
        self.vmcall(abi::MV_VCPU_OP_DESTROY_VCPU, vsid as u64, 0, 0)?;
        Ok(())
    }

    fn vs_op_reg_get(&mut self, vsid: u32, reg: u64) -> Result<u64, MvStatus> {
        let (value, _) = self.vmcall(abi::MV_VS_OP_REG_GET, vsid as u64, reg, 0)?;
        Ok(value)
    }

    fn vs_op_reg_set(&mut self, vsid: u32, reg: u64, value: u64) -> Result<(), MvStatus> {
        self.vmcall(abi::MV_VS_OP_REG_SET, vsid as u64, reg, value)?;
        Ok(())
    }

    fn vs_op_run(&mut self, vsid: u32) -> MvExitReason {
        match self.vmcall(abi::MV_VS_OP_RUN, vsid as u64, 0, 0) {
            Ok((reason, _)) => MvExitReason::from_u64(reason).unwrap_or(MvExitReason::Failure),
            Err(_) => MvExitReason::Failure,
        }
    }

    fn read_exit_io(&mut self) -> MvExitIo {
        self.pool.acquire(0).expect("page free").exit_io().clone()
    }

    fn write_exit_io(&mut self, io: &MvExitIo) {
        *self.pool.acquire(0).expect("page free").exit_io_mut() = io.clone();
    }

    fn read_exit_failure(&mut self) -> MvExitFailure {
        *self.pool.acquire(0).expect("page free").exit_failure()
    }

    fn read_exit_yield(&mut self) -> MvExitYield {
        *self.pool.acquire(0).expect("page free").exit_yield()
    }

    fn release_shared_page(&mut self) {
        // Scoped guards release as each call returns; the explicit release
        // point of the loop has nothing left to do here.
    }
}

/// Create a VM with one vCPU, guest RAM over the low 64 frames, and flat
/// paging.
fn setup_vm(hv: &mut CoreBackend) -> (microv_shim::ShimVm, microv_shim::ShimVcpu) {
    let mut vm = handle_system_kvm_create_vm(hv).unwrap();
    let region = KvmUserspaceMemoryRegion {
        slot: 0,
        flags: 0,
        guest_phys_addr: 0,
        memory_size: 64 * PAGE_SIZE,
        userspace_addr: 0,
    };
    handle_vm_kvm_set_user_memory_region(&vm, hv, &region).unwrap();
    let vcpu = handle_vm_kvm_create_vcpu(&mut vm, hv).unwrap();
    hv.setup_guest_paging(vcpu.vsid);
    (vm, vcpu)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn out_to_serial_surfaces_as_kvm_io() {
    let mut hv = CoreBackend::new();
    let (_vm, mut vcpu) = setup_vm(&mut hv);

    {
        let v = hv.mgr.vcpu_mut(vcpu.vsid).unwrap();
        v.state.rax = 0x41;
        v.state.exit_instruction_len = 1;
    }
    let exitinfo1 =
        IoExitInfo { port: 0x3F8, is_in: false, string: false, rep: false, size: 1 }.encode();
    hv.script(&[VmExit::Io { exitinfo1 }]);

    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);
    assert_eq!(status, ShimStatus::Success);
    assert_eq!(vcpu.run.exit_reason, KVM_EXIT_IO);
    assert_eq!(vcpu.run.io.direction, KVM_EXIT_IO_OUT);
    assert_eq!(vcpu.run.io.port, 0x3F8);
    assert_eq!(vcpu.run.io.size, 1);
    assert_eq!(vcpu.run.io.count, 1);
    assert_eq!(vcpu.run.data8, 0x41);
    assert_eq!(vcpu.run.io.data_offset, KvmRun::data_offset_for(1).unwrap());
}

#[test]
fn rep_outsb_across_page_boundary_concatenates_spans() {
    let mut hv = CoreBackend::new();
    let (_vm, mut vcpu) = setup_vm(&mut hv);

    let src = 0x1FFD;
    hv.mem.write(src, b"ABCDEF").unwrap();
    {
        let v = hv.mgr.vcpu_mut(vcpu.vsid).unwrap();
        v.state.rsi = src;
        v.state.rcx = 6;
        v.state.exit_instruction_len = 2;
    }
    let exitinfo1 =
        IoExitInfo { port: 0x3F8, is_in: false, string: true, rep: true, size: 1 }.encode();
    hv.script(&[VmExit::Io { exitinfo1 }]);

    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);
    assert_eq!(status, ShimStatus::Success);
    assert_eq!(vcpu.run.exit_reason, KVM_EXIT_IO);
    assert_eq!(vcpu.run.io.count, 6);

    // Both SPAs were recorded, and the exit data is the concatenation of
    // the two page spans.
    assert_eq!(hv.mgr.vcpu(vcpu.vsid).unwrap().io_spas.len(), 2);
    assert_eq!(&hv.read_exit_io().data[..6], b"ABCDEF");
}

#[test]
fn in_round_trip_preserves_userspace_bytes() {
    let mut hv = CoreBackend::new();
    let (_vm, mut vcpu) = setup_vm(&mut hv);

    {
        let v = hv.mgr.vcpu_mut(vcpu.vsid).unwrap();
        v.state.rax = 0xFFFF_0000;
        v.state.exit_instruction_len = 1;
    }
    let exitinfo1 =
        IoExitInfo { port: 0x60, is_in: true, string: false, rep: false, size: 1 }.encode();
    hv.script(&[VmExit::Io { exitinfo1 }]);

    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);
    assert_eq!(status, ShimStatus::Success);
    assert_eq!(vcpu.run.io.direction, KVM_EXIT_IO_IN);

    // Userspace writes the response at data_offset and re-enters.
    vcpu.run.data8 = 0x5A;
    hv.script(&[VmExit::Hlt]);
    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);

    // The byte written by userspace equals the byte the IN produced.
    assert_eq!(hv.mgr.vcpu(vcpu.vsid).unwrap().state.rax & 0xFF, 0x5A);
    // The guest then halted, which the shim reports as a failed entry.
    assert_eq!(status, ShimStatus::Failure);
    assert_eq!(vcpu.run.exit_reason, KVM_EXIT_FAIL_ENTRY);
}

#[test]
fn immediate_exit_returns_intr_without_world_switch() {
    let mut hv = CoreBackend::new();
    let (_vm, mut vcpu) = setup_vm(&mut hv);

    vcpu.run.immediate_exit = 1;
    hv.script(&[VmExit::Hlt]); // must never be reached

    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);
    assert_eq!(status, ShimStatus::Interrupted);
    assert_eq!(vcpu.run.exit_reason, KVM_EXIT_INTR);
    // No entry happened: the guest is still in its initial state.
    assert!(hv.mgr.vcpu(vcpu.vsid).unwrap().is_alive());
    assert_eq!(hv.entry.script.len(), 1);
}

#[test]
fn request_interrupt_window_reports_open_window() {
    let mut hv = CoreBackend::new();
    let (_vm, mut vcpu) = setup_vm(&mut hv);

    vcpu.run.request_interrupt_window = 1;
    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);
    assert_eq!(status, ShimStatus::Success);
    assert_eq!(vcpu.run.exit_reason, KVM_EXIT_IRQ_WINDOW_OPEN);
    assert_eq!(vcpu.run.if_flag, 1);
    assert_eq!(vcpu.run.ready_for_interrupt_injection, 1);
}

#[test]
fn destroy_vm_blocks_until_vcpus_halt() {
    let mut hv = CoreBackend::new();
    let (vm, mut vcpu) = setup_vm(&mut hv);

    // A live vCPU blocks destruction.
    assert_eq!(
        handle_system_kvm_destroy_vm(&vm, &mut hv),
        Err(ShimError::VcpusRunning)
    );

    // The guest halts (run reports it as a failed entry), after which
    // destruction succeeds and the VM mutex is free again.
    hv.script(&[VmExit::Hlt]);
    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &NullPlatform);
    assert_eq!(status, ShimStatus::Failure);

    handle_system_kvm_destroy_vm(&vm, &mut hv).unwrap();
    assert!(vm.mutex.try_lock().is_some());
    assert!(hv.mgr.domain(vm.vmid).is_none());
}

#[test]
fn regs_round_trip_through_the_hypercall_surface() {
    let mut hv = CoreBackend::new();
    let (_vm, vcpu) = setup_vm(&mut hv);

    let mut regs = handle_vcpu_kvm_get_regs(&vcpu, &mut hv).unwrap();
    regs.rip = 0xFFF0;
    regs.rax = 0x1234;
    handle_vcpu_kvm_set_regs(&vcpu, &mut hv, &regs).unwrap();

    let back = handle_vcpu_kvm_get_regs(&vcpu, &mut hv).unwrap();
    assert_eq!(back.rip, 0xFFF0);
    assert_eq!(back.rax, 0x1234);
}

#[test]
fn signal_interrupts_a_busy_guest() {
    struct InterruptedPlatform;
    impl Platform for InterruptedPlatform {
        fn interrupted(&self) -> bool {
            true
        }
        fn sleep_us(&self, _: u64) {}
    }

    let mut hv = CoreBackend::new();
    let (_vm, mut vcpu) = setup_vm(&mut hv);
    hv.script(&[VmExit::Hlt]);

    let status = handle_vcpu_kvm_run(&mut vcpu, &mut hv, &InterruptedPlatform);
    assert_eq!(status, ShimStatus::Interrupted);
    assert_eq!(vcpu.run.exit_reason, KVM_EXIT_INTR);
}
