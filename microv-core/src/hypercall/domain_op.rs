//! Domain lifecycle ops (mv_vm_op_*)
//!
//! Root-only: create and destroy guest domains and populate their
//! guest-physical address space.

use crate::abi::{self, MvStatus};
use crate::dispatch::DispatchCtx;
use crate::domain::{DomainError, DomainManager};
use crate::vcpu::VcpuId;

use super::{require_root, HypercallArgs, HypercallOut, HypercallResult};

use microv_hal::arch_impl::ept::SlatFlags;
use microv_hal::memory::PAGE_SIZE;

/// Creation flags carried in arg0 of create_vm.
const CREATE_FLAG_XEN: u64 = 1 << 0;

pub fn handle(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> HypercallResult {
    require_root(mgr, vcpu_id)?;

    match args.id {
        abi::MV_VM_OP_CREATE_VM => create_vm(mgr, ctx, args),
        abi::MV_VM_OP_DESTROY_VM => destroy_vm(mgr, args),
        abi::MV_VM_OP_MAP_MEMORY => map_memory(mgr, ctx, args),
        _ => Err(MvStatus::InvalidArg),
    }
}

fn create_vm(
    mgr: &mut DomainManager,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> HypercallResult {
    let id = mgr.create_domain(ctx.alloc).map_err(domain_status)?;

    if args.arg0 & CREATE_FLAG_XEN != 0 && crate::config::get().enable_winpv {
        let domain = mgr.domain_mut(id).expect("just created");
        domain.xen = Some(crate::xen::XenHandle::new());
    }

    Ok(HypercallOut { out0: id as u64, out1: 0 })
}

fn destroy_vm(mgr: &mut DomainManager, args: &HypercallArgs) -> HypercallResult {
    let id = domain_id(args.arg0)?;
    mgr.destroy_domain(id).map_err(domain_status)?;
    Ok(HypercallOut::default())
}

/// Map `arg2` bytes of system memory at `spa` (arg1) into the domain at
/// `gpa` (packed with the domain id in arg0).
fn map_memory(
    mgr: &mut DomainManager,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> HypercallResult {
    // arg0: domain id in the top 16 bits, gpa (page aligned) below.
    let id = domain_id(args.arg0 >> 48)?;
    let gpa = args.arg0 & 0x0000_FFFF_FFFF_F000;
    let spa = args.arg1;
    let size = args.arg2;

    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(MvStatus::InvalidArg);
    }
    if gpa.checked_add(size).is_none() || spa.checked_add(size).is_none() {
        return Err(MvStatus::InvalidArg);
    }

    let domain = mgr.domain_mut(id).ok_or(MvStatus::InvalidArg)?;
    let flags = SlatFlags::READ | SlatFlags::WRITE | SlatFlags::EXEC | SlatFlags::MEMORY_WB;
    domain
        .map_memory(ctx.mem, ctx.alloc, gpa, spa, size, flags)
        .map_err(domain_status)?;
    crate::iommu::flush_after_table_update(id);
    Ok(HypercallOut::default())
}

fn domain_id(raw: u64) -> Result<crate::vcpu::DomainId, MvStatus> {
    u16::try_from(raw).map_err(|_| MvStatus::InvalidArg)
}

fn domain_status(e: DomainError) -> MvStatus {
    match e {
        DomainError::VcpusAlive | DomainError::DevicesBound => MvStatus::Busy,
        DomainError::Exhausted => MvStatus::Exhausted,
        _ => MvStatus::InvalidArg,
    }
}
