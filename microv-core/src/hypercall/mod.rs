//! Hypercall surface
//!
//! Register convention: hypercall id in RAX, handle in R10, arguments in
//! RDI/RSI/RDX; the status comes back in RAX and outputs in RDI/RSI.
//! Every op validates the caller's capability, its arguments and the
//! handle before touching any state; a failed validation mutates nothing.
//!
//! Domains with the Xen shim enabled may also issue classic Xen
//! hypercalls (small numbers in RAX); these are routed to the compat
//! modules and answer with Xen's own return convention.

pub mod domain_op;
pub mod event_op;
pub mod iommu_op;
pub mod run_op;
pub mod vcpu_op;
pub mod xue_op;

use crate::abi::{self, MvStatus};
use crate::dispatch::{DispatchCtx, ExitOutcome};
use crate::domain::DomainManager;
use crate::vcpu::VcpuId;

/// Pseudo vCPU id meaning "the calling vCPU".
pub const MV_SELF_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Interface version accepted by open_handle.
pub const MV_SPEC_VERSION: u64 = 1;

/// Register-passed arguments of one vmcall.
#[derive(Debug, Clone, Copy)]
pub struct HypercallArgs {
    pub id: u64,
    pub handle: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

/// Register outputs written back on success.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypercallOut {
    pub out0: u64,
    pub out1: u64,
}

pub type HypercallResult = Result<HypercallOut, MvStatus>;

// Classic Xen hypercall numbers accepted when the shim is on.
const XEN_HC_MEMORY_OP: u64 = 12;
const XEN_HC_XEN_VERSION: u64 = 17;
const XEN_HC_GRANT_TABLE_OP: u64 = 20;

/// Handle a vmcall exit of `vcpu_id`. The caller's registers carry the
/// request; the outcome is always a resumed caller with status and
/// outputs written back.
pub fn handle_vmcall(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
) -> ExitOutcome {
    let Some(vcpu) = mgr.vcpu(vcpu_id) else {
        return ExitOutcome::KillVcpu;
    };

    let args = HypercallArgs {
        id: vcpu.state.rax,
        handle: vcpu.state.r10,
        arg0: vcpu.state.rdi,
        arg1: vcpu.state.rsi,
        arg2: vcpu.state.rdx,
    };

    // Xen compat path first: small ids, own return convention.
    if args.id < 64 {
        let rax = xen_call(mgr, vcpu_id, ctx, &args);
        if let Some(vcpu) = mgr.vcpu_mut(vcpu_id) {
            vcpu.state.rax = rax as u64;
            vcpu.state.advance();
        }
        return ExitOutcome::ResumeGuest;
    }

    let result = mv_call(mgr, vcpu_id, ctx, &args);

    if let Some(vcpu) = mgr.vcpu_mut(vcpu_id) {
        match result {
            Ok(out) => {
                vcpu.state.rax = MvStatus::Success as u64;
                vcpu.state.rdi = out.out0;
                vcpu.state.rsi = out.out1;
            }
            Err(status) => vcpu.state.rax = status as u64,
        }
        vcpu.state.advance();
    }
    ExitOutcome::ResumeGuest
}

fn mv_call(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> HypercallResult {
    // open_handle is the only op that runs without a current handle.
    if args.id == abi::MV_HANDLE_OP_OPEN_HANDLE {
        return open_handle(mgr, vcpu_id, args);
    }

    validate_handle(mgr, vcpu_id, args)?;

    if args.id == abi::MV_HANDLE_OP_CLOSE_HANDLE {
        return close_handle(mgr, vcpu_id);
    }

    match abi::hypercall_group(args.id) {
        abi::MV_VM_OP => domain_op::handle(mgr, vcpu_id, ctx, args),
        abi::MV_VCPU_OP => vcpu_op::handle_vcpu_op(mgr, vcpu_id, args),
        abi::MV_VS_OP => match args.id {
            abi::MV_VS_OP_RUN => run_op::handle(mgr, vcpu_id, ctx, args),
            _ => vcpu_op::handle_vs_op(mgr, vcpu_id, ctx, args),
        },
        abi::MV_PP_OP => pp_op(args),
        abi::MV_EVENT_OP => event_op::handle(mgr, vcpu_id, args),
        abi::MV_IOMMU_OP => iommu_op::handle(mgr, vcpu_id, args),
        abi::MV_XUE_OP => xue_op::handle(mgr, vcpu_id, args),
        _ => Err(MvStatus::InvalidArg),
    }
}

/// The caller's handle must be the one its domain currently has open.
fn validate_handle(
    mgr: &DomainManager,
    vcpu_id: VcpuId,
    args: &HypercallArgs,
) -> Result<(), MvStatus> {
    let domain = caller_domain(mgr, vcpu_id)?;
    if domain.handle == abi::MV_INVALID_HANDLE || args.handle != domain.handle {
        return Err(MvStatus::InvalidHandle);
    }
    Ok(())
}

/// Ops that reshape domains, vCPUs or devices are root-only.
pub(crate) fn require_root(mgr: &DomainManager, vcpu_id: VcpuId) -> Result<(), MvStatus> {
    let vcpu = mgr.vcpu(vcpu_id).ok_or(MvStatus::InvalidArg)?;
    if !vcpu.is_root() {
        return Err(MvStatus::InvalidPerm);
    }
    Ok(())
}

fn caller_domain<'a>(
    mgr: &'a DomainManager,
    vcpu_id: VcpuId,
) -> Result<&'a crate::domain::Domain, MvStatus> {
    let vcpu = mgr.vcpu(vcpu_id).ok_or(MvStatus::InvalidArg)?;
    mgr.domain(vcpu.domain_id()).ok_or(MvStatus::InvalidArg)
}

fn open_handle(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    args: &HypercallArgs,
) -> HypercallResult {
    if args.arg0 != MV_SPEC_VERSION {
        return Err(MvStatus::InvalidArg);
    }
    let domain_id = mgr.vcpu(vcpu_id).ok_or(MvStatus::InvalidArg)?.domain_id();
    let domain = mgr.domain_mut(domain_id).ok_or(MvStatus::InvalidArg)?;

    let handle = 0x4D56_0000u64 | domain_id as u64;
    domain.handle = handle;
    Ok(HypercallOut { out0: handle, out1: 0 })
}

fn close_handle(mgr: &mut DomainManager, vcpu_id: VcpuId) -> HypercallResult {
    let domain_id = mgr.vcpu(vcpu_id).ok_or(MvStatus::InvalidArg)?.domain_id();
    let domain = mgr.domain_mut(domain_id).ok_or(MvStatus::InvalidArg)?;
    domain.handle = abi::MV_INVALID_HANDLE;
    Ok(HypercallOut::default())
}

fn pp_op(args: &HypercallArgs) -> HypercallResult {
    match args.id {
        abi::MV_PP_OP_SET_SHARED_PAGE_GPA => {
            if args.arg0 & 0xFFF != 0 {
                return Err(MvStatus::InvalidArg);
            }
            crate::log!("shared page gpa set to {:#x}", args.arg0);
            Ok(HypercallOut::default())
        }
        abi::MV_PP_OP_CLR_SHARED_PAGE_GPA => Ok(HypercallOut::default()),
        _ => Err(MvStatus::InvalidArg),
    }
}

// ---------------------------------------------------------------------------
// Xen compat routing
// ---------------------------------------------------------------------------

/// Dispatch a classic Xen hypercall; returns the RAX value (0 or -errno).
fn xen_call(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> i64 {
    const ENOSYS: i64 = -38;
    const EINVAL: i64 = -22;

    let Some(vcpu) = mgr.vcpu(vcpu_id) else {
        return EINVAL;
    };
    let domain_id = vcpu.domain_id();
    let Some(domain) = mgr.domain_mut(domain_id) else {
        return EINVAL;
    };
    if domain.xen.is_none() {
        return ENOSYS;
    }

    match args.id {
        XEN_HC_XEN_VERSION => {
            let Some(op) = crate::xen::xenver::XenVerOp::from_raw(args.arg0 as u32) else {
                return ENOSYS;
            };
            let xen = domain.xen.as_ref().expect("checked above");
            use crate::xen::xenver::XenVerOp;
            match op {
                XenVerOp::Version => xen.ver.version() as i64,
                XenVerOp::PageSize => xen.ver.pagesize() as i64,
                XenVerOp::GetFeatures => xen.ver.get_features(args.arg1 as u32) as i64,
                XenVerOp::PlatformParameters => xen.ver.platform_parameters() as i64,
                // String subops copy through guest buffers the caller
                // provided; the buffer write is the shim's job.
                _ => 0,
            }
        }
        XEN_HC_GRANT_TABLE_OP => {
            const GNTTABOP_QUERY_SIZE: u64 = 6;
            const GNTTABOP_SET_VERSION: u64 = 8;
            let xen = domain.xen.as_mut().expect("checked above");
            match args.arg0 {
                GNTTABOP_QUERY_SIZE => {
                    let (nr, max) = xen.gnttab.query_size();
                    ((max as i64) << 32) | nr as i64
                }
                GNTTABOP_SET_VERSION => match xen.gnttab.set_version(args.arg1 as u32) {
                    Ok(()) => 0,
                    Err(_) => EINVAL,
                },
                _ => ENOSYS,
            }
        }
        XEN_HC_MEMORY_OP => {
            const XENMEM_ADD_TO_PHYSMAP: u64 = 7;
            if args.arg0 != XENMEM_ADD_TO_PHYSMAP {
                return ENOSYS;
            }
            // arg1 = space, arg2 = (idx << 32) | gfn
            let space = args.arg1 as u32;
            let idx = (args.arg2 >> 32) as u32;
            let gpa = (args.arg2 & 0xFFFF_FFFF) << 12;

            let (slat_res, xen) = {
                let domain = mgr.domain_mut(domain_id).expect("checked above");
                let Some(mut xen) = domain.xen.take() else {
                    return ENOSYS;
                };
                let res = xen.add_to_physmap(
                    domain.slat_mut(),
                    ctx.mem,
                    ctx.alloc,
                    space,
                    idx,
                    gpa,
                );
                (res, xen)
            };
            let domain = mgr.domain_mut(domain_id).expect("checked above");
            domain.xen = Some(xen);

            match slat_res {
                Ok(()) => {
                    crate::iommu::flush_after_table_update(domain_id);
                    0
                }
                Err(_) => EINVAL,
            }
        }
        _ => ENOSYS,
    }
}
