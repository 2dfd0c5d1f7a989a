//! Run op (mv_vs_op_run)
//!
//! Enters a child vCPU and keeps dispatching its exits until one of them
//! needs the parent. The exit record is already in the physical CPU's
//! shared page when this returns; the reason is the return value. On
//! re-entry, the response userspace left in the shared page is applied to
//! guest state first.

use crate::abi::{MvExitReason, MvStatus};
use crate::dispatch::{self, DispatchCtx, ExitOutcome, FAULT_EMULATION};
use crate::domain::DomainManager;
use crate::io;
use crate::vcpu::{RunState, VcpuId};

use super::{require_root, HypercallArgs, HypercallOut, HypercallResult};

pub fn handle(
    mgr: &mut DomainManager,
    caller: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> HypercallResult {
    require_root(mgr, caller)?;
    let child = u32::try_from(args.arg0).map_err(|_| MvStatus::InvalidArg)?;
    let reason = run(mgr, caller, child, ctx)?;
    Ok(HypercallOut { out0: reason as u64, out1: 0 })
}

/// Run `child` under `parent` until the next exit that must surface.
pub fn run(
    mgr: &mut DomainManager,
    parent: VcpuId,
    child: VcpuId,
    ctx: &mut DispatchCtx<'_>,
) -> Result<MvExitReason, MvStatus> {
    if parent == child {
        return Err(MvStatus::InvalidArg);
    }

    // The parent is recorded fresh on every run; the hosting thread may
    // have migrated since the last exit.
    mgr.adopt(parent, child).map_err(|_| MvStatus::InvalidArg)?;

    {
        let vcpu = mgr.vcpu_mut(child).ok_or(MvStatus::InvalidArg)?;
        if vcpu.is_killed() {
            return Err(MvStatus::InvalidArg);
        }

        // Apply the response of the previous exit before resuming.
        if let Some(xfer) = vcpu.pending_io.take() {
            let record = ctx.page.exit_io().clone();
            if io::apply_response(vcpu, ctx.mem, &xfer, &record).is_err() {
                vcpu.return_fault(ctx.page, FAULT_EMULATION);
                return Ok(MvExitReason::Failure);
            }
        }

        match vcpu.run_state() {
            RunState::ExitedToParent => vcpu.complete_exit().map_err(|_| MvStatus::Failure)?,
            _ => vcpu.enter().map_err(|_| MvStatus::InvalidArg)?,
        }
    }

    loop {
        let exit = {
            let vcpu = mgr.vcpu_mut(child).ok_or(MvStatus::Failure)?;
            match ctx.entry.enter(vcpu, ctx.mem) {
                Ok(exit) => exit,
                Err(dispatch::EntryError::EntryFailed(code)) => {
                    vcpu.return_fault(ctx.page, code);
                    return Ok(MvExitReason::Failure);
                }
            }
        };

        match dispatch::dispatch(mgr, child, exit, ctx) {
            ExitOutcome::ResumeGuest => continue,
            ExitOutcome::SwitchToParent(reason) => return Ok(reason),
            ExitOutcome::KillVcpu => return Ok(MvExitReason::Unknown),
        }
    }
}
