//! USB3 debugger (xue) controls.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{self, MvStatus};
use crate::domain::DomainManager;
use crate::vcpu::VcpuId;

use super::{require_root, HypercallArgs, HypercallOut, HypercallResult};

static XUE_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn xue_active() -> bool {
    XUE_ACTIVE.load(Ordering::Relaxed)
}

pub fn handle(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    args: &HypercallArgs,
) -> HypercallResult {
    require_root(mgr, vcpu_id)?;

    match args.id {
        abi::MV_XUE_OP_ENABLE => {
            // The debugger must have been compiled in and asked for at
            // boot; enabling it later is not a capability grant.
            if !crate::config::get().enable_xue {
                return Err(MvStatus::InvalidPerm);
            }
            XUE_ACTIVE.store(true, Ordering::Relaxed);
            Ok(HypercallOut::default())
        }
        abi::MV_XUE_OP_DISABLE => {
            XUE_ACTIVE.store(false, Ordering::Relaxed);
            Ok(HypercallOut::default())
        }
        abi::MV_XUE_OP_STATUS => Ok(HypercallOut { out0: xue_active() as u64, out1: 0 }),
        _ => Err(MvStatus::InvalidArg),
    }
}
