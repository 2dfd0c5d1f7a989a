//! Event ops: queue a virtual interrupt, set the EOI policy.

use crate::abi::{self, MvStatus};
use crate::domain::DomainManager;
use crate::vcpu::VcpuId;

use super::{require_root, HypercallArgs, HypercallOut, HypercallResult};

pub fn handle(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    args: &HypercallArgs,
) -> HypercallResult {
    require_root(mgr, vcpu_id)?;

    match args.id {
        abi::MV_EVENT_OP_QUEUE => {
            let target = u32::try_from(args.arg0).map_err(|_| MvStatus::InvalidArg)?;
            let vector = u8::try_from(args.arg1).map_err(|_| MvStatus::InvalidArg)?;
            let vcpu = mgr.vcpu_mut(target).ok_or(MvStatus::InvalidArg)?;
            if vcpu.is_killed() {
                return Err(MvStatus::InvalidArg);
            }
            vcpu.lapic.queue_virq(vector);
            Ok(HypercallOut::default())
        }
        abi::MV_EVENT_OP_EOI_POLICY => {
            let target = u32::try_from(args.arg0).map_err(|_| MvStatus::InvalidArg)?;
            let vcpu = mgr.vcpu_mut(target).ok_or(MvStatus::InvalidArg)?;
            vcpu.eoi_policy = args.arg1;
            Ok(HypercallOut::default())
        }
        _ => Err(MvStatus::InvalidArg),
    }
}
