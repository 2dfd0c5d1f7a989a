//! IOMMU op: bind a device (bus/dev/fun) to a domain.

use crate::abi::{self, MvStatus};
use crate::domain::DomainManager;
use crate::iommu::{self, IommuError};
use crate::vcpu::VcpuId;

use super::{require_root, HypercallArgs, HypercallOut, HypercallResult};

pub fn handle(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    args: &HypercallArgs,
) -> HypercallResult {
    require_root(mgr, vcpu_id)?;

    match args.id {
        abi::MV_IOMMU_OP_BIND_DEVICE => {
            let domain_id = u16::try_from(args.arg0).map_err(|_| MvStatus::InvalidArg)?;
            let bus = (args.arg1 >> 8) as u32 & 0xFF;
            let dev = (args.arg1 >> 3) as u32 & 0x1F;
            let fun = args.arg1 as u32 & 0x7;

            let domain = mgr.domain_mut(domain_id).ok_or(MvStatus::InvalidArg)?;
            iommu::bind_device(domain, crate::config::get(), bus, dev, fun).map_err(|e| match e {
                IommuError::Blacklisted => MvStatus::InvalidPerm,
                IommuError::AlreadyBound => MvStatus::Busy,
                _ => MvStatus::InvalidArg,
            })?;
            Ok(HypercallOut::default())
        }
        _ => Err(MvStatus::InvalidArg),
    }
}
