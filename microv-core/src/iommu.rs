//! IOMMU cooperation surface
//!
//! DMAR discovery and register programming live outside this crate; what
//! the engine owns is the per-domain device list, the domain-id mapping
//! into context entries, the flush discipline after table mutation, and
//! the PCI config-space trap used to keep enumeration honest.

extern crate alloc;

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Once;

use microv_hal::arch_impl::vmcs::IoExitInfo;

use crate::domain::{Domain, DomainError};
use crate::vcpu::{DomainId, Vcpu};

/// IOMMU errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Passthrough for this function was disabled on the command line.
    Blacklisted,
    /// The function is already bound to a domain.
    AlreadyBound,
    NotBound,
    Domain(DomainError),
}

/// Remapping-hardware facts needed to fill context entries.
#[derive(Debug, Clone, Copy)]
pub struct IommuCaps {
    /// Caching mode: hardware reserves DID 0, so domain ids shift by one.
    pub caching_mode: bool,
    pub did_bits: u8,
}

static CAPS: Once<IommuCaps> = Once::new();

/// Record the remapping capabilities once at early boot.
pub fn init(caps: IommuCaps) {
    CAPS.call_once(|| caps);
}

fn caps() -> IommuCaps {
    *CAPS.get().unwrap_or(&IommuCaps { caching_mode: false, did_bits: 8 })
}

/// The DID that goes into a context entry for `domain`. Remapping hardware
/// reserves a DID of 0 when caching mode is set, so the domain id is
/// offset by CM.
pub fn did(domain: DomainId) -> u64 {
    domain as u64 + caps().caching_mode as u64
}

/// MCFG window published by firmware (base address and length), recorded
/// once during early boot.
static MCFG_BASE: AtomicU64 = AtomicU64::new(0);
static MCFG_LEN: AtomicU64 = AtomicU64::new(0);

pub fn set_mcfg(base: u64, len: u64) {
    MCFG_BASE.store(base, Ordering::Relaxed);
    MCFG_LEN.store(len, Ordering::Relaxed);
}

pub fn mcfg() -> Option<(u64, u64)> {
    let base = MCFG_BASE.load(Ordering::Relaxed);
    if base == 0 {
        return None;
    }
    Some((base, MCFG_LEN.load(Ordering::Relaxed)))
}

/// Write-back + invalidate after any second-level or context-entry
/// mutation. The register pokes live with the DMAR bring-up; this is the
/// single point the engine calls so the ordering is kept in one place.
pub fn flush_after_table_update(domain: DomainId) {
    crate::log!("iommu: flush slpt + iotlb for did {}", did(domain));
}

/// Pack a bus/device/function triple the way config-address expects it.
pub fn pack_bdf(bus: u32, dev: u32, fun: u32) -> u32 {
    (bus << 16) | (dev << 11) | (fun << 8)
}

/// Bind a device to a domain for DMA remapping. The function must not be
/// blacklisted and may only be bound once; destruction of the domain
/// requires the binding to be revoked first.
pub fn bind_device(
    domain: &mut Domain,
    cfg: &crate::config::BootConfig,
    bus: u32,
    dev: u32,
    fun: u32,
) -> Result<(), IommuError> {
    if cfg.pci_pt_denied(bus, dev, fun) {
        return Err(IommuError::Blacklisted);
    }
    let bdf = pack_bdf(bus, dev, fun);
    if domain.bound_devices.contains(&bdf) {
        return Err(IommuError::AlreadyBound);
    }
    domain.bound_devices.push(bdf);
    flush_after_table_update(domain.id());
    Ok(())
}

/// Revoke a DMA binding.
pub fn unbind_device(domain: &mut Domain, bus: u32, dev: u32, fun: u32) -> Result<(), IommuError> {
    let bdf = pack_bdf(bus, dev, fun);
    let Some(pos) = domain.bound_devices.iter().position(|&e| e == bdf) else {
        return Err(IommuError::NotBound);
    };
    domain.bound_devices.swap_remove(pos);
    flush_after_table_update(domain.id());
    Ok(())
}

// ---------------------------------------------------------------------------
// PCI config-space trap
// ---------------------------------------------------------------------------

const PCI_CFG_ADDR_PORT: u16 = 0xCF8;

/// Emulate the legacy config-space ports for a guest. The address latch is
/// kept per vCPU; data reads answer all-ones (no device) until a device is
/// exposed through the passthrough path.
pub fn handle_pci_cfg(vcpu: &mut Vcpu, info: &IoExitInfo) {
    if info.port == PCI_CFG_ADDR_PORT {
        if info.is_in {
            vcpu.state.rax = vcpu.pci_cfg_addr as u64;
        } else {
            vcpu.pci_cfg_addr = vcpu.state.rax as u32;
        }
        return;
    }

    // 0xCFC data window
    if info.is_in {
        let mask = match info.size {
            1 => 0xFFu64,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        };
        vcpu.state.rax = (vcpu.state.rax & !mask) | mask;
    }
    // Writes to unbacked config space are dropped.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_offsets_by_caching_mode() {
        // Default caps (no CM): identity.
        assert_eq!(did(5), 5 + caps().caching_mode as u64);
    }

    #[test]
    fn cfg_latch_round_trips() {
        let mut vcpu = Vcpu::new(1, 1, 0);
        let wr = IoExitInfo { port: 0xCF8, is_in: false, string: false, rep: false, size: 4 };
        vcpu.state.rax = 0x8000_1808;
        handle_pci_cfg(&mut vcpu, &wr);
        assert_eq!(vcpu.pci_cfg_addr, 0x8000_1808);

        let rd = IoExitInfo { port: 0xCF8, is_in: true, string: false, rep: false, size: 4 };
        vcpu.state.rax = 0;
        handle_pci_cfg(&mut vcpu, &rd);
        assert_eq!(vcpu.state.rax, 0x8000_1808);
    }

    #[test]
    fn cfg_data_reads_all_ones() {
        let mut vcpu = Vcpu::new(1, 1, 0);
        let rd = IoExitInfo { port: 0xCFC, is_in: true, string: false, rep: false, size: 2 };
        vcpu.state.rax = 0xAAAA_0000;
        handle_pci_cfg(&mut vcpu, &rd);
        assert_eq!(vcpu.state.rax, 0xAAAA_FFFF);
    }

    #[test]
    fn mcfg_pointer_publishes_once() {
        assert_eq!(mcfg(), None);
        set_mcfg(0xE000_0000, 0x1000_0000);
        assert_eq!(mcfg(), Some((0xE000_0000, 0x1000_0000)));
    }

    #[test]
    fn blacklisted_function_cannot_bind() {
        use crate::config::BootConfig;
        use crate::domain::DomainManager;
        use crate::test_support::BumpAllocator;

        let mut alloc = BumpAllocator::new(0, 32);
        let mut mgr = DomainManager::new(&mut alloc).unwrap();
        let dom_id = mgr.create_domain(&mut alloc).unwrap();
        let dom = mgr.domain_mut(dom_id).unwrap();

        let cfg = BootConfig::parse(["--no-pci-pt", "02:00.0"].into_iter());
        assert_eq!(bind_device(dom, &cfg, 2, 0, 0), Err(IommuError::Blacklisted));

        bind_device(dom, &cfg, 3, 0, 0).unwrap();
        assert_eq!(bind_device(dom, &cfg, 3, 0, 0), Err(IommuError::AlreadyBound));
        assert_eq!(dom.bound_devices, [pack_bdf(3, 0, 0)]);

        unbind_device(dom, 3, 0, 0).unwrap();
        assert!(dom.bound_devices.is_empty());
        assert_eq!(unbind_device(dom, 3, 0, 0), Err(IommuError::NotBound));
    }
}
