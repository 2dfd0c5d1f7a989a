//! Domains and the domain/vCPU arena
//!
//! A domain bundles vCPUs that share a second-level page table, an MSI
//! remapping scope and a device assignment list. Domain 0 is the root
//! domain and always exists. vCPUs are stored in the arena beside the
//! domains so parent links can stay plain ids; the arena resolves them on
//! demand.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use microv_hal::arch_impl::ept::{Slat, SlatError, SlatFlags};
use microv_hal::memory::{FrameAllocator, GuestMemory};

use crate::vcpu::{DomainId, Vcpu, VcpuId};
use crate::xen::XenHandle;

pub const ROOT_DOMAIN_ID: DomainId = 0;

/// Domain lifecycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
    NoSuchDomain,
    NoSuchVcpu,
    /// The root domain cannot be destroyed.
    RootImmortal,
    /// Destruction requires every vCPU of the domain to be halted.
    VcpusAlive,
    /// Destruction requires all DMA bindings to be revoked first.
    DevicesBound,
    /// Domain-id space (dense 16 bit) is exhausted.
    Exhausted,
    Slat(SlatError),
}

impl From<SlatError> for DomainError {
    fn from(e: SlatError) -> Self {
        DomainError::Slat(e)
    }
}

pub struct Domain {
    id: DomainId,
    slat: Slat,
    vcpus: BTreeSet<VcpuId>,
    /// Devices bound through the IOMMU, by packed BDF.
    pub bound_devices: Vec<u32>,
    /// Xen compatibility surface, enabled per domain.
    pub xen: Option<XenHandle>,
    /// Currently open hypercall handle (MV_INVALID_HANDLE when closed).
    pub handle: u64,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_DOMAIN_ID
    }

    pub fn slat(&self) -> &Slat {
        &self.slat
    }

    pub fn slat_mut(&mut self) -> &mut Slat {
        &mut self.slat
    }

    pub fn vcpu_ids(&self) -> impl Iterator<Item = VcpuId> + '_ {
        self.vcpus.iter().copied()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Map guest-physical memory onto system memory for this domain.
    pub fn map_memory(
        &mut self,
        mem: &mut dyn GuestMemory,
        alloc: &mut dyn FrameAllocator,
        gpa: u64,
        spa: u64,
        size: u64,
        flags: SlatFlags,
    ) -> Result<(), DomainError> {
        self.slat.map(mem, alloc, gpa, spa, size, flags)?;
        Ok(())
    }
}

/// The arena of all domains and vCPUs. One instance per hypervisor,
/// initialized once at early boot.
pub struct DomainManager {
    domains: BTreeMap<DomainId, Domain>,
    vcpus: BTreeMap<VcpuId, Vcpu>,
    next_domain: DomainId,
    next_vcpu: VcpuId,
}

impl DomainManager {
    /// Create the arena with the root domain already present.
    pub fn new(alloc: &mut dyn FrameAllocator) -> Result<Self, DomainError> {
        let mut mgr = Self {
            domains: BTreeMap::new(),
            vcpus: BTreeMap::new(),
            next_domain: ROOT_DOMAIN_ID,
            next_vcpu: 0,
        };
        mgr.create_domain(alloc)?; // becomes domain 0
        Ok(mgr)
    }

    pub fn create_domain(&mut self, alloc: &mut dyn FrameAllocator) -> Result<DomainId, DomainError> {
        let id = self.next_domain;
        self.next_domain = self.next_domain.checked_add(1).ok_or(DomainError::Exhausted)?;

        let domain = Domain {
            id,
            slat: Slat::new(alloc)?,
            vcpus: BTreeSet::new(),
            bound_devices: Vec::new(),
            xen: None,
            handle: crate::abi::MV_INVALID_HANDLE,
        };
        self.domains.insert(id, domain);
        Ok(id)
    }

    /// Destroy a non-root domain. All of its vCPUs must be halted and all
    /// DMA bindings revoked; on success the vCPUs are torn down with it.
    pub fn destroy_domain(&mut self, id: DomainId) -> Result<(), DomainError> {
        let domain = self.domains.get(&id).ok_or(DomainError::NoSuchDomain)?;
        if domain.is_root() {
            return Err(DomainError::RootImmortal);
        }
        if domain.vcpus.iter().any(|v| self.vcpus.get(v).is_some_and(|v| v.is_alive())) {
            return Err(DomainError::VcpusAlive);
        }
        if !domain.bound_devices.is_empty() {
            return Err(DomainError::DevicesBound);
        }

        let domain = self.domains.remove(&id).expect("checked above");
        for vcpu_id in &domain.vcpus {
            self.vcpus.remove(vcpu_id);
            // Drop the child link from whichever vCPU parented it last.
            for parent in self.vcpus.values_mut() {
                parent.remove_child(*vcpu_id);
            }
        }
        Ok(())
    }

    pub fn domain(&self, id: DomainId) -> Option<&Domain> {
        self.domains.get(&id)
    }

    pub fn domain_mut(&mut self, id: DomainId) -> Option<&mut Domain> {
        self.domains.get_mut(&id)
    }

    pub fn domain_exists(&self, id: DomainId) -> bool {
        self.domains.contains_key(&id)
    }

    /// Create a vCPU bound to `domain`. Its APIC id is its index within
    /// the domain.
    pub fn create_vcpu(&mut self, domain: DomainId) -> Result<VcpuId, DomainError> {
        let dom = self.domains.get_mut(&domain).ok_or(DomainError::NoSuchDomain)?;
        let id = self.next_vcpu;
        self.next_vcpu = self.next_vcpu.checked_add(1).ok_or(DomainError::Exhausted)?;

        let apic_id = dom.vcpus.len() as u32;
        dom.vcpus.insert(id);
        self.vcpus.insert(id, Vcpu::new(id, domain, apic_id));
        Ok(id)
    }

    /// Remove a killed vCPU from the arena.
    pub fn destroy_vcpu(&mut self, id: VcpuId) -> Result<(), DomainError> {
        let vcpu = self.vcpus.get(&id).ok_or(DomainError::NoSuchVcpu)?;
        if vcpu.is_alive() {
            return Err(DomainError::VcpusAlive);
        }
        let domain = vcpu.domain_id();
        self.vcpus.remove(&id);
        if let Some(dom) = self.domains.get_mut(&domain) {
            dom.vcpus.remove(&id);
        }
        for parent in self.vcpus.values_mut() {
            parent.remove_child(id);
        }
        Ok(())
    }

    pub fn vcpu(&self, id: VcpuId) -> Option<&Vcpu> {
        self.vcpus.get(&id)
    }

    pub fn vcpu_mut(&mut self, id: VcpuId) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(&id)
    }

    /// A vCPU together with its owning domain; the borrows are disjoint so
    /// emulation can walk the domain's tables while mutating the vCPU.
    pub fn vcpu_and_domain_mut(&mut self, id: VcpuId) -> Option<(&mut Vcpu, &Domain)> {
        let vcpu = self.vcpus.get_mut(&id)?;
        let domain = self.domains.get(&vcpu.domain_id())?;
        Some((vcpu, domain))
    }

    /// Link `child` under `parent` for the current run. Keeps the
    /// parent/child relation symmetric: the old parent (if any) drops its
    /// link first.
    pub fn adopt(&mut self, parent: VcpuId, child: VcpuId) -> Result<(), DomainError> {
        if !self.vcpus.contains_key(&parent) {
            return Err(DomainError::NoSuchVcpu);
        }
        let old_parent = {
            let c = self.vcpus.get_mut(&child).ok_or(DomainError::NoSuchVcpu)?;
            let old = c.parent();
            c.set_parent(parent);
            old
        };
        if let Some(old) = old_parent {
            if old != parent {
                if let Some(p) = self.vcpus.get_mut(&old) {
                    p.remove_child(child);
                }
            }
        }
        self.vcpus.get_mut(&parent).expect("checked above").add_child(child);
        Ok(())
    }

    /// Queue a virq on the vCPU of `domain` whose APIC id is
    /// `dest_apic_id`. Used for IPI delivery between sibling vCPUs.
    pub fn queue_virq(&mut self, domain: DomainId, dest_apic_id: u32, vector: u8) -> bool {
        let Some(dom) = self.domains.get(&domain) else {
            return false;
        };
        let ids: Vec<VcpuId> = dom.vcpus.iter().copied().collect();
        for id in ids {
            if let Some(vcpu) = self.vcpus.get_mut(&id) {
                if vcpu.lapic.apic_id() == dest_apic_id {
                    vcpu.lapic.queue_virq(vector);
                    return true;
                }
            }
        }
        false
    }
}
