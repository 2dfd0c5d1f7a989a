//! The KVM-compatible run page
//!
//! Userspace VMMs mmap one of these per vCPU and read the exit details
//! out of it after every RUN ioctl. The layout is ABI: offsets are fixed
//! and `data_offset` points at whichever staging slot matches the access
//! size.

use core::mem::offset_of;
use static_assertions::const_assert;

// kvm_run.exit_reason values
pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_MMIO: u32 = 6;
pub const KVM_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTR: u32 = 10;

// kvm_run.io.direction values
pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

/// `kvm_run.io`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KvmRunIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    /// Byte offset, relative to the start of the run page, of the data
    /// slot for this access.
    pub data_offset: u64,
}

/// `kvm_run.mmio`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KvmRunMmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
}

/// `kvm_run.fail_entry`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KvmRunFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

/// The run page. Header fields mirror KVM's `struct kvm_run`; the data
/// slots at the tail are where I/O operands are staged, addressed through
/// `io.data_offset`.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct KvmRun {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    padding1: [u8; 6],

    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,

    pub cr8: u64,
    pub apic_base: u64,

    pub io: KvmRunIo,
    pub mmio: KvmRunMmio,
    pub fail_entry: KvmRunFailEntry,

    pub data8: u8,
    pub data16: u16,
    pub data32: u32,
}

impl KvmRun {
    pub fn new() -> Self {
        Self {
            request_interrupt_window: 0,
            immediate_exit: 0,
            padding1: [0; 6],
            exit_reason: KVM_EXIT_UNKNOWN,
            ready_for_interrupt_injection: 0,
            if_flag: 0,
            flags: 0,
            cr8: 0,
            apic_base: 0,
            io: KvmRunIo::default(),
            mmio: KvmRunMmio::default(),
            fail_entry: KvmRunFailEntry::default(),
            data8: 0,
            data16: 0,
            data32: 0,
        }
    }

    /// Offset of the staging slot for an access of `size` bytes.
    pub fn data_offset_for(size: u8) -> Option<u64> {
        match size {
            1 => Some(offset_of!(KvmRun, data8) as u64),
            2 => Some(offset_of!(KvmRun, data16) as u64),
            4 => Some(offset_of!(KvmRun, data32) as u64),
            _ => None,
        }
    }

    /// The value currently in the staging slot for `size`.
    pub fn data_slot(&self, size: u8) -> Option<u64> {
        match size {
            1 => Some(self.data8 as u64),
            2 => Some(self.data16 as u64),
            4 => Some(self.data32 as u64),
            _ => None,
        }
    }

    pub fn set_data_slot(&mut self, size: u8, value: u64) {
        match size {
            1 => self.data8 = value as u8,
            2 => self.data16 = value as u16,
            4 => self.data32 = value as u32,
            _ => {}
        }
    }
}

impl Default for KvmRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Size of the per-vCPU mmap region handed to userspace.
pub const fn vcpu_mmap_size() -> usize {
    4096
}

const_assert!(core::mem::size_of::<KvmRun>() <= vcpu_mmap_size());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_offset_points_at_the_slot() {
        let mut run = KvmRun::new();
        run.data32 = 0xDDCC_BBAA;

        let off = KvmRun::data_offset_for(4).unwrap() as usize;
        let bytes = unsafe {
            core::slice::from_raw_parts(&run as *const KvmRun as *const u8, core::mem::size_of::<KvmRun>())
        };
        let mut found = [0u8; 4];
        found.copy_from_slice(&bytes[off..off + 4]);
        assert_eq!(u32::from_le_bytes(found), 0xDDCC_BBAA);
    }

    #[test]
    fn slots_are_distinct() {
        let o1 = KvmRun::data_offset_for(1).unwrap();
        let o2 = KvmRun::data_offset_for(2).unwrap();
        let o4 = KvmRun::data_offset_for(4).unwrap();
        assert_ne!(o1, o2);
        assert_ne!(o2, o4);
        assert_eq!(KvmRun::data_offset_for(8), None);
    }

    #[test]
    fn slot_round_trip() {
        let mut run = KvmRun::new();
        run.set_data_slot(2, 0x1234_5678);
        assert_eq!(run.data_slot(2), Some(0x5678));
    }
}
