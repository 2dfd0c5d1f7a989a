//! Hypercall ABI shared between the hypervisor, the root shim and guests.
//!
//! Every structure here crosses the shared page, so the layouts are fixed
//! and checked at compile time. Register conventions: the hypercall id is
//! passed in RAX, the handle in R10, arguments in RDI/RSI/RDX, the status
//! comes back in RAX and outputs in RDI/RSI.

use static_assertions::const_assert_eq;

/// Status register returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MvStatus {
    Success = 0,
    Failure = 1,
    InvalidArg = 2,
    InvalidHandle = 3,
    InvalidPerm = 4,
    Exhausted = 5,
    Busy = 6,
}

/// Exit reasons returned by `mv_vs_op_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MvExitReason {
    Failure = 0,
    Unknown = 1,
    Hlt = 2,
    Io = 3,
    Mmio = 4,
    Msr = 5,
    Interrupt = 6,
    Nmi = 7,
    Shutdown = 8,
    Yield = 9,
}

impl MvExitReason {
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Failure),
            1 => Some(Self::Unknown),
            2 => Some(Self::Hlt),
            3 => Some(Self::Io),
            4 => Some(Self::Mmio),
            5 => Some(Self::Msr),
            6 => Some(Self::Interrupt),
            7 => Some(Self::Nmi),
            8 => Some(Self::Shutdown),
            9 => Some(Self::Yield),
            _ => None,
        }
    }
}

/// Operand sizes crossing the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MvBitSize {
    Bits8 = 0,
    Bits16 = 1,
    Bits32 = 2,
    Bits64 = 3,
}

impl MvBitSize {
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Bits8),
            1 => Some(Self::Bits16),
            2 => Some(Self::Bits32),
            3 => Some(Self::Bits64),
            _ => None,
        }
    }

    pub fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(Self::Bits8),
            2 => Some(Self::Bits16),
            4 => Some(Self::Bits32),
            8 => Some(Self::Bits64),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

pub const MV_EXIT_IO_IN: u64 = 0;
pub const MV_EXIT_IO_OUT: u64 = 1;

/// Capacity of the inline data buffer in [`MvExitIo`]. Sized so the record
/// plus the shared-page header is exactly one page.
pub const MV_EXIT_IO_MAX_DATA: usize = 4056;

/// I/O exit record placed in the shared page.
///
/// Every field is a plain integer so the record can be viewed in place on
/// the shared page regardless of what the other side wrote.
#[derive(Clone)]
#[repr(C)]
pub struct MvExitIo {
    /// MV_EXIT_IO_IN or MV_EXIT_IO_OUT
    pub type_: u64,
    /// Raw [`MvBitSize`] value
    pub size: u64,
    /// Port number
    pub addr: u64,
    /// Repeat count (1 for non-string accesses)
    pub reps: u64,
    pub data: [u8; MV_EXIT_IO_MAX_DATA],
}

impl MvExitIo {
    pub fn zeroed() -> Self {
        Self {
            type_: MV_EXIT_IO_OUT,
            size: MvBitSize::Bits8 as u64,
            addr: 0,
            reps: 1,
            data: [0u8; MV_EXIT_IO_MAX_DATA],
        }
    }

    pub fn bit_size(&self) -> Option<MvBitSize> {
        MvBitSize::from_u64(self.size)
    }

    pub fn set_bit_size(&mut self, size: MvBitSize) {
        self.size = size as u64;
    }

    /// The first eight data bytes as a register-sized value (non-string
    /// accesses carry the operand here).
    pub fn data_as_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[..8]);
        u64::from_le_bytes(buf)
    }

    pub fn set_data_u64(&mut self, val: u64) {
        self.data[..8].copy_from_slice(&val.to_le_bytes());
    }
}

/// MMIO exit record (EPT violation reflected to the parent).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MvExitMmio {
    pub gpa: u64,
    /// Non-zero when the faulting access was a write.
    pub is_write: u64,
    pub nbytes: u64,
    pub data: [u8; 8],
}

/// MSR exit record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MvExitMsr {
    pub msr: u64,
    pub value: u64,
    /// Non-zero for wrmsr.
    pub is_write: u64,
}

/// Failure exit record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MvExitFailure {
    pub code: u64,
}

/// Yield exit record: the parent puts the child to sleep.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MvExitYield {
    pub usec: u64,
}

const_assert_eq!(core::mem::size_of::<MvExitIo>(), 4088);
const_assert_eq!(core::mem::size_of::<MvExitMmio>(), 32);
const_assert_eq!(core::mem::size_of::<MvExitMsr>(), 24);
const_assert_eq!(core::mem::size_of::<MvExitFailure>(), 8);

// ---------------------------------------------------------------------------
// Hypercall numbering
// ---------------------------------------------------------------------------

// Group 0 is never used: ids below 0x10000 stay clear of the classic Xen
// hypercall numbers a compat guest may issue.
pub const MV_HANDLE_OP: u16 = 1;
pub const MV_VM_OP: u16 = 2;
pub const MV_VCPU_OP: u16 = 3;
pub const MV_VS_OP: u16 = 4;
pub const MV_PP_OP: u16 = 5;
pub const MV_EVENT_OP: u16 = 6;
pub const MV_IOMMU_OP: u16 = 7;
pub const MV_XUE_OP: u16 = 8;

pub const fn hypercall_id(group: u16, index: u16) -> u64 {
    ((group as u64) << 16) | index as u64
}

pub const fn hypercall_group(id: u64) -> u16 {
    (id >> 16) as u16
}

pub const fn hypercall_index(id: u64) -> u16 {
    id as u16
}

pub const MV_HANDLE_OP_OPEN_HANDLE: u64 = hypercall_id(MV_HANDLE_OP, 1);
pub const MV_HANDLE_OP_CLOSE_HANDLE: u64 = hypercall_id(MV_HANDLE_OP, 2);

pub const MV_VM_OP_CREATE_VM: u64 = hypercall_id(MV_VM_OP, 1);
pub const MV_VM_OP_DESTROY_VM: u64 = hypercall_id(MV_VM_OP, 2);
pub const MV_VM_OP_MAP_MEMORY: u64 = hypercall_id(MV_VM_OP, 3);

pub const MV_VCPU_OP_CREATE_VCPU: u64 = hypercall_id(MV_VCPU_OP, 1);
pub const MV_VCPU_OP_DESTROY_VCPU: u64 = hypercall_id(MV_VCPU_OP, 2);

pub const MV_VS_OP_RUN: u64 = hypercall_id(MV_VS_OP, 1);
pub const MV_VS_OP_REG_GET: u64 = hypercall_id(MV_VS_OP, 2);
pub const MV_VS_OP_REG_SET: u64 = hypercall_id(MV_VS_OP, 3);
pub const MV_VS_OP_GLA_TO_GPA: u64 = hypercall_id(MV_VS_OP, 4);

pub const MV_PP_OP_SET_SHARED_PAGE_GPA: u64 = hypercall_id(MV_PP_OP, 1);
pub const MV_PP_OP_CLR_SHARED_PAGE_GPA: u64 = hypercall_id(MV_PP_OP, 2);

pub const MV_EVENT_OP_QUEUE: u64 = hypercall_id(MV_EVENT_OP, 1);
pub const MV_EVENT_OP_EOI_POLICY: u64 = hypercall_id(MV_EVENT_OP, 2);

pub const MV_IOMMU_OP_BIND_DEVICE: u64 = hypercall_id(MV_IOMMU_OP, 1);

pub const MV_XUE_OP_ENABLE: u64 = hypercall_id(MV_XUE_OP, 1);
pub const MV_XUE_OP_DISABLE: u64 = hypercall_id(MV_XUE_OP, 2);
pub const MV_XUE_OP_STATUS: u64 = hypercall_id(MV_XUE_OP, 3);

/// The null handle; every other value returned by open_handle is valid.
pub const MV_INVALID_HANDLE: u64 = 0;
