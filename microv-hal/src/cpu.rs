//! Per-vCPU architectural state
//!
//! [`CpuState`] is the register file the vmexit engine reads and writes;
//! it is loaded into the hardware control structure before entry and
//! refreshed from it after every exit. [`XsaveArea`] carries the extended
//! state (FPU/SSE/AVX) across world switches.

use bitflags::bitflags;
use static_assertions::const_assert;

/// CPU register value type
pub type RegisterValue = u64;

/// RFLAGS interrupt-enable bit, used by the interrupt-injection window check.
pub const RFLAGS_IF: u64 = x86_64::registers::rflags::RFlags::INTERRUPT_FLAG.bits();

/// CR4.OSXSAVE, gates `osxsave` reporting in cpuid leaf 1.
pub const CR4_OSXSAVE: u64 = 1 << 18;

/// CR4.PCIDE
pub const CR4_PCIDE: u64 = 1 << 17;

/// CR0.PG | CR0.PE, the bits a long-mode guest may never clear.
pub const CR0_FIXED: u64 = (1 << 31) | (1 << 0);

/// EFER.LMA
pub const EFER_LMA: u64 = 1 << 10;

/// Bits a guest may set in CR4. PCIDE is allowed exactly when the
/// processor traps `invpcid` on the guest's behalf, so cpuid leaf 1 `pcid`
/// reporting and the CR4 policy cannot disagree.
pub fn cr4_guest_allowed(invpcid_enabled: bool) -> u64 {
    let mut mask = !(1u64 << 13); // VMXE stays ours
    if !invpcid_enabled {
        mask &= !CR4_PCIDE;
    }
    mask
}

/// A segment register with its hidden descriptor cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

/// GDTR/IDTR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTableRegister {
    pub base: u64,
    pub limit: u16,
}

bitflags! {
    /// CPU feature knobs that shape per-vCPU emulation policy
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuFeatures: u64 {
        const INVPCID = 1 << 0;
        const X2APIC = 1 << 1;
        const TSC_DEADLINE = 1 << 2;
        const XSAVE = 1 << 3;
    }
}

/// Register file of one virtual CPU
#[derive(Debug, Clone)]
pub struct CpuState {
    // Control registers
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub dr7: u64,

    // General purpose registers
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    // Instruction pointer and flags
    pub rip: u64,
    pub rflags: u64,

    // Segment registers
    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
    pub tr: SegmentRegister,
    pub ldtr: SegmentRegister,

    // Descriptor tables
    pub gdtr: DescriptorTableRegister,
    pub idtr: DescriptorTableRegister,

    // MSR block
    pub ia32_efer: u64,
    pub ia32_pat: u64,
    pub ia32_sysenter_cs: u64,
    pub ia32_sysenter_esp: u64,
    pub ia32_sysenter_eip: u64,
    pub ia32_debugctl: u64,
    pub ia32_apic_base: u64,
    pub ia32_tsc_deadline: u64,

    /// Interruptibility state as reported by the hardware after the last
    /// exit (0 means an interrupt can be injected).
    pub interruptibility: u32,
    /// Length of the instruction that caused the last exit.
    pub exit_instruction_len: u32,
    /// VM-entry interrupt information: valid bit 31, vector in bits 7:0.
    pub entry_intr_info: u32,
    /// Interrupt-window exiting requested via the primary processor
    /// controls; cleared by the entry glue once the window opens.
    pub intr_window_requested: bool,
    pub xcr0: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            cr0: CR0_FIXED,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            dr7: 0x400,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0x2,
            es: SegmentRegister::default(),
            cs: SegmentRegister::default(),
            ss: SegmentRegister::default(),
            ds: SegmentRegister::default(),
            fs: SegmentRegister::default(),
            gs: SegmentRegister::default(),
            tr: SegmentRegister::default(),
            ldtr: SegmentRegister::default(),
            gdtr: DescriptorTableRegister::default(),
            idtr: DescriptorTableRegister::default(),
            ia32_efer: 0,
            ia32_pat: 0x0007_0406_0007_0406,
            ia32_sysenter_cs: 0,
            ia32_sysenter_esp: 0,
            ia32_sysenter_eip: 0,
            ia32_debugctl: 0,
            ia32_apic_base: 0xFEE0_0000 | (1 << 11),
            ia32_tsc_deadline: 0,
            interruptibility: 0,
            exit_instruction_len: 0,
            entry_intr_info: 0,
            intr_window_requested: false,
            xcr0: 1,
        }
    }
}

impl CpuState {
    /// Advance RIP past the instruction that caused the current exit.
    pub fn advance(&mut self) {
        self.rip = self.rip.wrapping_add(self.exit_instruction_len as u64);
    }

    pub fn osxsave_enabled(&self) -> bool {
        self.cr4 & CR4_OSXSAVE != 0
    }

    /// True when an external interrupt may be injected right now.
    pub fn interrupt_window_open(&self) -> bool {
        self.interruptibility == 0 && self.rflags & RFLAGS_IF != 0
    }
}

/// XSAVE area size for the legacy + header region.
const XSAVE_BASE_SIZE: usize = 576;

// The buffer must hold every component combination size_for can report.
const_assert!(XsaveArea::SIZE >= XSAVE_BASE_SIZE + 256);

/// Extended-state save area of one vCPU.
///
/// The buffer covers the legacy region, the XSAVE header and the AVX
/// component; the processor only touches the components enabled in the
/// guest's XCR0.
#[derive(Clone)]
pub struct XsaveArea {
    area: [u8; XsaveArea::SIZE],
    xcr0: u64,
}

impl XsaveArea {
    pub const SIZE: usize = 1024;

    pub fn new(xcr0: u64) -> Self {
        Self { area: [0u8; Self::SIZE], xcr0 }
    }

    pub fn xcr0(&self) -> u64 {
        self.xcr0
    }

    pub fn set_xcr0(&mut self, xcr0: u64) {
        self.xcr0 = xcr0;
    }

    /// Size in bytes the hardware reports for a given XCR0 (legacy + header
    /// plus the AVX component when YMM state is enabled).
    pub fn size_for(xcr0: u64) -> usize {
        let mut size = XSAVE_BASE_SIZE;
        if xcr0 & (1 << 2) != 0 {
            size += 256; // YMM high halves
        }
        size
    }

    /// Save the physical CPU's extended state into this area.
    #[cfg(all(target_arch = "x86_64", feature = "hw"))]
    pub fn save(&mut self) {
        unsafe {
            core::arch::asm!(
                "xsave64 [{area}]",
                area = in(reg) self.area.as_mut_ptr(),
                in("eax") self.xcr0 as u32,
                in("edx") (self.xcr0 >> 32) as u32,
                options(nostack),
            );
        }
    }

    /// Load this area into the physical CPU.
    #[cfg(all(target_arch = "x86_64", feature = "hw"))]
    pub fn load(&self) {
        unsafe {
            core::arch::asm!(
                "xrstor64 [{area}]",
                area = in(reg) self.area.as_ptr(),
                in("eax") self.xcr0 as u32,
                in("edx") (self.xcr0 >> 32) as u32,
                options(nostack),
            );
        }
    }
}
