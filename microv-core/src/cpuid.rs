//! CPUID filtering
//!
//! Passthrough is only used for leaves we don't mind the guest seeing that
//! also have no reserved bits. Reserved bits represent future CPU
//! features, so they are forced to zero; otherwise a new feature would
//! leak into guests the moment hardware starts setting its bit.
//!
//! Every leaf a guest may see is handled here; any other leaf returns
//! zeros in rax..rdx without executing cpuid at all. The root domain runs
//! with passthrough plus a small set of overrides that hide Intel PT.

use core::sync::atomic::{AtomicBool, Ordering};

/// The four cpuid output registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
}

/// Per-vCPU knobs consulted by the filters.
#[derive(Debug, Clone, Copy)]
pub struct CpuidCtx {
    pub is_root: bool,
    /// Processor traps invpcid for this guest; gates both `pcid` and
    /// `invpcid` reporting (and, elsewhere, CR4.PCIDE).
    pub invpcid_enabled: bool,
    /// Current guest CR4.OSXSAVE.
    pub cr4_osxsave: bool,
}

/// Hypervisor signature returned in leaf 0x40000000.
pub const HYPERVISOR_SIGNATURE: u64 = 0xBFBF_BFBF;

// Leaf 0x00000001 ECX whitelist: sse3, pclmulqdq, ssse3, fma, cmpxchg16b,
// sse41, sse42, x2apic, movbe, popcnt, tsc_deadline, aesni, xsave, avx,
// f16c, rdrand. Bit 31 tells the guest it runs in a VM.
const GUEST_1_ECX: u64 = (1 << 0)
    | (1 << 1)
    | (1 << 9)
    | (1 << 12)
    | (1 << 13)
    | (1 << 19)
    | (1 << 20)
    | (1 << 21)
    | (1 << 22)
    | (1 << 23)
    | (1 << 24)
    | (1 << 25)
    | (1 << 26)
    | (1 << 28)
    | (1 << 29)
    | (1 << 30)
    | (1 << 31);
const LEAF1_ECX_PCID: u64 = 1 << 17;
const LEAF1_ECX_OSXSAVE: u64 = 1 << 27;

// Leaf 0x00000001 EDX whitelist: fpu, vme, pse, tsc, msr, pae, cx8, apic,
// mtrr, pge, cmov, pat, pse36, clfsh, mmx, fxsr, sse, sse2, ss.
const GUEST_1_EDX: u64 = (1 << 0)
    | (1 << 1)
    | (1 << 3)
    | (1 << 4)
    | (1 << 5)
    | (1 << 6)
    | (1 << 8)
    | (1 << 9)
    | (1 << 12)
    | (1 << 13)
    | (1 << 15)
    | (1 << 16)
    | (1 << 17)
    | (1 << 19)
    | (1 << 23)
    | (1 << 24)
    | (1 << 25)
    | (1 << 26)
    | (1 << 27);

// Leaf 0x00000007 subleaf 0 EBX whitelist: fsgsbase, bmi1, hle, avx2,
// fdp_excptn_only, smep, bmi2, erms, fpucs_fpuds, rdseed, adx, smap,
// clflushopt, clwb, sha.
const GUEST_7_EBX: u64 = (1 << 0)
    | (1 << 3)
    | (1 << 4)
    | (1 << 5)
    | (1 << 6)
    | (1 << 7)
    | (1 << 8)
    | (1 << 9)
    | (1 << 13)
    | (1 << 18)
    | (1 << 19)
    | (1 << 20)
    | (1 << 23)
    | (1 << 24)
    | (1 << 29);
const LEAF7_EBX_INVPCID: u64 = 1 << 10;
const LEAF7_EBX_INTEL_PT: u64 = 1 << 25;

const LEAF_8000_0007_EDX_INVARIANT_TSC: u64 = 1 << 8;

/// Set when leaf 0x80000007 reports a non-invariant TSC. The system keeps
/// running but is outside what guest timekeeping can tolerate.
static SYSTEM_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

pub fn system_unsupported() -> bool {
    SYSTEM_UNSUPPORTED.load(Ordering::Relaxed)
}

/// Filter one cpuid exit. `regs` holds the guest's current rax..rdx (leaf
/// in rax, subleaf in rcx); `native` executes cpuid on the physical CPU.
/// Returns the registers to hand back to the guest.
pub fn filter(
    ctx: &CpuidCtx,
    regs: &CpuidRegs,
    native: &mut dyn FnMut(u32, u32) -> CpuidRegs,
) -> CpuidRegs {
    let leaf = regs.rax as u32;
    let subleaf = regs.rcx as u32;

    if ctx.is_root {
        filter_root(leaf, subleaf, native)
    } else {
        filter_guest(ctx, leaf, subleaf, regs, native)
    }
}

fn zeros() -> CpuidRegs {
    CpuidRegs::default()
}

// ---------------------------------------------------------------------------
// Root domain
// ---------------------------------------------------------------------------

fn filter_root(
    leaf: u32,
    subleaf: u32,
    native: &mut dyn FnMut(u32, u32) -> CpuidRegs,
) -> CpuidRegs {
    match leaf {
        0x0000_0007 => {
            let mut out = native(leaf, subleaf);
            if subleaf == 0 {
                // Hide Intel PT
                out.rbx &= !LEAF7_EBX_INTEL_PT;
            }
            out
        }
        0x0000_000D => {
            let mut out = native(leaf, subleaf);
            // Remove Intel PT from XSAVE reporting
            if subleaf == 1 {
                out.rcx &= !(1 << 8);
            } else if subleaf == 8 {
                out = zeros();
            }
            out
        }
        // Clear all Intel PT specific leaves
        0x0000_0014 => zeros(),
        _ => native(leaf, subleaf),
    }
}

// ---------------------------------------------------------------------------
// Guest domains
// ---------------------------------------------------------------------------

fn filter_guest(
    ctx: &CpuidCtx,
    leaf: u32,
    subleaf: u32,
    regs: &CpuidRegs,
    native: &mut dyn FnMut(u32, u32) -> CpuidRegs,
) -> CpuidRegs {
    match leaf {
        0x0000_0000 | 0x0000_0002 | 0x8000_0002 | 0x8000_0003 | 0x8000_0004 => {
            native(leaf, subleaf)
        }

        0x0000_0001 => {
            let mut out = native(leaf, subleaf);

            // Mask off APIC IDs, set initial APIC ID to 0
            out.rbx &= 0x0000_FFFF;

            let mut rcx = GUEST_1_ECX;
            if ctx.invpcid_enabled {
                rcx |= LEAF1_ECX_PCID;
            }
            if ctx.cr4_osxsave {
                rcx |= LEAF1_ECX_OSXSAVE;
            }
            out.rcx = (out.rcx & rcx) | (1 << 31);
            out.rdx &= GUEST_1_EDX;
            out
        }

        0x0000_0004 => {
            let mut out = native(leaf, subleaf);
            // Bits 31-26 and 25-14 advertise the number of addressable IDs
            // that share this cache; zero them (callers add 1 per the SDM).
            out.rax &= 0x0000_03FF;
            // edx[2:0] exposes wbinvd/invd behavior; the rest is reserved.
            out.rdx &= 0x0000_0007;
            out
        }

        0x0000_0007 => {
            if subleaf > 0 {
                return zeros();
            }
            let mut out = native(leaf, subleaf);
            out.rax = 0;

            let mut rbx = GUEST_7_EBX;
            if ctx.invpcid_enabled {
                rbx |= LEAF7_EBX_INVPCID;
            }
            out.rbx &= rbx;
            out.rcx &= 0x0040_0000;
            out.rdx = 0;
            out
        }

        0x0000_000A => {
            let mut out = native(leaf, subleaf);
            out.rax = 0;
            // Disable fixed-function perf counters 0-6 by setting them to 1
            out.rbx |= 0x0000_007F;
            out.rcx = 0;
            out.rdx = 0;
            out
        }

        0x0000_000D => {
            let mut out = native(leaf, subleaf);
            if subleaf == 1 {
                // Report the save-area size for the currently enabled XCR0
                // bits; supervisor states must not contribute.
                out.rbx = native(0xD, 0).rbx;
            }
            out
        }

        0x0000_0015 => {
            let mut out = native(leaf, subleaf);
            out.rdx = 0;
            out
        }

        0x0000_0016 => {
            let mut out = native(leaf, subleaf);
            out.rax &= 0x0000_FFFF;
            out.rbx &= 0x0000_FFFF;
            out.rcx &= 0x0000_FFFF;
            out.rdx = 0;
            out
        }

        0x4000_0000 => CpuidRegs {
            rax: HYPERVISOR_SIGNATURE,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
        },

        0x8000_0000 => {
            let mut out = native(leaf, subleaf);
            out.rbx = 0;
            out.rcx = 0;
            out.rdx = 0;
            out
        }

        0x8000_0001 => {
            let mut out = native(leaf, subleaf);
            out.rbx = 0;
            // lahf_lm, lzcnt, prefetchw
            out.rcx &= 0x0000_0121;
            // syscall, nx, 1g pages, rdtscp, long mode
            out.rdx &= 0x2C10_0800;
            out
        }

        0x8000_0006 => {
            let mut out = native(leaf, subleaf);
            out.rax = 0;
            out.rbx = 0;
            out.rcx &= 0xFFFF_F0FF;
            out.rdx = 0;
            out
        }

        0x8000_0007 => {
            let mut out = native(leaf, subleaf);
            if out.rdx & LEAF_8000_0007_EDX_INVARIANT_TSC == 0 {
                crate::log!("Non-Invariant TSC. System not supported!!!");
                SYSTEM_UNSUPPORTED.store(true, Ordering::Relaxed);
            }
            out.rax = 0;
            out.rbx = 0;
            out.rcx = 0;
            out.rdx &= LEAF_8000_0007_EDX_INVARIANT_TSC;
            out
        }

        0x8000_0008 => {
            let mut out = native(leaf, subleaf);
            out.rax &= 0x0000_FFFF;
            out.rbx = 0;
            out.rcx = 0;
            out.rdx = 0;
            out
        }

        _ => zeros(),
    }
}
