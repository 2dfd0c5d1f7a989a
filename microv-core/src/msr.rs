//! MSR read/write emulation
//!
//! The x2APIC block routes to the LAPIC model, a short allowlist is
//! emulated from the vCPU's stored state, MTRRs answer with a fixed
//! write-back view. Everything else is reported to the parent, which
//! surfaces it to userspace.

use microv_hal::arch_impl::msr;

use crate::lapic::LapicAction;
use crate::vcpu::Vcpu;

/// What the dispatcher should do after an MSR intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrOutcome {
    /// Fully emulated; resume the guest.
    Handled,
    /// Emulated, with an APIC side effect the caller must carry out.
    Apic(LapicAction),
    /// Not ours; package an exit record for the parent.
    ForwardToParent,
}

/// IA32_MTRRCAP: eight variable ranges, fixed ranges, write-combining.
const MTRRCAP_VALUE: u64 = 0x508;

/// Handle a rdmsr intercept. On success the result is placed in RAX/RDX.
pub fn handle_rdmsr(vcpu: &mut Vcpu, num: u32) -> MsrOutcome {
    if msr::is_x2apic_msr(num) {
        return match vcpu.lapic.read_msr(num) {
            Ok(value) => {
                set_edx_eax(vcpu, value);
                MsrOutcome::Handled
            }
            Err(_) => MsrOutcome::ForwardToParent,
        };
    }

    if msr::is_mtrr_msr(num) {
        let value = match num {
            msr::IA32_MTRRCAP => MTRRCAP_VALUE,
            msr::IA32_MTRR_DEF_TYPE => vcpu.mtrr_def_type,
            _ => 0,
        };
        set_edx_eax(vcpu, value);
        return MsrOutcome::Handled;
    }

    let value = match num {
        msr::IA32_EFER => vcpu.state.ia32_efer,
        msr::IA32_PAT => vcpu.state.ia32_pat,
        msr::IA32_APIC_BASE => vcpu.state.ia32_apic_base,
        msr::IA32_TSC_DEADLINE => vcpu.state.ia32_tsc_deadline,
        0x174 => vcpu.state.ia32_sysenter_cs,
        0x175 => vcpu.state.ia32_sysenter_esp,
        0x176 => vcpu.state.ia32_sysenter_eip,
        0x1D9 => vcpu.state.ia32_debugctl,
        _ => return MsrOutcome::ForwardToParent,
    };
    set_edx_eax(vcpu, value);
    MsrOutcome::Handled
}

/// Handle a wrmsr intercept; the value arrives in EDX:EAX.
pub fn handle_wrmsr(vcpu: &mut Vcpu, num: u32, value: u64) -> MsrOutcome {
    if msr::is_x2apic_msr(num) {
        return match vcpu.lapic.write_msr(num, value) {
            Ok(LapicAction::None) => MsrOutcome::Handled,
            Ok(action) => MsrOutcome::Apic(action),
            Err(_) => MsrOutcome::ForwardToParent,
        };
    }

    if msr::is_mtrr_msr(num) {
        if num == msr::IA32_MTRR_DEF_TYPE {
            vcpu.mtrr_def_type = value;
        }
        // Fixed and variable ranges are accepted and ignored; the guest's
        // effective memory types are governed by the second-level tables.
        return MsrOutcome::Handled;
    }

    match num {
        msr::IA32_EFER => vcpu.state.ia32_efer = value,
        msr::IA32_PAT => vcpu.state.ia32_pat = value,
        msr::IA32_APIC_BASE => vcpu.state.ia32_apic_base = value,
        msr::IA32_TSC_DEADLINE => vcpu.state.ia32_tsc_deadline = value,
        0x174 => vcpu.state.ia32_sysenter_cs = value,
        0x175 => vcpu.state.ia32_sysenter_esp = value,
        0x176 => vcpu.state.ia32_sysenter_eip = value,
        0x1D9 => vcpu.state.ia32_debugctl = value,
        _ => return MsrOutcome::ForwardToParent,
    }
    MsrOutcome::Handled
}

fn set_edx_eax(vcpu: &mut Vcpu, value: u64) {
    vcpu.state.rax = value & 0xFFFF_FFFF;
    vcpu.state.rdx = value >> 32;
}

/// EDX:EAX as a 64-bit value, the wrmsr operand.
pub fn edx_eax(vcpu: &Vcpu) -> u64 {
    (vcpu.state.rdx << 32) | (vcpu.state.rax & 0xFFFF_FFFF)
}
