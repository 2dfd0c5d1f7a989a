//! vCPU lifecycle and virtual-state ops (mv_vcpu_op_*, mv_vs_op_* except
//! run)

use crate::abi::{self, MvStatus};
use crate::dispatch::DispatchCtx;
use crate::domain::{DomainError, DomainManager};
use crate::translate::gva_to_spa;
use crate::vcpu::{Vcpu, VcpuId};

use super::{require_root, HypercallArgs, HypercallOut, HypercallResult, MV_SELF_ID};

pub fn handle_vcpu_op(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    args: &HypercallArgs,
) -> HypercallResult {
    require_root(mgr, vcpu_id)?;

    match args.id {
        abi::MV_VCPU_OP_CREATE_VCPU => {
            let domain = u16::try_from(args.arg0).map_err(|_| MvStatus::InvalidArg)?;
            let id = mgr.create_vcpu(domain).map_err(|e| match e {
                DomainError::NoSuchDomain => MvStatus::InvalidArg,
                _ => MvStatus::Exhausted,
            })?;
            Ok(HypercallOut { out0: id as u64, out1: 0 })
        }
        abi::MV_VCPU_OP_DESTROY_VCPU => {
            let id = u32::try_from(args.arg0).map_err(|_| MvStatus::InvalidArg)?;
            mgr.destroy_vcpu(id).map_err(|e| match e {
                DomainError::VcpusAlive => MvStatus::Busy,
                _ => MvStatus::InvalidArg,
            })?;
            Ok(HypercallOut::default())
        }
        _ => Err(MvStatus::InvalidArg),
    }
}

pub fn handle_vs_op(
    mgr: &mut DomainManager,
    vcpu_id: VcpuId,
    ctx: &mut DispatchCtx<'_>,
    args: &HypercallArgs,
) -> HypercallResult {
    match args.id {
        abi::MV_VS_OP_REG_GET => {
            require_root(mgr, vcpu_id)?;
            let target = resolve(vcpu_id, args.arg0)?;
            let vcpu = mgr.vcpu(target).ok_or(MvStatus::InvalidArg)?;
            let value = reg_get(vcpu, args.arg1)?;
            Ok(HypercallOut { out0: value, out1: 0 })
        }
        abi::MV_VS_OP_REG_SET => {
            require_root(mgr, vcpu_id)?;
            let target = resolve(vcpu_id, args.arg0)?;
            let vcpu = mgr.vcpu_mut(target).ok_or(MvStatus::InvalidArg)?;
            reg_set(vcpu, args.arg1, args.arg2)?;
            Ok(HypercallOut::default())
        }
        abi::MV_VS_OP_GLA_TO_GPA => {
            // Any domain may translate its own addresses.
            let target = resolve(vcpu_id, args.arg0)?;
            let (vcpu, domain) = mgr.vcpu_and_domain_mut(target).ok_or(MvStatus::InvalidArg)?;
            let gla = args.arg1;
            let t = gva_to_spa(ctx.mem, domain.slat(), vcpu.state.cr3, gla)
                .map_err(|_| MvStatus::Failure)?;
            Ok(HypercallOut { out0: t.gpa, out1: t.flags.bits() })
        }
        _ => Err(MvStatus::InvalidArg),
    }
}

fn resolve(caller: VcpuId, raw: u64) -> Result<VcpuId, MvStatus> {
    if raw == MV_SELF_ID {
        return Ok(caller);
    }
    u32::try_from(raw).map_err(|_| MvStatus::InvalidArg)
}

/// Register indices of the get/set surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Reg {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rsi = 4,
    Rdi = 5,
    Rbp = 6,
    Rsp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
    Rflags = 17,
    Cr0 = 18,
    Cr3 = 19,
    Cr4 = 20,
    Efer = 21,
}

impl Reg {
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw > Reg::Efer as u64 {
            return None;
        }
        // Values are dense; the match below keeps the mapping explicit.
        Some(match raw {
            0 => Reg::Rax,
            1 => Reg::Rbx,
            2 => Reg::Rcx,
            3 => Reg::Rdx,
            4 => Reg::Rsi,
            5 => Reg::Rdi,
            6 => Reg::Rbp,
            7 => Reg::Rsp,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            15 => Reg::R15,
            16 => Reg::Rip,
            17 => Reg::Rflags,
            18 => Reg::Cr0,
            19 => Reg::Cr3,
            20 => Reg::Cr4,
            _ => Reg::Efer,
        })
    }
}

pub fn reg_get(vcpu: &Vcpu, raw: u64) -> Result<u64, MvStatus> {
    let reg = Reg::from_raw(raw).ok_or(MvStatus::InvalidArg)?;
    let s = &vcpu.state;
    Ok(match reg {
        Reg::Rax => s.rax,
        Reg::Rbx => s.rbx,
        Reg::Rcx => s.rcx,
        Reg::Rdx => s.rdx,
        Reg::Rsi => s.rsi,
        Reg::Rdi => s.rdi,
        Reg::Rbp => s.rbp,
        Reg::Rsp => s.rsp,
        Reg::R8 => s.r8,
        Reg::R9 => s.r9,
        Reg::R10 => s.r10,
        Reg::R11 => s.r11,
        Reg::R12 => s.r12,
        Reg::R13 => s.r13,
        Reg::R14 => s.r14,
        Reg::R15 => s.r15,
        Reg::Rip => s.rip,
        Reg::Rflags => s.rflags,
        Reg::Cr0 => s.cr0,
        Reg::Cr3 => s.cr3,
        Reg::Cr4 => s.cr4,
        Reg::Efer => s.ia32_efer,
    })
}

pub fn reg_set(vcpu: &mut Vcpu, raw: u64, value: u64) -> Result<(), MvStatus> {
    let reg = Reg::from_raw(raw).ok_or(MvStatus::InvalidArg)?;

    // CR4 writes honor the per-vCPU policy mask.
    if reg == Reg::Cr4 {
        let allowed = microv_hal::cpu::cr4_guest_allowed(vcpu.invpcid_enabled);
        if value & !allowed != 0 {
            return Err(MvStatus::InvalidArg);
        }
    }

    let s = &mut vcpu.state;
    match reg {
        Reg::Rax => s.rax = value,
        Reg::Rbx => s.rbx = value,
        Reg::Rcx => s.rcx = value,
        Reg::Rdx => s.rdx = value,
        Reg::Rsi => s.rsi = value,
        Reg::Rdi => s.rdi = value,
        Reg::Rbp => s.rbp = value,
        Reg::Rsp => s.rsp = value,
        Reg::R8 => s.r8 = value,
        Reg::R9 => s.r9 = value,
        Reg::R10 => s.r10 = value,
        Reg::R11 => s.r11 = value,
        Reg::R12 => s.r12 = value,
        Reg::R13 => s.r13 = value,
        Reg::R14 => s.r14 = value,
        Reg::R15 => s.r15 = value,
        Reg::Rip => s.rip = value,
        Reg::Rflags => s.rflags = value,
        Reg::Cr0 => s.cr0 = value,
        Reg::Cr3 => s.cr3 = value,
        Reg::Cr4 => s.cr4 = value,
        Reg::Efer => s.ia32_efer = value,
    }
    Ok(())
}
