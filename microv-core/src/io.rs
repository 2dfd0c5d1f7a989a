//! Port I/O emulation
//!
//! An I/O intercept runs in two phases. In guest context the exit
//! qualification is decoded and, for string operations, the source or
//! destination buffer is translated page by page into the vCPU's two SPA
//! scratch slots. After the world switch the root stages the bytes into
//! the shared-page record (or pulls the response back in for IN). The
//! transfer may cross exactly one page boundary; anything longer fails the
//! emulation.

use microv_hal::arch_impl::ept::Slat;
use microv_hal::arch_impl::vmcs::IoExitInfo;
use microv_hal::memory::{GuestMemory, MemoryError, PAGE_MASK, PAGE_SIZE};

use crate::abi::{MvBitSize, MvExitIo, MV_EXIT_IO_IN, MV_EXIT_IO_MAX_DATA, MV_EXIT_IO_OUT};
use crate::translate::{gva_to_spa, pages_spanned, split_transfer, TranslateError};
use crate::vcpu::Vcpu;

/// I/O emulation errors; all of them fail the current entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// A string transfer crossed more than one page boundary.
    TooManyPages,
    /// The transfer does not fit the exit record's data buffer.
    OversizeTransfer,
    /// The second SPA slot was expected to be page aligned but is not.
    UnalignedPage,
    /// The recorded SPA slots do not match the transfer.
    MissingSpa,
    BadSize,
    Translation(TranslateError),
    Memory(MemoryError),
}

impl From<TranslateError> for IoError {
    fn from(e: TranslateError) -> Self {
        IoError::Translation(e)
    }
}

impl From<MemoryError> for IoError {
    fn from(e: MemoryError) -> Self {
        IoError::Memory(e)
    }
}

/// Decoded transfer, carried from the guest-context phase to the staging
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTransfer {
    pub info: IoExitInfo,
    pub reps: u64,
    pub bytes: u64,
    /// Linear address of the string buffer (RSI for OUT, RDI for IN);
    /// meaningless for register transfers.
    pub string_addr: u64,
}

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Guest-context phase: decode the intercept and record the SPA of every
/// page the transfer touches so the post-switch copy can proceed without
/// re-walking.
pub fn decode_and_translate(
    vcpu: &mut Vcpu,
    slat: &Slat,
    mem: &dyn GuestMemory,
    exitinfo1: u64,
) -> Result<IoTransfer, IoError> {
    let info = IoExitInfo::decode(exitinfo1);

    let reps = if info.rep { vcpu.state.rcx } else { 1 };
    let bytes = (info.size as u64).checked_mul(reps).ok_or(IoError::OversizeTransfer)?;

    let mut xfer = IoTransfer { info, reps, bytes, string_addr: 0 };

    if info.string {
        xfer.string_addr = if info.is_in { vcpu.state.rdi } else { vcpu.state.rsi };

        let num_pages = pages_spanned(xfer.string_addr, bytes);
        if num_pages > 2 {
            crate::log!("string i/o spans {} pages, rejecting", num_pages);
            return Err(IoError::TooManyPages);
        }

        vcpu.io_spas.clear();
        let mut page_addr = xfer.string_addr;
        for i in 0..num_pages {
            if i != 0 {
                page_addr = (xfer.string_addr & PAGE_MASK) + i * PAGE_SIZE;
            }
            let t = gva_to_spa(mem, slat, vcpu.state.cr3, page_addr)?;
            vcpu.io_spas.push(t.spa).map_err(|_| IoError::TooManyPages)?;
        }
    }

    Ok(xfer)
}

/// Root-context phase: fill the exit record from guest state, copying the
/// string bytes out of the recorded SPA spans.
pub fn stage_exit(
    vcpu: &Vcpu,
    mem: &dyn GuestMemory,
    xfer: &IoTransfer,
    io: &mut MvExitIo,
) -> Result<(), IoError> {
    io.addr = xfer.info.port as u64;
    io.set_bit_size(MvBitSize::from_bytes(xfer.info.size).ok_or(IoError::BadSize)?);
    io.reps = xfer.reps;
    io.type_ = if xfer.info.is_in { MV_EXIT_IO_IN } else { MV_EXIT_IO_OUT };

    if xfer.bytes > MV_EXIT_IO_MAX_DATA as u64 {
        crate::log!("i/o transfer of {:#x} bytes overflows the exit record", xfer.bytes);
        return Err(IoError::OversizeTransfer);
    }

    if !xfer.info.string {
        io.set_data_u64(vcpu.state.rax & size_mask(xfer.info.size));
        return Ok(());
    }

    let spans = split_transfer(xfer.string_addr, xfer.bytes);
    let first_spa = *vcpu.io_spas.first().ok_or(IoError::MissingSpa)?;
    mem.read(first_spa, &mut io.data[..spans.first_len as usize])?;

    if spans.second_len > 0 {
        let second_spa = *vcpu.io_spas.get(1).ok_or(IoError::MissingSpa)?;
        if second_spa & !PAGE_MASK != 0 {
            return Err(IoError::UnalignedPage);
        }
        let start = spans.first_len as usize;
        let end = start + spans.second_len as usize;
        mem.read(second_spa, &mut io.data[start..end])?;
    }

    Ok(())
}

const RFLAGS_DF: u64 = 1 << 10;

/// Architectural register effects of a completed string instruction:
/// RSI/RDI move by the transfer size (direction per RFLAGS.DF) and a REP
/// prefix leaves RCX at zero. RIP advancement is the dispatcher's job.
pub fn retire_string(vcpu: &mut Vcpu, xfer: &IoTransfer) {
    if !xfer.info.string {
        return;
    }
    let delta = if vcpu.state.rflags & RFLAGS_DF != 0 {
        (xfer.bytes as i64).wrapping_neg()
    } else {
        xfer.bytes as i64
    };
    if xfer.info.is_in {
        vcpu.state.rdi = vcpu.state.rdi.wrapping_add_signed(delta);
    } else {
        vcpu.state.rsi = vcpu.state.rsi.wrapping_add_signed(delta);
    }
    if xfer.info.rep {
        vcpu.state.rcx = 0;
    }
}

/// Apply the userspace response of an IN transfer back to guest state:
/// registers for a plain IN, the recorded SPA spans for INS.
pub fn apply_response(
    vcpu: &mut Vcpu,
    mem: &mut dyn GuestMemory,
    xfer: &IoTransfer,
    io: &MvExitIo,
) -> Result<(), IoError> {
    if !xfer.info.is_in {
        return Ok(());
    }

    if !xfer.info.string {
        let mask = size_mask(xfer.info.size);
        vcpu.state.rax = (vcpu.state.rax & !mask) | (io.data_as_u64() & mask);
        return Ok(());
    }

    let spans = split_transfer(xfer.string_addr, xfer.bytes);
    let first_spa = *vcpu.io_spas.first().ok_or(IoError::MissingSpa)?;
    mem.write(first_spa, &io.data[..spans.first_len as usize])?;

    if spans.second_len > 0 {
        let second_spa = *vcpu.io_spas.get(1).ok_or(IoError::MissingSpa)?;
        let start = spans.first_len as usize;
        let end = start + spans.second_len as usize;
        mem.write(second_spa, &io.data[start..end])?;
    }

    Ok(())
}
