//! The RUN ioctl
//!
//! Faithful to the KVM contract: honor `request_interrupt_window` and
//! `immediate_exit` before entering, observe pending signals between
//! entries, translate each exit reason into the run page, and release the
//! shared page on every path out.

use microv_core::abi::{MvBitSize, MvExitIo, MvExitReason, MV_EXIT_IO_IN, MV_EXIT_IO_OUT};

use crate::ioctl::ShimVcpu;
use crate::kvm_run::{
    KvmRun, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_INTR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
    KVM_EXIT_IRQ_WINDOW_OPEN, KVM_EXIT_SHUTDOWN, KVM_EXIT_UNKNOWN,
};
use crate::platform::Platform;
use crate::MvHypercall;

/// RUN ioctl results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimStatus {
    Success,
    Failure,
    /// A signal arrived or userspace asked for an immediate exit.
    Interrupted,
}

fn return_failure(run: &mut KvmRun) -> ShimStatus {
    run.exit_reason = KVM_EXIT_FAIL_ENTRY;
    ShimStatus::Failure
}

/// Translate an I/O exit record into the run page. The operand lands in
/// the staging slot matching its size and `data_offset` points at it.
fn handle_run_io(run: &mut KvmRun, exit_io: &MvExitIo) -> ShimStatus {
    run.io.direction = match exit_io.type_ {
        MV_EXIT_IO_IN => KVM_EXIT_IO_IN,
        MV_EXIT_IO_OUT => KVM_EXIT_IO_OUT,
        other => {
            microv_core::log!("io exit type {:#x} is invalid", other);
            return return_failure(run);
        }
    };

    let size = match exit_io.bit_size() {
        Some(MvBitSize::Bits8) => 1u8,
        Some(MvBitSize::Bits16) => 2,
        Some(MvBitSize::Bits32) => 4,
        _ => {
            microv_core::log!("io exit size {:#x} is invalid", exit_io.size);
            return return_failure(run);
        }
    };
    run.io.size = size;
    run.set_data_slot(size, exit_io.data_as_u64());
    run.io.data_offset = KvmRun::data_offset_for(size).expect("size checked above");

    if exit_io.addr > i16::MAX as u64 {
        microv_core::log!("io exit port {:#x} is invalid", exit_io.addr);
        return return_failure(run);
    }
    run.io.port = exit_io.addr as u16;

    if exit_io.reps > i32::MAX as u64 {
        microv_core::log!("io exit reps {:#x} is invalid", exit_io.reps);
        return return_failure(run);
    }
    run.io.count = exit_io.reps as u32;

    run.exit_reason = KVM_EXIT_IO;
    ShimStatus::Success
}

/// Pre-entry fixup for a completed IN: move the data userspace wrote into
/// the staging slot back into the hypercall record.
fn pre_run_op_io(run: &KvmRun, hv: &mut dyn MvHypercall) -> Result<(), ()> {
    if run.io.direction != KVM_EXIT_IO_IN {
        return Ok(());
    }

    let mut exit_io = hv.read_exit_io();
    exit_io.type_ = MV_EXIT_IO_IN;
    exit_io.addr = run.io.port as u64;
    exit_io.reps = run.io.count as u64;

    let size = match run.io.size {
        1 => MvBitSize::Bits8,
        2 => MvBitSize::Bits16,
        4 => MvBitSize::Bits32,
        other => {
            microv_core::log!("invalid io size {}", other);
            return Err(());
        }
    };
    exit_io.set_bit_size(size);
    let data = run.data_slot(run.io.size).ok_or(())?;
    exit_io.set_data_u64(data);

    hv.write_exit_io(&exit_io);
    Ok(())
}

/// Prepare the guest before an entry, based on how the last exit was
/// answered.
fn pre_run_op(run: &KvmRun, hv: &mut dyn MvHypercall) -> Result<(), ()> {
    // TODO: sync cr8 into the guest TPR before entry.
    if run.cr8 != 0 {
        microv_core::log!("cr8 non zero (fixme): {:#x}", run.cr8);
    }

    match run.exit_reason {
        KVM_EXIT_IO => pre_run_op_io(run, hv),
        // Nothing to complete: a fresh run page, a signal return, or a
        // window-open notification.
        KVM_EXIT_UNKNOWN | KVM_EXIT_INTR | KVM_EXIT_IRQ_WINDOW_OPEN => Ok(()),
        other => {
            microv_core::log!("pre_run_op: unhandled exit reason {}", other);
            Err(())
        }
    }
}

/// Handle the RUN ioctl for `vcpu`.
pub fn handle_vcpu_kvm_run(
    vcpu: &mut ShimVcpu,
    hv: &mut dyn MvHypercall,
    platform: &dyn Platform,
) -> ShimStatus {
    if vcpu.run.request_interrupt_window != 0 {
        vcpu.run.if_flag = 1;
        vcpu.run.ready_for_interrupt_injection = 1;
        vcpu.run.exit_reason = KVM_EXIT_IRQ_WINDOW_OPEN;
        return ShimStatus::Success;
    }

    let status = run_until_exit(vcpu, hv, platform);
    hv.release_shared_page();
    status
}

fn run_until_exit(
    vcpu: &mut ShimVcpu,
    hv: &mut dyn MvHypercall,
    platform: &dyn Platform,
) -> ShimStatus {
    while vcpu.run.immediate_exit == 0 {
        if platform.interrupted() {
            break;
        }

        if pre_run_op(&vcpu.run, hv).is_err() {
            microv_core::log!("pre_run_op failed");
            return return_failure(&mut vcpu.run);
        }

        match hv.vs_op_run(vcpu.vsid) {
            MvExitReason::Failure => return return_failure(&mut vcpu.run),
            MvExitReason::Unknown => {
                vcpu.run.exit_reason = KVM_EXIT_UNKNOWN;
                return ShimStatus::Failure;
            }
            MvExitReason::Hlt => return return_failure(&mut vcpu.run),
            MvExitReason::Io => {
                let exit_io = hv.read_exit_io();
                return handle_run_io(&mut vcpu.run, &exit_io);
            }
            MvExitReason::Mmio => return return_failure(&mut vcpu.run),
            MvExitReason::Msr => return return_failure(&mut vcpu.run),
            MvExitReason::Interrupt | MvExitReason::Nmi => continue,
            MvExitReason::Shutdown => {
                vcpu.run.exit_reason = KVM_EXIT_SHUTDOWN;
                return ShimStatus::Success;
            }
            MvExitReason::Yield => {
                let y = hv.read_exit_yield();
                platform.sleep_us(y.usec);
                continue;
            }
        }
    }

    vcpu.run.exit_reason = KVM_EXIT_INTR;
    ShimStatus::Interrupted
}
