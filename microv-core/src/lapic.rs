//! Virtual local APIC (x2APIC mode)
//!
//! Guests drive the APIC through the x2APIC MSR block; the model answers
//! reads and writes and keeps a queue of pending virtual interrupt vectors
//! (`virq`) that the dispatcher injects at the next safe point. IPIs are
//! surfaced to the caller as [`LapicAction::Ipi`] so the owning vCPU can
//! route them to the destination's queue.

use heapless::Deque;
use microv_hal::arch_impl::msr::{self, X2APIC_BASE};
use microv_hal::cpu::CpuState;

/// Pending virq capacity; overflow drops the oldest vector.
const VIRQ_QUEUE_DEPTH: usize = 64;

const LAPIC_VERSION: u64 = 0x0105_0014; // version 0x14, 6 LVT entries
const SVR_APIC_ENABLED: u64 = 1 << 8;

/// ICR delivery modes (bits 8..10)
const ICR_DM_FIXED: u64 = 0;
const ICR_DM_INIT: u64 = 0x5 << 8;
const ICR_DM_STARTUP: u64 = 0x6 << 8;
const ICR_DM_MASK: u64 = 0x7 << 8;

/// Side effects of an APIC register write that the vCPU must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapicAction {
    None,
    /// End of interrupt: the in-service vector retires.
    Eoi,
    /// Fixed IPI to another vCPU of the same domain.
    Ipi { dest_apic_id: u32, vector: u8 },
    /// INIT/SIPI pair during AP bring-up; recorded, not modeled.
    Startup { dest_apic_id: u32, vector: u8 },
}

/// APIC emulation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapicError {
    /// MSR outside the x2APIC block or not readable/writable.
    BadRegister(u32),
}

/// Per-vCPU virtual LAPIC state.
pub struct VirtLapic {
    apic_id: u32,
    tpr: u64,
    svr: u64,
    ldr: u64,
    esr: u64,
    icr: u64,
    lvt_timer: u64,
    lvt_lint0: u64,
    lvt_lint1: u64,
    lvt_error: u64,
    init_count: u64,
    divide_conf: u64,
    /// 256-bit request/in-service bitmaps, eight 32-bit chunks each.
    irr: [u32; 8],
    isr: [u32; 8],
    virqs: Deque<u8, VIRQ_QUEUE_DEPTH>,
}

fn bitmap_set(map: &mut [u32; 8], vector: u8) {
    map[(vector >> 5) as usize] |= 1 << (vector & 31);
}

fn bitmap_clear(map: &mut [u32; 8], vector: u8) {
    map[(vector >> 5) as usize] &= !(1 << (vector & 31));
}

fn bitmap_highest(map: &[u32; 8]) -> Option<u8> {
    for chunk in (0..8).rev() {
        if map[chunk] != 0 {
            let bit = 31 - map[chunk].leading_zeros();
            return Some(((chunk as u32) << 5 | bit) as u8);
        }
    }
    None
}

impl VirtLapic {
    pub fn new(apic_id: u32) -> Self {
        Self {
            apic_id,
            tpr: 0,
            svr: SVR_APIC_ENABLED | 0xFF,
            ldr: 0,
            esr: 0,
            icr: 0,
            lvt_timer: 0x0001_0000, // masked
            lvt_lint0: 0x0001_0000,
            lvt_lint1: 0x0001_0000,
            lvt_error: 0x0001_0000,
            init_count: 0,
            divide_conf: 0,
            irr: [0; 8],
            isr: [0; 8],
            virqs: Deque::new(),
        }
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    /// The vector programmed into the timer LVT entry.
    pub fn timer_vector(&self) -> u8 {
        (self.lvt_timer & 0xFF) as u8
    }

    /// Queue a virtual interrupt for delivery at the next injection point.
    /// On overflow the oldest pending vector is dropped.
    pub fn queue_virq(&mut self, vector: u8) {
        if self.virqs.push_back(vector).is_err() {
            let _ = self.virqs.pop_front();
            let _ = self.virqs.push_back(vector);
        }
        bitmap_set(&mut self.irr, vector);
    }

    pub fn has_pending(&self) -> bool {
        !self.virqs.is_empty()
    }

    /// Pop the next vector if the guest can take an interrupt right now.
    /// Vectors come out in queue order. When the window is closed the
    /// caller is expected to request interrupt-window exiting instead.
    pub fn next_injectable(&mut self, state: &CpuState) -> Option<u8> {
        if !state.interrupt_window_open() {
            return None;
        }
        let vector = self.virqs.pop_front()?;
        bitmap_clear(&mut self.irr, vector);
        bitmap_set(&mut self.isr, vector);
        Some(vector)
    }

    /// Handle a read of an x2APIC MSR.
    pub fn read_msr(&self, num: u32) -> Result<u64, LapicError> {
        match num {
            msr::X2APIC_APICID => Ok(self.apic_id as u64),
            msr::X2APIC_VERSION => Ok(LAPIC_VERSION),
            msr::X2APIC_TPR => Ok(self.tpr),
            msr::X2APIC_PPR => Ok(bitmap_highest(&self.isr).map_or(0, u64::from)),
            msr::X2APIC_LDR => Ok(self.ldr),
            msr::X2APIC_SVR => Ok(self.svr),
            msr::X2APIC_ESR => Ok(self.esr),
            msr::X2APIC_ICR => Ok(self.icr),
            msr::X2APIC_LVT_TIMER => Ok(self.lvt_timer),
            msr::X2APIC_LVT_LINT0 => Ok(self.lvt_lint0),
            msr::X2APIC_LVT_LINT1 => Ok(self.lvt_lint1),
            msr::X2APIC_LVT_ERROR => Ok(self.lvt_error),
            msr::X2APIC_INIT_COUNT => Ok(self.init_count),
            msr::X2APIC_CUR_COUNT => Ok(0),
            msr::X2APIC_DIV_CONF => Ok(self.divide_conf),
            n if (msr::X2APIC_ISR0..msr::X2APIC_ISR0 + 8).contains(&n) => {
                Ok(self.isr[(n - msr::X2APIC_ISR0) as usize] as u64)
            }
            n if (msr::X2APIC_IRR0..msr::X2APIC_IRR0 + 8).contains(&n) => {
                Ok(self.irr[(n - msr::X2APIC_IRR0) as usize] as u64)
            }
            n if n >= X2APIC_BASE && n <= msr::X2APIC_LAST => Ok(0),
            other => Err(LapicError::BadRegister(other)),
        }
    }

    /// Handle a write of an x2APIC MSR and return the required side effect.
    pub fn write_msr(&mut self, num: u32, value: u64) -> Result<LapicAction, LapicError> {
        match num {
            msr::X2APIC_TPR => {
                self.tpr = value & 0xFF;
                Ok(LapicAction::None)
            }
            msr::X2APIC_EOI => {
                if let Some(vector) = bitmap_highest(&self.isr) {
                    bitmap_clear(&mut self.isr, vector);
                }
                Ok(LapicAction::Eoi)
            }
            msr::X2APIC_SVR => {
                self.svr = value;
                Ok(LapicAction::None)
            }
            msr::X2APIC_ESR => {
                self.esr = 0;
                Ok(LapicAction::None)
            }
            msr::X2APIC_ICR => {
                self.icr = value;
                Ok(self.decode_icr(value))
            }
            msr::X2APIC_SELF_IPI => {
                let vector = (value & 0xFF) as u8;
                self.queue_virq(vector);
                Ok(LapicAction::None)
            }
            msr::X2APIC_LVT_TIMER => {
                self.lvt_timer = value;
                Ok(LapicAction::None)
            }
            msr::X2APIC_LVT_LINT0 => {
                self.lvt_lint0 = value;
                Ok(LapicAction::None)
            }
            msr::X2APIC_LVT_LINT1 => {
                self.lvt_lint1 = value;
                Ok(LapicAction::None)
            }
            msr::X2APIC_LVT_ERROR => {
                self.lvt_error = value;
                Ok(LapicAction::None)
            }
            msr::X2APIC_LVT_THERMAL | msr::X2APIC_LVT_PMI => Ok(LapicAction::None),
            msr::X2APIC_INIT_COUNT => {
                self.init_count = value;
                Ok(LapicAction::None)
            }
            msr::X2APIC_DIV_CONF => {
                self.divide_conf = value;
                Ok(LapicAction::None)
            }
            n if n >= X2APIC_BASE && n <= msr::X2APIC_LAST => Ok(LapicAction::None),
            other => Err(LapicError::BadRegister(other)),
        }
    }

    /// x2APIC ICR: destination in [63:32], vector in [7:0], delivery mode
    /// in [10:8].
    fn decode_icr(&self, icr: u64) -> LapicAction {
        let dest_apic_id = (icr >> 32) as u32;
        let vector = (icr & 0xFF) as u8;
        match icr & ICR_DM_MASK {
            ICR_DM_FIXED => LapicAction::Ipi { dest_apic_id, vector },
            ICR_DM_INIT => LapicAction::Startup { dest_apic_id, vector: 0 },
            ICR_DM_STARTUP => LapicAction::Startup { dest_apic_id, vector },
            _ => LapicAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microv_hal::cpu::RFLAGS_IF;

    fn open_state() -> CpuState {
        let mut state = CpuState::default();
        state.rflags |= RFLAGS_IF;
        state
    }

    #[test]
    fn virqs_deliver_in_queue_order() {
        let mut lapic = VirtLapic::new(0);
        lapic.queue_virq(0x31);
        lapic.queue_virq(0x22);

        let state = open_state();
        assert_eq!(lapic.next_injectable(&state), Some(0x31));
        assert_eq!(lapic.next_injectable(&state), Some(0x22));
        assert_eq!(lapic.next_injectable(&state), None);
    }

    #[test]
    fn closed_window_blocks_injection() {
        let mut lapic = VirtLapic::new(0);
        lapic.queue_virq(0x40);

        let mut state = CpuState::default(); // IF clear
        assert_eq!(lapic.next_injectable(&state), None);
        assert!(lapic.has_pending());

        state.rflags |= RFLAGS_IF;
        state.interruptibility = 1;
        assert_eq!(lapic.next_injectable(&state), None);

        state.interruptibility = 0;
        assert_eq!(lapic.next_injectable(&state), Some(0x40));
    }

    #[test]
    fn timer_vector_follows_lvt() {
        let mut lapic = VirtLapic::new(0);
        lapic.write_msr(msr::X2APIC_LVT_TIMER, 0x0002_00EF).unwrap();
        assert_eq!(lapic.timer_vector(), 0xEF);
    }

    #[test]
    fn fixed_icr_write_yields_ipi() {
        let mut lapic = VirtLapic::new(0);
        let action = lapic.write_msr(msr::X2APIC_ICR, (3u64 << 32) | 0x55).unwrap();
        assert_eq!(action, LapicAction::Ipi { dest_apic_id: 3, vector: 0x55 });
    }

    #[test]
    fn eoi_retires_in_service_vector() {
        let mut lapic = VirtLapic::new(0);
        lapic.queue_virq(0x60);
        let state = open_state();
        assert_eq!(lapic.next_injectable(&state), Some(0x60));
        assert_eq!(lapic.read_msr(msr::X2APIC_PPR).unwrap(), 0x60);
        lapic.write_msr(msr::X2APIC_EOI, 0).unwrap();
        assert_eq!(lapic.read_msr(msr::X2APIC_PPR).unwrap(), 0);
    }

    #[test]
    fn reads_outside_block_fault() {
        let lapic = VirtLapic::new(0);
        assert_eq!(lapic.read_msr(0x1B), Err(LapicError::BadRegister(0x1B)));
    }
}
