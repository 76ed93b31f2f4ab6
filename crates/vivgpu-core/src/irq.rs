//! Interrupt handling and deferred sync-point work.
//!
//! [`CoreShared::handle_irq`] runs in interrupt context and never takes the
//! device lock. It moves the fence counter and wakes waiters; fence callbacks
//! and the final drop of a submission happen on the ordered worker.

use tracing::{debug, error, trace, warn};

use crate::device::CoreShared;
use crate::events::{SlotEvent, SlotId, SlotState};
use crate::queue::Retirement;
use crate::regs::{hi, mmu, IntrAck};
use crate::workqueue::OrderedWorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The acknowledge register was empty; not our interrupt.
    None,
    Handled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuFaultReason {
    SlaveNotPresent,
    PageNotPresent,
    WriteViolation,
    OutOfBound,
    ReadSecurityViolation,
    WriteSecurityViolation,
    Unknown(u8),
}

impl MmuFaultReason {
    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::SlaveNotPresent,
            2 => Self::PageNotPresent,
            3 => Self::WriteViolation,
            4 => Self::OutOfBound,
            5 => Self::ReadSecurityViolation,
            6 => Self::WriteSecurityViolation,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuFault {
    pub mmu: u32,
    pub reason: MmuFaultReason,
    pub address: u32,
}

/// A hardware fault seen by the interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRecord {
    AxiBusError {
        axi_status: u32,
    },
    MmuException {
        status: u32,
        faults: [Option<MmuFault>; mmu::MMU_COUNT as usize],
    },
}

/// Work the interrupt path hands to the ordered worker.
#[derive(Debug)]
pub(crate) enum CoreWork {
    /// `generation` ties the sync point to the slot acquisition that raised it.
    SyncPoint { slot: SlotId, generation: u32 },
    Retire(Retirement),
}

impl CoreShared {
    pub(crate) fn handle_irq(&self, worker: &OrderedWorkQueue<CoreWork>) -> IrqReturn {
        let mut intr = self.bus.read32(hi::INTR_ACKNOWLEDGE);
        if intr == 0 {
            return IrqReturn::None;
        }
        self.stats.inc_interrupts();
        trace!(intr = format_args!("{intr:#010x}"), "interrupt");

        if intr & IntrAck::AXI_BUS_ERROR.bits() != 0 {
            let axi_status = self.bus.read32(hi::AXI_STATUS);
            error!(axi_status = format_args!("{axi_status:#x}"), "AXI bus error");
            self.stats.inc_bus_errors();
            self.record_fault(FaultRecord::AxiBusError { axi_status });
            intr &= !IntrAck::AXI_BUS_ERROR.bits();
        }

        if intr & IntrAck::MMU_EXCEPTION.bits() != 0 {
            let fault = self.read_mmu_fault();
            self.stats.inc_mmu_faults();
            self.record_fault(fault);
            intr &= !IntrAck::MMU_EXCEPTION.bits();
        }

        while intr != 0 {
            let slot = intr.trailing_zeros() as SlotId;
            intr &= !(1 << slot);
            trace!(slot, "event");

            match self.events.on_interrupt(slot) {
                SlotEvent::Free => {
                    warn!(slot, "event for a free slot ignored");
                    self.stats.inc_spurious_events();
                }
                SlotEvent::SyncPoint { generation } => {
                    if !worker.push(CoreWork::SyncPoint { slot, generation }) {
                        error!(slot, "sync point worker gone");
                    }
                }
                SlotEvent::Completed(state) => {
                    if let Some(retirement) = self.complete_slot(slot, state) {
                        if !worker.push(CoreWork::Retire(retirement)) {
                            error!(slot, "retire worker gone");
                        }
                    }
                }
            }
        }

        IrqReturn::Handled
    }

    /// Accounts for a released slot. On the submission's last slot the
    /// counter moves past its fence before the retirement is handed back.
    pub(crate) fn complete_slot(&self, slot: SlotId, state: SlotState) -> Option<Retirement> {
        let submission = state.submission?;
        self.stats.inc_completions();
        let last = submission.complete_slot();
        if last {
            debug!(slot, seqno = submission.fence().seqno(), "fence completed");
            submission.mark_completed(&self.timeline);
        }
        Some(Retirement { submission, last })
    }

    fn read_mmu_fault(&self) -> FaultRecord {
        let status = self.bus.read32(mmu::STATUS);
        let mut faults = [None; mmu::MMU_COUNT as usize];
        for (i, fault) in faults.iter_mut().enumerate() {
            let code = ((status >> (i * 4)) & 0xf) as u8;
            if code == 0 {
                continue;
            }
            let address = self.bus.read32(mmu::exception_addr(i as u32));
            let reason = MmuFaultReason::from_code(code);
            error!(
                mmu = i,
                ?reason,
                address = format_args!("{address:#010x}"),
                "MMU fault"
            );
            *fault = Some(MmuFault {
                mmu: i as u32,
                reason,
                address,
            });
        }
        FaultRecord::MmuException { status, faults }
    }

    fn record_fault(&self, fault: FaultRecord) {
        *self.last_fault.lock() = Some(fault);
    }

    pub(crate) fn run_work(&self, work: CoreWork) {
        let retirement = match work {
            CoreWork::SyncPoint { slot, generation } => self.run_sync_point(slot, generation),
            CoreWork::Retire(retirement) => Some(retirement),
        };
        if let Some(retirement) = retirement {
            retirement.finish();
        }
    }

    /// Deferred half of a sync point: runs the callback, releases the slot,
    /// then lets the FE continue past the END it stopped at. Fence callbacks
    /// wait until the device lock is dropped.
    fn run_sync_point(&self, slot: SlotId, generation: u32) -> Option<Retirement> {
        let state = self.lock_state();
        let Some((callback, submission)) = self.events.sync_point(slot, generation) else {
            debug!(slot, "stale sync point ignored");
            return None;
        };

        callback(&*self.bus, &submission);
        drop(submission);
        self.stats.inc_sync_points();

        let resume = state.ring.resume_addr(slot);
        let retirement = self
            .events
            .take_if_generation(slot, generation)
            .and_then(|slot_state| self.complete_slot(slot, slot_state));

        // Restart last so the next event cannot race this worker.
        match resume {
            Some(addr) => self.start_fe(addr, 2),
            None => warn!(slot, "sync point without resume address"),
        }
        retirement
    }
}
