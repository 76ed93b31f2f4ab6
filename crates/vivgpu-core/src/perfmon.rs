//! Performance-counter sampling around a submission.
//!
//! A sampled submission brackets its command buffer with two sync points. The
//! FE halts at each one and the sync-point worker reads the requested counters
//! before restarting it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::bus::RegisterBus;
use crate::queue::Submission;
use crate::regs::{clock_control, hi, perfmon, pm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerfmonPhase {
    /// Sampled before the command buffer runs.
    Pre,
    /// Sampled after the command buffer completed.
    Post,
}

/// Where a counter sample lands. Shared between the submitter and the worker.
#[derive(Debug, Default)]
pub struct PerfmonReading {
    value: AtomicU32,
    sequence: AtomicU32,
}

impl PerfmonReading {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Sequence number of the request that last completed into this reading.
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct PerfmonRequest {
    pub phase: PerfmonPhase,
    pub domain: u8,
    pub signal: u8,
    /// Written to the reading once the post sample is taken.
    pub sequence: u32,
    pub reading: Arc<PerfmonReading>,
}

fn sample(bus: &dyn RegisterBus, submission: &Submission, phase: PerfmonPhase) {
    for req in submission.perfmon().iter().filter(|r| r.phase == phase) {
        bus.write32(
            perfmon::SELECT,
            (u32::from(req.domain) << 8) | u32::from(req.signal),
        );
        let value = bus.read32(perfmon::VALUE);
        req.reading.value.store(value, Ordering::Release);
        trace!(domain = req.domain, signal = req.signal, value, ?phase, "perfmon sample");
    }
}

/// Pre sync point: ungate clocks and expose debug registers, then sample.
pub(crate) fn sample_pre(bus: &dyn RegisterBus, submission: &Submission) {
    bus.modify32(
        pm::POWER_CONTROLS,
        pm::POWER_CONTROLS_ENABLE_MODULE_CLOCK_GATING,
        0,
    );
    bus.modify32(
        hi::CLOCK_CONTROL,
        clock_control::DISABLE_DEBUG_REGISTERS,
        0,
    );
    sample(bus, submission, PerfmonPhase::Pre);
}

/// Post sync point: sample, publish sequence numbers, restore gating.
pub(crate) fn sample_post(bus: &dyn RegisterBus, submission: &Submission) {
    sample(bus, submission, PerfmonPhase::Post);
    for req in submission.perfmon() {
        req.reading.sequence.store(req.sequence, Ordering::Release);
    }
    bus.modify32(
        hi::CLOCK_CONTROL,
        0,
        clock_control::DISABLE_DEBUG_REGISTERS,
    );
    bus.modify32(
        pm::POWER_CONTROLS,
        0,
        pm::POWER_CONTROLS_ENABLE_MODULE_CLOCK_GATING,
    );
}
