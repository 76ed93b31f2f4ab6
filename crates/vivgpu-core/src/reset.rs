//! Hardware reset state machine and hang recovery.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::bus::RegisterBus;
use crate::device::CoreShared;
use crate::error::{GpuError, Result};
use crate::events::SlotState;
use crate::identity::GpuIdentity;
use crate::power::load_clock;
use crate::queue::Retirement;
use crate::regs::{clock_control, hi, mmu, pm, ChipFeatures, IdleState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    ClockEnable,
    Isolate,
    SecureAhbReset,
    SoftResetPulse,
    DeIsolate,
    IdleCheck,
    Retry,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Drives one reset attempt sequence until the core reports idle or the
/// deadline passes. Every retry starts over from `ClockEnable`.
pub struct ResetController<'a> {
    bus: &'a dyn RegisterBus,
    features: ChipFeatures,
    secure_mode: bool,
    timeout: Duration,
    pulse_delay: Duration,
    fscale: u32,
    state: ResetState,
    attempts: u32,
}

impl<'a> ResetController<'a> {
    pub fn new(
        bus: &'a dyn RegisterBus,
        identity: &GpuIdentity,
        secure_mode: bool,
        timeout: Duration,
        pulse_delay: Duration,
        fscale: u32,
    ) -> Self {
        Self {
            bus,
            features: identity.features,
            secure_mode,
            timeout,
            pulse_delay,
            fscale,
            state: ResetState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    pub fn run(&mut self) -> Result<ResetReport> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut control = 0;
        let mut idle = 0;
        let mut clock = 0;

        loop {
            let next = match self.state {
                ResetState::Idle => ResetState::ClockEnable,
                ResetState::ClockEnable => {
                    self.attempts += 1;
                    control = clock_control::DISABLE_DEBUG_REGISTERS
                        | clock_control::fscale_val(self.fscale);
                    load_clock(self.bus, control);
                    ResetState::Isolate
                }
                ResetState::Isolate => {
                    control |= clock_control::ISOLATE_GPU;
                    self.bus.write32(hi::CLOCK_CONTROL, control);
                    if self.secure_mode {
                        ResetState::SecureAhbReset
                    } else {
                        ResetState::SoftResetPulse
                    }
                }
                ResetState::SecureAhbReset => {
                    self.bus.write32(mmu::AHB_CONTROL, mmu::AHB_CONTROL_RESET);
                    std::thread::sleep(self.pulse_delay);
                    ResetState::DeIsolate
                }
                ResetState::SoftResetPulse => {
                    self.bus
                        .write32(hi::CLOCK_CONTROL, control | clock_control::SOFT_RESET);
                    std::thread::sleep(self.pulse_delay);
                    self.bus.write32(hi::CLOCK_CONTROL, control);
                    ResetState::DeIsolate
                }
                ResetState::DeIsolate => {
                    control &= !clock_control::ISOLATE_GPU;
                    self.bus.write32(hi::CLOCK_CONTROL, control);
                    ResetState::IdleCheck
                }
                ResetState::IdleCheck => {
                    idle = self.bus.read32(hi::IDLE_STATE);
                    clock = self.bus.read32(hi::CLOCK_CONTROL);
                    if self.is_idle(idle, clock) {
                        ResetState::Success
                    } else {
                        trace!(
                            idle = format_args!("{idle:#x}"),
                            clock = format_args!("{clock:#x}"),
                            "GPU not idle after reset pulse"
                        );
                        ResetState::Retry
                    }
                }
                ResetState::Retry => {
                    if Instant::now() >= deadline {
                        ResetState::Failed
                    } else {
                        ResetState::ClockEnable
                    }
                }
                ResetState::Success => {
                    return Ok(ResetReport {
                        attempts: self.attempts,
                        elapsed: start.elapsed(),
                    });
                }
                ResetState::Failed => {
                    return Err(GpuError::ResetFailed { idle, clock });
                }
            };
            self.state = next;
        }
    }

    fn is_idle(&self, idle: u32, clock: u32) -> bool {
        if !IdleState::from_bits_retain(idle).contains(IdleState::FE) {
            return false;
        }
        if self.features.contains(ChipFeatures::PIPE_3D) && clock & clock_control::IDLE_3D == 0 {
            return false;
        }
        if self.features.contains(ChipFeatures::PIPE_2D) && clock & clock_control::IDLE_2D == 0 {
            return false;
        }
        true
    }
}

impl CoreShared {
    /// Resets the core and, on success, reprograms clocks, gating and the
    /// interrupt mask.
    pub(crate) fn hw_reset(&self) -> Result<()> {
        self.stats.inc_resets_attempted();
        let mut controller = ResetController::new(
            &*self.bus,
            &self.identity,
            self.cfg.secure_mode,
            self.cfg.reset_timeout,
            self.cfg.reset_pulse_delay,
            self.power.fscale(),
        );
        match controller.run() {
            Ok(report) => {
                info!(
                    attempts = report.attempts,
                    elapsed_us = report.elapsed.as_micros() as u64,
                    "GPU reset complete"
                );
                self.hw_init();
                Ok(())
            }
            Err(err) => {
                self.stats.inc_resets_failed();
                error!(%err, "GPU reset failed");
                Err(err)
            }
        }
    }

    /// Post-reset programming. A clock that refuses its new rate leaves the
    /// old one running; gating and the interrupt mask are applied regardless.
    pub(crate) fn hw_init(&self) {
        if let Err(err) = self
            .power
            .update_clock(&*self.bus, self.identity.has_dynamic_scaling())
        {
            warn!(%err, "clock update after reset failed");
        }

        self.bus
            .modify32(pm::POWER_CONTROLS, 0, pm::POWER_CONTROLS_ENABLE_MODULE_CLOCK_GATING);
        self.bus
            .modify32(pm::MODULE_CONTROLS, 0, self.quirks.gating_disable.bits());

        self.bus.write32(hi::INTR_ENBL, !0);
    }

    /// Resets the hardware and force-completes everything in flight.
    pub(crate) fn recover(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.suspended {
            return Err(GpuError::PowerUnavailable("GPU suspended".into()));
        }
        self.stats.inc_recoveries();

        let fault = *self.last_fault.lock();
        warn!(
            completed = self.timeline.completed(),
            issued = state.sequencer.last_issued(),
            in_flight = format_args!("{:#x}", self.events.used_mask()),
            ?fault,
            "recovering GPU"
        );

        let reset = self.hw_reset();
        let fence_error = match reset {
            Ok(()) => GpuError::ForcedCompletion,
            Err(_) => GpuError::DeviceLost,
        };

        let drained = self.events.drain_armed();
        let forced = drained.len();
        let mut retired = Vec::with_capacity(forced);
        for (slot, slot_state) in drained {
            if let (Some(callback), Some(submission)) =
                (slot_state.sync_point, slot_state.submission.as_ref())
            {
                callback(&*self.bus, submission);
                self.stats.inc_sync_points();
            }
            debug!(slot, "event slot force-completed");
            if let Some(retirement) = self.take_forced(slot_state) {
                retired.push(retirement);
            }
        }
        self.stats.add_forced_completions(forced as u64);

        // Every error lands before the counter moves: a newer fence in a lower
        // slot would otherwise pass an older one that never ran.
        for retirement in retired.iter().filter(|r| r.last) {
            retirement.submission.fence().set_error(fence_error.clone());
        }
        for retirement in retired.iter().filter(|r| r.last) {
            retirement.submission.mark_completed(&self.timeline);
        }

        if let Some(context) = state.active_context.take() {
            self.mmu.unbind(&context);
        }
        state.ring.invalidate();
        state.hang_sample = None;

        let result = match reset {
            Ok(()) => {
                self.set_lost(false);
                info!(forced, "GPU recovered");
                Ok(())
            }
            Err(err) => {
                self.set_lost(true);
                error!(forced, "GPU lost after failed recovery");
                Err(err)
            }
        };
        drop(state);

        for retirement in retired {
            retirement.finish();
        }
        result
    }

    /// Slot accounting for a drained slot, without touching the counter.
    fn take_forced(&self, slot_state: SlotState) -> Option<Retirement> {
        let submission = slot_state.submission?;
        self.stats.inc_completions();
        let last = submission.complete_slot();
        Some(Retirement { submission, last })
    }
}
