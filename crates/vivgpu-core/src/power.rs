//! Power-domain references and clock sequencing.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::RegisterBus;
use crate::config::MAX_FREQ_SCALE;
use crate::error::{GpuError, Result};
use crate::regs::{clock_control, hi};

/// Reference-counted power domain of the GPU (runtime PM on a real platform).
pub trait PowerDomain: Send + Sync {
    fn resume(&self) -> Result<()>;
    fn release(&self);
}

/// One gateable, optionally rate-programmable clock.
pub trait ClockSource: Send + Sync {
    fn enable(&self) -> Result<()>;
    fn disable(&self);
    fn set_rate(&self, hz: u64) -> Result<()>;
    fn rate(&self) -> u64;
}

/// The clocks feeding one GPU core. Any of them may be absent on a given SoC.
#[derive(Clone, Default)]
pub struct ClockSet {
    pub reg: Option<Arc<dyn ClockSource>>,
    pub bus: Option<Arc<dyn ClockSource>>,
    pub core: Option<Arc<dyn ClockSource>>,
    pub shader: Option<Arc<dyn ClockSource>>,
}

impl ClockSet {
    fn in_enable_order(&self) -> [(&'static str, Option<&Arc<dyn ClockSource>>); 4] {
        [
            ("reg", self.reg.as_ref()),
            ("bus", self.bus.as_ref()),
            ("core", self.core.as_ref()),
            ("shader", self.shader.as_ref()),
        ]
    }
}

impl std::fmt::Debug for ClockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSet")
            .field("reg", &self.reg.is_some())
            .field("bus", &self.bus.is_some())
            .field("core", &self.core.is_some())
            .field("shader", &self.shader.is_some())
            .finish()
    }
}

/// Sequences the GPU's power domain and clocks and owns the frequency scale.
pub struct ClockPowerSequencer {
    domain: Arc<dyn PowerDomain>,
    clocks: ClockSet,
    base_rate_core: u64,
    base_rate_shader: u64,
    freq_scale: AtomicU32,
    fe_waitcycles: AtomicU32,
    outstanding: AtomicUsize,
}

impl ClockPowerSequencer {
    pub fn new(domain: Arc<dyn PowerDomain>, clocks: ClockSet, freq_scale: u32) -> Self {
        let base_rate_core = clocks.core.as_ref().map_or(0, |c| c.rate());
        let base_rate_shader = clocks.shader.as_ref().map_or(0, |c| c.rate());
        let freq_scale = freq_scale.min(MAX_FREQ_SCALE);
        Self {
            domain,
            clocks,
            base_rate_core,
            base_rate_shader,
            freq_scale: AtomicU32::new(freq_scale),
            fe_waitcycles: AtomicU32::new(fe_waitcycles_for(base_rate_core, freq_scale)),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Takes a power-domain reference for the lifetime of the returned guard.
    pub fn resume(self: &Arc<Self>) -> Result<PowerRef> {
        self.domain.resume().map_err(|err| match err {
            GpuError::PowerUnavailable(msg) => GpuError::PowerUnavailable(msg),
            other => GpuError::PowerUnavailable(other.to_string()),
        })?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PowerRef {
            seq: Arc::clone(self),
        })
    }

    /// Number of live [`PowerRef`] guards.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Enables reg, bus, core and shader clocks in that order. A failure
    /// disables whatever was already enabled.
    pub fn enable_clocks(&self) -> Result<()> {
        let clocks = self.clocks.in_enable_order();
        for (idx, (name, clk)) in clocks.iter().enumerate() {
            let Some(clk) = clk else { continue };
            if let Err(err) = clk.enable() {
                warn!(clock = name, %err, "clock enable failed");
                for (_, prev) in clocks[..idx].iter().rev() {
                    if let Some(prev) = prev {
                        prev.disable();
                    }
                }
                return Err(match err {
                    GpuError::Clock(msg) => GpuError::Clock(msg),
                    other => GpuError::Clock(format!("{name}: {other}")),
                });
            }
        }
        Ok(())
    }

    pub fn disable_clocks(&self) {
        for (_, clk) in self.clocks.in_enable_order().iter().rev() {
            if let Some(clk) = clk {
                clk.disable();
            }
        }
    }

    pub fn freq_scale(&self) -> u32 {
        self.freq_scale.load(Ordering::Relaxed)
    }

    pub fn set_freq_scale(&self, scale: u32) -> Result<()> {
        if scale > MAX_FREQ_SCALE {
            return Err(GpuError::InvalidConfig("freq_scale"));
        }
        self.freq_scale.store(scale, Ordering::Relaxed);
        Ok(())
    }

    /// Value of the FSCALE field for the current scale: full speed is 64.
    pub fn fscale(&self) -> u32 {
        1 << (MAX_FREQ_SCALE - self.freq_scale())
    }

    /// WAIT delay used by the front-end idle loop.
    pub fn fe_waitcycles(&self) -> u32 {
        self.fe_waitcycles.load(Ordering::Relaxed)
    }

    /// Applies the current frequency scale to the hardware.
    ///
    /// Cores with dynamic frequency scaling get their clock rates divided;
    /// older cores get the FSCALE divider loaded through `CLOCK_CONTROL`.
    pub fn update_clock(&self, bus: &dyn RegisterBus, dynamic_scaling: bool) -> Result<()> {
        let scale = self.freq_scale();
        if dynamic_scaling {
            if let Some(core) = &self.clocks.core {
                core.set_rate(self.base_rate_core >> scale)?;
            }
            if let Some(shader) = &self.clocks.shader {
                shader.set_rate(self.base_rate_shader >> scale)?;
            }
        } else {
            let mut clock = bus.read32(hi::CLOCK_CONTROL);
            clock &= !clock_control::FSCALE_VAL_MASK;
            clock |= clock_control::fscale_val(self.fscale());
            load_clock(bus, clock);
        }

        let cycles = fe_waitcycles_for(self.base_rate_core, scale);
        self.fe_waitcycles.store(cycles, Ordering::Relaxed);
        debug!(scale, fe_waitcycles = cycles, dynamic_scaling, "clock updated");
        Ok(())
    }
}

impl std::fmt::Debug for ClockPowerSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockPowerSequencer")
            .field("clocks", &self.clocks)
            .field("base_rate_core", &self.base_rate_core)
            .field("freq_scale", &self.freq_scale())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Writes `CLOCK_CONTROL` with the FSCALE load strobe, then without it.
pub(crate) fn load_clock(bus: &dyn RegisterBus, clock: u32) {
    bus.write32(hi::CLOCK_CONTROL, clock | clock_control::FSCALE_CMD_LOAD);
    bus.write32(hi::CLOCK_CONTROL, clock);
}

/// Targets roughly 30us (1/32768 s) of idle-loop latency. An unknown base rate
/// yields the 200-cycle floor.
pub fn fe_waitcycles_for(base_rate_core: u64, freq_scale: u32) -> u32 {
    let shift = 15 - freq_scale.min(MAX_FREQ_SCALE);
    (base_rate_core >> shift).clamp(200, 0xffff) as u32
}

/// Keeps the power domain resumed until dropped.
#[must_use = "dropping the guard releases the power domain"]
pub struct PowerRef {
    seq: Arc<ClockPowerSequencer>,
}

impl Drop for PowerRef {
    fn drop(&mut self) {
        self.seq.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.seq.domain.release();
    }
}

impl std::fmt::Debug for PowerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerRef").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimPowerDomain, SimulatedGpu};

    fn clocks(core: &Arc<SimClock>, shader: &Arc<SimClock>) -> ClockSet {
        ClockSet {
            reg: None,
            bus: None,
            core: Some(core.clone()),
            shader: Some(shader.clone()),
        }
    }

    #[test]
    fn waitcycles_are_clamped() {
        assert_eq!(fe_waitcycles_for(0, 0), 200);
        assert_eq!(fe_waitcycles_for(800_000_000, 0), 0xffff);
        assert_eq!(fe_waitcycles_for(10_000_000, 6), 10_000_000 >> 9);
        assert_eq!(fe_waitcycles_for(100_000_000, 2), 100_000_000 >> 13);
    }

    #[test]
    fn power_ref_releases_domain_on_drop() {
        let domain = Arc::new(SimPowerDomain::new());
        let seq = Arc::new(ClockPowerSequencer::new(
            domain.clone(),
            ClockSet::default(),
            0,
        ));
        let a = seq.resume().unwrap();
        let b = seq.resume().unwrap();
        assert_eq!(domain.refs(), 2);
        assert_eq!(seq.outstanding(), 2);
        drop(a);
        assert_eq!(domain.refs(), 1);
        drop(b);
        assert_eq!(domain.refs(), 0);
        assert_eq!(seq.outstanding(), 0);
    }

    #[test]
    fn failed_resume_reports_power_unavailable() {
        let domain = Arc::new(SimPowerDomain::new());
        domain.set_fail(true);
        let seq = Arc::new(ClockPowerSequencer::new(
            domain.clone(),
            ClockSet::default(),
            0,
        ));
        assert!(matches!(seq.resume(), Err(GpuError::PowerUnavailable(_))));
        assert_eq!(seq.outstanding(), 0);
    }

    #[test]
    fn clock_enable_rolls_back_on_failure() {
        let core = Arc::new(SimClock::new(400_000_000));
        let shader = Arc::new(SimClock::new(400_000_000));
        shader.set_fail_enable(true);
        let seq = ClockPowerSequencer::new(
            Arc::new(SimPowerDomain::new()),
            clocks(&core, &shader),
            0,
        );
        assert!(matches!(seq.enable_clocks(), Err(GpuError::Clock(_))));
        assert!(!core.is_enabled());
        assert!(!shader.is_enabled());
    }

    #[test]
    fn fscale_load_without_dynamic_scaling() {
        let gpu = SimulatedGpu::new(Default::default());
        let seq = ClockPowerSequencer::new(Arc::new(SimPowerDomain::new()), ClockSet::default(), 0);
        seq.set_freq_scale(2).unwrap();
        seq.update_clock(&gpu, false).unwrap();

        let writes = gpu.writes_to(hi::CLOCK_CONTROL);
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0] & clock_control::FSCALE_CMD_LOAD, 0);
        assert_eq!(writes[1] & clock_control::FSCALE_CMD_LOAD, 0);
        assert_eq!(
            writes[1] & clock_control::FSCALE_VAL_MASK,
            clock_control::fscale_val(16)
        );
    }

    #[test]
    fn dynamic_scaling_divides_clock_rates() {
        let core = Arc::new(SimClock::new(800_000_000));
        let shader = Arc::new(SimClock::new(600_000_000));
        let gpu = SimulatedGpu::new(Default::default());
        let seq = ClockPowerSequencer::new(
            Arc::new(SimPowerDomain::new()),
            clocks(&core, &shader),
            0,
        );
        seq.set_freq_scale(1).unwrap();
        seq.update_clock(&gpu, true).unwrap();
        assert_eq!(core.rate(), 400_000_000);
        assert_eq!(shader.rate(), 300_000_000);
        assert!(gpu.writes_to(hi::CLOCK_CONTROL).is_empty());
        assert_eq!(seq.fe_waitcycles(), 800_000_000 >> 14);
    }

    #[test]
    fn out_of_range_scale_is_rejected() {
        let seq = ClockPowerSequencer::new(Arc::new(SimPowerDomain::new()), ClockSet::default(), 0);
        assert_eq!(
            seq.set_freq_scale(7),
            Err(GpuError::InvalidConfig("freq_scale"))
        );
        assert_eq!(seq.fscale(), 64);
    }
}
