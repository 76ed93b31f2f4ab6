//! In-memory stand-ins for the platform collaborators.
//!
//! [`SimulatedGpu`] models just enough of the register window for the reset,
//! interrupt and front-end paths: read-to-clear interrupt acknowledge, idle
//! reporting that reacts to reset pulses, and a log of every write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bus::RegisterBus;
use crate::device::GpuPlatform;
use crate::error::{GpuError, Result};
use crate::mmu::{AddressSpace, MmuContext};
use crate::power::{ClockSet, ClockSource, PowerDomain};
use crate::regs::{clock_control, fe, hi, mmu, perfmon, ChipFeatures, IntrAck, MinorFeatures0};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Identification register contents for a simulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipPreset {
    pub identity: u32,
    pub model: u32,
    pub revision: u32,
    pub date: u32,
    pub time: u32,
    pub customer_id: u32,
    pub product_id: u32,
    pub eco_id: u32,
    pub features: u32,
    pub minor0: u32,
    pub minor1: u32,
    pub minor2: u32,
    pub specs: u32,
}

impl ChipPreset {
    /// GC2000 rev 0x5108 (i.MX6Q class).
    pub fn gc2000() -> Self {
        Self {
            identity: 0,
            model: 0x2000,
            revision: 0x5108,
            date: 0x2011_1214,
            time: 0x1210_0000,
            customer_id: 0,
            product_id: 0,
            eco_id: 0,
            features: (ChipFeatures::PIPE_3D | ChipFeatures::PIPE_2D | ChipFeatures::FAST_CLEAR)
                .bits(),
            minor0: MinorFeatures0::MORE_MINOR_FEATURES.bits(),
            minor1: 0,
            minor2: 0,
            specs: 0x9241_0a64,
        }
    }

    /// GC7000 rev 0x6202, which needs extra gating disables.
    pub fn gc7000_6202() -> Self {
        Self {
            model: 0x7000,
            revision: 0x6202,
            date: 0x2016_0504,
            features: ChipFeatures::PIPE_3D.bits(),
            ..Self::gc2000()
        }
    }

    /// GC320 2D-only core.
    pub fn gc320() -> Self {
        Self {
            model: 0x0320,
            revision: 0x5007,
            features: ChipFeatures::PIPE_2D.bits(),
            specs: 0,
            ..Self::gc2000()
        }
    }
}

impl Default for ChipPreset {
    fn default() -> Self {
        Self::gc2000()
    }
}

#[derive(Debug)]
struct GpuRegs {
    regs: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    pending_intr: u32,
    idle: bool,
    idle_after_reset: bool,
    soft_resets: usize,
    ahb_resets: usize,
    fe_starts: Vec<(u32, u32)>,
    dma_address: u32,
    perfmon_select: u32,
    counters: HashMap<u32, u32>,
}

/// A register window backed by a map.
#[derive(Debug)]
pub struct SimulatedGpu {
    inner: Mutex<GpuRegs>,
}

impl SimulatedGpu {
    pub fn new(preset: ChipPreset) -> Self {
        let regs = HashMap::from([
            (hi::CHIP_IDENTITY, preset.identity),
            (hi::CHIP_MODEL, preset.model),
            (hi::CHIP_REV, preset.revision),
            (hi::CHIP_DATE, preset.date),
            (hi::CHIP_TIME, preset.time),
            (hi::CHIP_CUSTOMER_ID, preset.customer_id),
            (hi::CHIP_PRODUCT_ID, preset.product_id),
            (hi::CHIP_ECO_ID, preset.eco_id),
            (hi::CHIP_FEATURE, preset.features),
            (hi::CHIP_MINOR_FEATURE_0, preset.minor0),
            (hi::CHIP_MINOR_FEATURE_1, preset.minor1),
            (hi::CHIP_MINOR_FEATURE_2, preset.minor2),
            (hi::CHIP_SPECS, preset.specs),
        ]);
        Self {
            inner: Mutex::new(GpuRegs {
                regs,
                writes: Vec::new(),
                pending_intr: 0,
                idle: true,
                idle_after_reset: true,
                soft_resets: 0,
                ahb_resets: 0,
                fe_starts: Vec::new(),
                dma_address: 0,
                perfmon_select: 0,
                counters: HashMap::new(),
            }),
        }
    }

    /// Latches event bits into the interrupt acknowledge register.
    pub fn raise_events(&self, mask: u32) {
        lock(&self.inner).pending_intr |= mask & IntrAck::EVENT_VECTOR.bits();
    }

    pub fn raise_bus_error(&self, axi_status: u32) {
        let mut g = lock(&self.inner);
        g.regs.insert(hi::AXI_STATUS, axi_status);
        g.pending_intr |= IntrAck::AXI_BUS_ERROR.bits();
    }

    /// Reports a fault with reason `code` on MMU `index`.
    pub fn raise_mmu_fault(&self, index: u32, code: u32, address: u32) {
        let mut g = lock(&self.inner);
        let status = g.regs.get(&mmu::STATUS).copied().unwrap_or(0);
        let shift = index * 4;
        g.regs
            .insert(mmu::STATUS, (status & !(0xf << shift)) | ((code & 0xf) << shift));
        g.regs.insert(mmu::exception_addr(index), address);
        g.pending_intr |= IntrAck::MMU_EXCEPTION.bits();
    }

    pub fn set_idle(&self, idle: bool) {
        lock(&self.inner).idle = idle;
    }

    /// Whether a reset pulse leaves the core idle. Defaults to true.
    pub fn set_idle_after_reset(&self, idle: bool) {
        lock(&self.inner).idle_after_reset = idle;
    }

    pub fn soft_reset_count(&self) -> usize {
        lock(&self.inner).soft_resets
    }

    pub fn ahb_reset_count(&self) -> usize {
        lock(&self.inner).ahb_resets
    }

    /// Every `(address, control)` pair the FE was started with.
    pub fn fe_starts(&self) -> Vec<(u32, u32)> {
        lock(&self.inner).fe_starts.clone()
    }

    pub fn set_dma_address(&self, addr: u32) {
        lock(&self.inner).dma_address = addr;
    }

    pub fn set_perfmon_counter(&self, domain: u8, signal: u8, value: u32) {
        let select = (u32::from(domain) << 8) | u32::from(signal);
        lock(&self.inner).counters.insert(select, value);
    }

    /// Values written to `offset`, oldest first.
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        lock(&self.inner)
            .writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Stored value of `offset` without read side effects.
    pub fn peek(&self, offset: u32) -> u32 {
        lock(&self.inner).regs.get(&offset).copied().unwrap_or(0)
    }

    pub fn clear_write_log(&self) {
        lock(&self.inner).writes.clear();
    }
}

impl RegisterBus for SimulatedGpu {
    fn read32(&self, offset: u32) -> u32 {
        let mut g = lock(&self.inner);
        match offset {
            hi::INTR_ACKNOWLEDGE => std::mem::take(&mut g.pending_intr),
            hi::IDLE_STATE => {
                if g.idle {
                    0x7fff_ffff
                } else {
                    0x7fff_fffe
                }
            }
            hi::CLOCK_CONTROL => {
                let stored = g.regs.get(&offset).copied().unwrap_or(0);
                if g.idle {
                    stored | clock_control::IDLE_3D | clock_control::IDLE_2D | clock_control::IDLE_VG
                } else {
                    stored
                }
            }
            fe::DMA_ADDRESS => g.dma_address,
            perfmon::VALUE => {
                let select = g.perfmon_select;
                g.counters.get(&select).copied().unwrap_or(0)
            }
            _ => g.regs.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut g = lock(&self.inner);
        g.writes.push((offset, value));
        match offset {
            hi::CLOCK_CONTROL => {
                let idle_bits =
                    clock_control::IDLE_3D | clock_control::IDLE_2D | clock_control::IDLE_VG;
                let prev = g.regs.get(&offset).copied().unwrap_or(0);
                if value & clock_control::SOFT_RESET != 0 && prev & clock_control::SOFT_RESET == 0
                {
                    g.soft_resets += 1;
                    g.idle = g.idle_after_reset;
                }
                g.regs.insert(offset, value & !idle_bits);
            }
            mmu::AHB_CONTROL => {
                if value & mmu::AHB_CONTROL_RESET != 0 {
                    g.ahb_resets += 1;
                    g.idle = g.idle_after_reset;
                }
                g.regs.insert(offset, value);
            }
            fe::COMMAND_CONTROL => {
                if value & fe::COMMAND_CONTROL_ENABLE != 0 {
                    let addr = g.regs.get(&fe::COMMAND_ADDRESS).copied().unwrap_or(0);
                    g.fe_starts.push((addr, value));
                    g.dma_address = addr;
                }
                g.regs.insert(offset, value);
            }
            perfmon::SELECT => {
                g.perfmon_select = value;
                g.regs.insert(offset, value);
            }
            _ => {
                g.regs.insert(offset, value);
            }
        }
    }
}

/// Counting power domain.
#[derive(Debug, Default)]
pub struct SimPowerDomain {
    refs: AtomicUsize,
    resumes: AtomicUsize,
    fail: AtomicBool,
}

impl SimPowerDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PowerDomain for SimPowerDomain {
    fn resume(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GpuError::PowerUnavailable("power domain refused resume".into()));
        }
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.refs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SimClock {
    rate: AtomicU64,
    enabled: AtomicBool,
    fail_enable: AtomicBool,
    fail_set_rate: AtomicBool,
}

impl SimClock {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            enabled: AtomicBool::new(false),
            fail_enable: AtomicBool::new(false),
            fail_set_rate: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_set_rate(&self, fail: bool) {
        self.fail_set_rate.store(fail, Ordering::SeqCst);
    }
}

impl ClockSource for SimClock {
    fn enable(&self) -> Result<()> {
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(GpuError::Clock("clock refused enable".into()));
        }
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn set_rate(&self, hz: u64) -> Result<()> {
        if self.fail_set_rate.load(Ordering::SeqCst) {
            return Err(GpuError::Clock("clock refused rate".into()));
        }
        self.rate.store(hz, Ordering::SeqCst);
        Ok(())
    }

    fn rate(&self) -> u64 {
        self.rate.load(Ordering::SeqCst)
    }
}

/// Records which contexts are bound.
#[derive(Debug, Default)]
pub struct SimAddressSpace {
    bound: Mutex<Vec<u64>>,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    fail_bind: AtomicBool,
}

impl SimAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the currently bound contexts.
    pub fn bound(&self) -> Vec<u64> {
        lock(&self.bound).clone()
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }
}

impl AddressSpace for SimAddressSpace {
    fn bind(&self, context: &MmuContext) -> Result<()> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(GpuError::AddressSpace(format!(
                "cannot bind context {}",
                context.id()
            )));
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        lock(&self.bound).push(context.id());
        Ok(())
    }

    fn unbind(&self, context: &MmuContext) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        lock(&self.bound).retain(|id| *id != context.id());
    }
}

/// A full set of simulated collaborators sharing one register window.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    pub gpu: Arc<SimulatedGpu>,
    pub power: Arc<SimPowerDomain>,
    pub core_clock: Arc<SimClock>,
    pub shader_clock: Arc<SimClock>,
    pub mmu: Arc<SimAddressSpace>,
}

impl SimPlatform {
    pub fn new(preset: ChipPreset) -> Self {
        Self {
            gpu: Arc::new(SimulatedGpu::new(preset)),
            power: Arc::new(SimPowerDomain::new()),
            core_clock: Arc::new(SimClock::new(400_000_000)),
            shader_clock: Arc::new(SimClock::new(400_000_000)),
            mmu: Arc::new(SimAddressSpace::new()),
        }
    }

    pub fn platform(&self) -> GpuPlatform {
        GpuPlatform {
            bus: self.gpu.clone(),
            power: self.power.clone(),
            clocks: ClockSet {
                reg: None,
                bus: None,
                core: Some(self.core_clock.clone()),
                shader: Some(self.shader_clock.clone()),
            },
            address_space: self.mmu.clone(),
        }
    }
}
