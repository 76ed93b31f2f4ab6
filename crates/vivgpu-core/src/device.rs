use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::RegisterBus;
use crate::config::GpuCoreConfig;
use crate::error::{GpuError, Result};
use crate::events::EventSlotAllocator;
use crate::fence::{Fence, FenceSequencer, FenceTimeline};
use crate::hangcheck::{HangStatus, Watchdog};
use crate::identity::{Capability, GpuIdentity, HardwareQuirks};
use crate::irq::{CoreWork, FaultRecord, IrqReturn};
use crate::mmu::{AddressSpace, MmuContext};
use crate::perfmon::PerfmonRequest;
use crate::power::{ClockPowerSequencer, ClockSet, PowerDomain};
use crate::regs::{fe, hi, IdleState};
use crate::ring::{CommandBuffer, CommandRing, ExecState};
use crate::stats::{GpuStats, GpuStatsSnapshot};
use crate::workqueue::OrderedWorkQueue;

/// Collaborators a [`GpuCore`] is built from.
#[derive(Clone)]
pub struct GpuPlatform {
    pub bus: Arc<dyn RegisterBus>,
    pub power: Arc<dyn PowerDomain>,
    pub clocks: ClockSet,
    pub address_space: Arc<dyn AddressSpace>,
}

/// State serialized by the device lock.
pub(crate) struct CoreState {
    pub(crate) sequencer: FenceSequencer,
    pub(crate) ring: CommandRing,
    pub(crate) active_context: Option<Arc<MmuContext>>,
    /// `(completed seqno, FE DMA address)` at the previous hang check.
    pub(crate) hang_sample: Option<(u32, u32)>,
    pub(crate) suspended: bool,
}

/// Everything shared between callers, the interrupt path, the ordered
/// worker and the hang-check thread.
pub(crate) struct CoreShared {
    pub(crate) bus: Arc<dyn RegisterBus>,
    pub(crate) cfg: GpuCoreConfig,
    pub(crate) identity: GpuIdentity,
    pub(crate) quirks: HardwareQuirks,
    pub(crate) power: Arc<ClockPowerSequencer>,
    pub(crate) mmu: Arc<dyn AddressSpace>,
    pub(crate) events: EventSlotAllocator,
    pub(crate) timeline: Arc<FenceTimeline>,
    pub(crate) state: Mutex<CoreState>,
    pub(crate) stats: Arc<GpuStats>,
    pub(crate) last_fault: spin::Mutex<Option<FaultRecord>>,
    lost: AtomicBool,
}

impl CoreShared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::Release);
    }

    /// Points the FE at `addr` and starts fetching `prefetch` 64-bit words.
    pub(crate) fn start_fe(&self, addr: u32, prefetch: u16) {
        self.bus.write32(fe::COMMAND_ADDRESS, addr);
        self.bus.write32(
            fe::COMMAND_CONTROL,
            fe::COMMAND_CONTROL_ENABLE | u32::from(prefetch),
        );
        debug!(addr = format_args!("{addr:#x}"), prefetch, "FE started");
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mask = self.identity.idle_mask;
        loop {
            let idle = IdleState::from_bits_retain(self.bus.read32(hi::IDLE_STATE));
            if idle.contains(mask) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    idle = format_args!("{:#x}", idle.bits()),
                    busy = format_args!("{:#x}", (mask - idle).bits()),
                    "timed out waiting for idle"
                );
                return Err(GpuError::TimedOut);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

/// One Vivante-style GPU core: submission, completion, recovery.
pub struct GpuCore {
    // Field order is drop order: stop the threads before the shared state goes.
    hangcheck: Option<Watchdog>,
    worker: OrderedWorkQueue<CoreWork>,
    shared: Arc<CoreShared>,
}

impl GpuCore {
    /// Powers the core up, identifies it and brings it out of reset.
    pub fn new(platform: GpuPlatform, cfg: GpuCoreConfig) -> Result<Self> {
        cfg.validate()?;

        let power = Arc::new(ClockPowerSequencer::new(
            platform.power,
            platform.clocks,
            cfg.freq_scale,
        ));
        power.enable_clocks()?;

        let identity = GpuIdentity::probe(&*platform.bus);
        let quirks = HardwareQuirks::for_identity(&identity);
        let stats = Arc::new(GpuStats::new());
        let timeline = Arc::new(FenceTimeline::new(0));

        let shared = Arc::new(CoreShared {
            events: EventSlotAllocator::new(cfg.event_slots, Arc::clone(&stats))?,
            state: Mutex::new(CoreState {
                sequencer: FenceSequencer::new(timeline.completed()),
                ring: CommandRing::new(cfg.ring_gpu_addr, cfg.ring_words),
                active_context: None,
                hang_sample: None,
                suspended: false,
            }),
            bus: platform.bus,
            cfg,
            identity,
            quirks,
            power: Arc::clone(&power),
            mmu: platform.address_space,
            timeline,
            stats,
            last_fault: spin::Mutex::new(None),
            lost: AtomicBool::new(false),
        });

        if let Err(err) = shared.hw_reset() {
            power.disable_clocks();
            return Err(err);
        }

        let worker = {
            let shared = Arc::clone(&shared);
            OrderedWorkQueue::new("vivgpu-retire", move |work: CoreWork| shared.run_work(work))?
        };
        let hangcheck = match shared.cfg.hangcheck_period {
            Some(period) => Some(Watchdog::spawn(Arc::downgrade(&shared), period)?),
            None => None,
        };

        info!(
            model = format_args!("GC{:x}", shared.identity.model),
            event_slots = shared.cfg.event_slots,
            "GPU core initialized"
        );
        Ok(Self {
            hangcheck,
            worker,
            shared,
        })
    }

    /// Queues `cmdbuf` on the ring. The returned fence signals once every
    /// event slot of the submission completed or was force-completed.
    pub fn submit(
        &self,
        cmdbuf: &mut CommandBuffer,
        context: &Arc<MmuContext>,
        exec_state: ExecState,
        perfmon: Vec<PerfmonRequest>,
    ) -> Result<Fence> {
        self.shared.submit(cmdbuf, context, exec_state, perfmon)
    }

    pub fn wait(&self, fence: &Fence, timeout: Duration) -> Result<()> {
        fence.wait(timeout)
    }

    /// Resets the hardware and resolves every in-flight fence with
    /// [`GpuError::ForcedCompletion`] (or [`GpuError::DeviceLost`] if the reset
    /// itself failed).
    pub fn recover(&self) -> Result<()> {
        self.shared.recover()
    }

    pub fn get_capability(&self, cap: Capability) -> u64 {
        self.shared.identity.capability(cap)
    }

    /// Interrupt entry point.
    pub fn handle_irq(&self) -> IrqReturn {
        self.shared.handle_irq(&self.worker)
    }

    pub fn check_hang(&self) -> Result<HangStatus> {
        self.shared.check_hang()
    }

    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        self.shared.wait_idle(timeout)
    }

    /// Stops the FE and gates the clocks. Refused while work is in flight.
    pub fn suspend(&self) -> Result<()> {
        let mut state = self.shared.lock_state();
        if state.suspended {
            return Ok(());
        }
        if self.shared.events.used_mask() != 0 {
            return Err(GpuError::Busy);
        }

        state.ring.end_loop();
        // Only the FE can still be busy here; the WAIT is short.
        let idle = self.shared.wait_idle(Duration::from_millis(100));
        if let Err(err) = &idle {
            warn!(%err, "GPU not idle at suspend");
        }

        if let Some(context) = state.active_context.take() {
            self.shared.mmu.unbind(&context);
        }
        state.ring.invalidate();
        state.hang_sample = None;
        self.shared.power.disable_clocks();
        state.suspended = true;
        info!("GPU suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.shared.lock_state();
        if !state.suspended {
            return Ok(());
        }
        self.shared.power.enable_clocks()?;
        self.shared.hw_init();
        state.suspended = false;
        info!("GPU resumed");
        Ok(())
    }

    /// Changes the frequency scale (0 = full speed) and applies it.
    pub fn set_freq_scale(&self, scale: u32) -> Result<()> {
        let state = self.shared.lock_state();
        self.shared.power.set_freq_scale(scale)?;
        if !state.suspended {
            self.shared
                .power
                .update_clock(&*self.shared.bus, self.shared.identity.has_dynamic_scaling())?;
        }
        Ok(())
    }

    pub fn identity(&self) -> &GpuIdentity {
        &self.shared.identity
    }

    pub fn stats(&self) -> GpuStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn last_fault(&self) -> Option<FaultRecord> {
        *self.shared.last_fault.lock()
    }

    /// Highest fence sequence number known complete.
    pub fn completed_seqno(&self) -> u32 {
        self.shared.timeline.completed()
    }

    /// Bitmap of event slots currently in use.
    pub fn in_flight_slots(&self) -> u32 {
        self.shared.events.used_mask()
    }

    pub fn free_slots(&self) -> usize {
        self.shared.events.free_count()
    }

    pub fn fe_waitcycles(&self) -> u32 {
        self.shared.power.fe_waitcycles()
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.lock_state().suspended
    }
}

impl std::fmt::Debug for GpuCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuCore")
            .field("identity", &self.shared.identity)
            .field("events", &self.shared.events)
            .field("completed", &self.shared.timeline.completed())
            .field("lost", &self.shared.is_lost())
            .finish()
    }
}
