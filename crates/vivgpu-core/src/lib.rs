//! Execution engine for Vivante-style GPU cores.
//!
//! [`GpuCore`] owns one core: it identifies the hardware, brings it out of
//! reset, queues command buffers on a ring the front end (FE) executes, and
//! turns completion interrupts into signaled [`Fence`]s. Every submission
//! holds one event slot (three when performance counters are sampled) and a
//! power-domain reference until its last slot completes.
//!
//! The platform supplies the register window, power domain, clocks and MMU
//! through the traits in [`GpuPlatform`]. The [`sim`] module has in-memory
//! versions of all of them.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use vivgpu_core::sim::{ChipPreset, SimPlatform};
//! use vivgpu_core::{CommandBuffer, ExecState, GpuCore, GpuCoreConfig, MmuContext};
//!
//! let sim = SimPlatform::new(ChipPreset::gc2000());
//! let core = GpuCore::new(sim.platform(), GpuCoreConfig::default()).unwrap();
//! let ctx = Arc::new(MmuContext::new(1, 0x10_0000));
//! let mut cmds = CommandBuffer::new(0x2000_0000, vec![0x1800_0000, 0]).unwrap();
//!
//! let fence = core
//!     .submit(&mut cmds, &ctx, ExecState::Pipe3d, Vec::new())
//!     .unwrap();
//! sim.gpu.raise_events(1 << 0);
//! core.handle_irq();
//! core.wait(&fence, Duration::from_secs(1)).unwrap();
//! ```

#![forbid(unsafe_code)]

mod bus;
mod config;
mod device;
mod error;
mod events;
mod fence;
mod hangcheck;
mod identity;
mod irq;
mod mmu;
mod perfmon;
mod power;
mod queue;
pub mod regs;
mod reset;
pub mod ring;
pub mod sim;
mod stats;
mod workqueue;

pub use bus::RegisterBus;
pub use config::{ConfigError, GpuCoreConfig, MAX_FREQ_SCALE};
pub use device::{GpuCore, GpuPlatform};
pub use error::{GpuError, Result};
pub use events::{EventSlotAllocator, SlotId, MAX_EVENTS};
pub use fence::{seqno_after, Fence, FenceSequencer, FenceTimeline};
pub use hangcheck::HangStatus;
pub use identity::{model, Capability, GpuIdentity, HardwareQuirks};
pub use irq::{FaultRecord, IrqReturn, MmuFault, MmuFaultReason};
pub use mmu::{AddressSpace, MmuContext};
pub use perfmon::{PerfmonPhase, PerfmonReading, PerfmonRequest};
pub use power::{fe_waitcycles_for, ClockPowerSequencer, ClockSet, ClockSource, PowerDomain, PowerRef};
pub use reset::{ResetController, ResetReport, ResetState};
pub use ring::{CommandBuffer, CommandRing, ExecState};
pub use stats::{GpuStats, GpuStatsSnapshot};
pub use workqueue::OrderedWorkQueue;
