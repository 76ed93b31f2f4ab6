//! Submission protocol: power, slots, fence, context, ring.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::{CoreShared, CoreState};
use crate::error::{GpuError, Result};
use crate::events::{SlotId, SlotState};
use crate::fence::{Fence, FenceTimeline};
use crate::mmu::MmuContext;
use crate::perfmon::{self, PerfmonRequest};
use crate::power::PowerRef;
use crate::ring::{CommandBuffer, ExecState};

/// One queued command buffer and everything it keeps alive until its last
/// event slot completes.
pub(crate) struct Submission {
    fence: Fence,
    pending: AtomicUsize,
    perfmon: Vec<PerfmonRequest>,
    exec_state: ExecState,
    _context: Arc<MmuContext>,
    _power: PowerRef,
}

impl Submission {
    pub(crate) fn perfmon(&self) -> &[PerfmonRequest] {
        &self.perfmon
    }

    pub(crate) fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Accounts for one finished slot. True when it was the last one.
    pub(crate) fn complete_slot(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Moves the counter past this fence and wakes waiters. Callbacks wait
    /// for [`Retirement::finish`].
    pub(crate) fn mark_completed(&self, timeline: &FenceTimeline) {
        timeline.advance(self.fence.seqno());
        timeline.wake_all();
    }
}

/// A completed slot's reference to its submission, finished off outside
/// interrupt context and outside the device lock.
///
/// Dropping the last reference releases the power reference and the MMU
/// context, so this never happens on the interrupt path.
#[derive(Debug)]
pub(crate) struct Retirement {
    pub(crate) submission: Arc<Submission>,
    /// Whether this was the submission's last outstanding slot.
    pub(crate) last: bool,
}

impl Retirement {
    pub(crate) fn finish(self) {
        if self.last {
            self.submission.fence.signal();
        }
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("seqno", &self.fence.seqno())
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("exec_state", &self.exec_state)
            .field("perfmon", &self.perfmon.len())
            .finish()
    }
}

impl CoreShared {
    pub(crate) fn submit(
        &self,
        cmdbuf: &mut CommandBuffer,
        context: &Arc<MmuContext>,
        exec_state: ExecState,
        perfmon: Vec<PerfmonRequest>,
    ) -> Result<Fence> {
        let power = match self.power.resume() {
            Ok(power) => power,
            Err(err) => {
                warn!(%err, "power resume failed");
                self.stats.inc_submissions_rejected();
                return Err(err);
            }
        };

        let nr_events = if perfmon.is_empty() { 1 } else { 3 };
        let slots = match self.events.acquire(nr_events, self.cfg.event_timeout) {
            Ok(slots) => slots,
            Err(err) => {
                self.stats.inc_submissions_rejected();
                return Err(err);
            }
        };

        let mut state = self.lock_state();
        let res = self.submit_locked(
            &mut state, &slots, cmdbuf, context, exec_state, perfmon, power,
        );
        drop(state);

        if res.is_err() {
            for &slot in &slots {
                let _ = self.events.release(slot);
            }
            self.stats.inc_submissions_rejected();
        }
        res
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_locked(
        &self,
        state: &mut CoreState,
        slots: &[SlotId],
        cmdbuf: &mut CommandBuffer,
        context: &Arc<MmuContext>,
        exec_state: ExecState,
        perfmon: Vec<PerfmonRequest>,
        power: PowerRef,
    ) -> Result<Fence> {
        if state.suspended {
            return Err(GpuError::PowerUnavailable("GPU suspended".into()));
        }
        if self.is_lost() {
            return Err(GpuError::DeviceLost);
        }

        let fence = state.sequencer.new_fence(&self.timeline);

        let switch_context = match &state.active_context {
            Some(active) => active.id() != context.id(),
            None => true,
        };
        if switch_context {
            self.mmu.bind(context).map_err(|err| match err {
                GpuError::AddressSpace(msg) => GpuError::AddressSpace(msg),
                other => GpuError::AddressSpace(other.to_string()),
            })?;
            if let Some(prev) = state.active_context.replace(Arc::clone(context)) {
                self.mmu.unbind(&prev);
            }
        }

        let waitcycles = self.power.fe_waitcycles();
        if !state.ring.is_running() {
            let prefetch = state.ring.reset(waitcycles);
            self.start_fe(state.ring.gpu_addr(), prefetch);
        }

        let submission = Arc::new(Submission {
            fence: fence.clone(),
            pending: AtomicUsize::new(slots.len()),
            perfmon,
            exec_state,
            _context: Arc::clone(context),
            _power: power,
        });

        // Slots are armed before the ring can raise any of their events.
        let sampled = slots.len() == 3;
        let exec_slot = slots[slots.len() / 2];
        if sampled {
            self.events.arm(
                slots[0],
                SlotState::sync_point(Arc::clone(&submission), perfmon::sample_pre),
            )?;
            self.events.arm(
                slots[2],
                SlotState::sync_point(Arc::clone(&submission), perfmon::sample_post),
            )?;
        }
        self.events
            .arm(exec_slot, SlotState::completion(submission))?;

        if sampled {
            state.ring.queue_sync_point(slots[0], waitcycles);
        }
        state
            .ring
            .queue_command_buffer(exec_state, switch_context, exec_slot, cmdbuf, waitcycles);
        if sampled {
            state.ring.queue_sync_point(slots[2], waitcycles);
        }

        self.stats.inc_submissions();
        debug!(seqno = fence.seqno(), ?slots, ?exec_state, "submitted");
        Ok(fence)
    }
}
