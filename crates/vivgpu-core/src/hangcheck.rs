//! Detects a front end that stopped making progress and recovers it.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::device::CoreShared;
use crate::error::{GpuError, Result};
use crate::regs::fe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangStatus {
    /// Nothing in flight.
    Idle,
    /// Work is in flight and the completed counter or FE fetch address moved
    /// since the last check.
    Progressing,
    /// No progress across two checks; the core was recovered.
    Hung,
}

impl CoreShared {
    pub(crate) fn check_hang(&self) -> Result<HangStatus> {
        {
            let mut state = self.lock_state();
            if state.suspended || self.events.used_mask() == 0 {
                state.hang_sample = None;
                return Ok(HangStatus::Idle);
            }

            let sample = (self.timeline.completed(), self.bus.read32(fe::DMA_ADDRESS));
            if state.hang_sample != Some(sample) {
                state.hang_sample = Some(sample);
                return Ok(HangStatus::Progressing);
            }
        }

        self.stats.inc_hangs_detected();
        warn!(
            completed = self.timeline.completed(),
            in_flight = format_args!("{:#x}", self.events.used_mask()),
            "GPU hang detected"
        );
        self.recover()?;
        Ok(HangStatus::Hung)
    }
}

/// Background thread calling `check_hang` every `period`.
pub(crate) struct Watchdog {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn(shared: Weak<CoreShared>, period: Duration) -> Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("vivgpu-hangcheck".into())
                .spawn(move || watchdog_loop(shared, period, stop))
                .map_err(|err| GpuError::WorkerSpawn(err.to_string()))?
        };
        debug!(period_ms = period.as_millis() as u64, "hang check armed");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

fn watchdog_loop(shared: Weak<CoreShared>, period: Duration, stop: Arc<(Mutex<bool>, Condvar)>) {
    let (lock, cond) = &*stop;
    loop {
        {
            let mut stopped = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !*stopped {
                stopped = match cond.wait_timeout(stopped, period) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            if *stopped {
                return;
            }
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if let Err(err) = shared.check_hang() {
            error!(%err, "hang recovery failed");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let (lock, cond) = &*self.stop;
            let mut stopped = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *stopped = true;
            cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
