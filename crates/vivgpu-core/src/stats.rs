use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters for one GPU core.
///
/// Updated from the submission path, the interrupt handler and the recovery
/// path; every update is a single relaxed atomic add.
#[derive(Debug, Default)]
pub struct GpuStats {
    submissions: AtomicU64,
    submissions_rejected: AtomicU64,
    completions: AtomicU64,
    sync_points: AtomicU64,
    interrupts: AtomicU64,
    spurious_events: AtomicU64,
    double_releases: AtomicU64,
    bus_errors: AtomicU64,
    mmu_faults: AtomicU64,
    resets_attempted: AtomicU64,
    resets_failed: AtomicU64,
    recoveries: AtomicU64,
    forced_completions: AtomicU64,
    hangs_detected: AtomicU64,
}

impl GpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submissions_rejected(&self) {
        self.submissions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completions(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_points(&self) {
        self.sync_points.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_interrupts(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spurious_events(&self) {
        self.spurious_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_double_releases(&self) {
        self.double_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bus_errors(&self) {
        self.bus_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mmu_faults(&self) {
        self.mmu_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resets_attempted(&self) {
        self.resets_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resets_failed(&self) {
        self.resets_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recoveries(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_forced_completions(&self, n: u64) {
        self.forced_completions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_hangs_detected(&self) {
        self.hangs_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GpuStatsSnapshot {
        GpuStatsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            submissions_rejected: self.submissions_rejected.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            sync_points: self.sync_points.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            spurious_events: self.spurious_events.load(Ordering::Relaxed),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            mmu_faults: self.mmu_faults.load(Ordering::Relaxed),
            resets_attempted: self.resets_attempted.load(Ordering::Relaxed),
            resets_failed: self.resets_failed.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            forced_completions: self.forced_completions.load(Ordering::Relaxed),
            hangs_detected: self.hangs_detected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuStatsSnapshot {
    pub submissions: u64,
    pub submissions_rejected: u64,
    pub completions: u64,
    pub sync_points: u64,
    pub interrupts: u64,
    pub spurious_events: u64,
    pub double_releases: u64,
    pub bus_errors: u64,
    pub mmu_faults: u64,
    pub resets_attempted: u64,
    pub resets_failed: u64,
    pub recoveries: u64,
    pub forced_completions: u64,
    pub hangs_detected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = GpuStats::new();
        stats.inc_submissions();
        stats.inc_submissions();
        stats.inc_spurious_events();
        stats.add_forced_completions(3);

        let snap = stats.snapshot();
        assert_eq!(snap.submissions, 2);
        assert_eq!(snap.spurious_events, 1);
        assert_eq!(snap.forced_completions, 3);
        assert_eq!(snap.completions, 0);
    }
}
