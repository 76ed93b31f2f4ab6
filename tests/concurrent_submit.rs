//! Many submitters racing an interrupt thread on one core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vivgpu_core::ring::cmd;
use vivgpu_core::sim::{ChipPreset, SimPlatform};
use vivgpu_core::{
    CommandBuffer, ExecState, GpuCore, GpuCoreConfig, GpuError, MmuContext, PerfmonPhase,
    PerfmonReading, PerfmonRequest,
};

const SUBMITTERS: u64 = 4;
const PER_THREAD: usize = 50;

#[test]
fn every_fence_resolves_under_contention() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let sim = SimPlatform::new(ChipPreset::gc2000());
    let core = Arc::new(
        GpuCore::new(
            sim.platform(),
            GpuCoreConfig {
                event_slots: 6,
                event_timeout: Duration::from_secs(5),
                ..GpuCoreConfig::default()
            },
        )
        .unwrap(),
    );
    let done = Arc::new(AtomicBool::new(false));

    // Stands in for the hardware: completes whatever is in flight.
    let irq = {
        let core = core.clone();
        let gpu = sim.gpu.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let in_flight = core.in_flight_slots();
                if in_flight != 0 {
                    gpu.raise_events(in_flight);
                    core.handle_irq();
                }
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|t| {
            let core = core.clone();
            thread::spawn(move || {
                // Alternate contexts so binds interleave with submissions.
                let ctx = Arc::new(MmuContext::new(t % 2, 0x10_0000 * (t + 1)));
                let mut fences = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let perfmon = if i % 5 == 0 {
                        vec![PerfmonRequest {
                            phase: PerfmonPhase::Pre,
                            domain: 1,
                            signal: 1,
                            sequence: i as u32,
                            reading: PerfmonReading::new(),
                        }]
                    } else {
                        Vec::new()
                    };
                    let mut cmds =
                        CommandBuffer::new(0x2000_0000, vec![cmd::OP_NOP, 0]).unwrap();
                    fences.push(
                        core.submit(&mut cmds, &ctx, ExecState::Pipe3d, perfmon)
                            .unwrap(),
                    );
                }
                fences
            })
        })
        .collect();

    let fences: Vec<_> = submitters
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    for fence in &fences {
        match fence.wait(Duration::from_secs(5)) {
            Ok(()) | Err(GpuError::ForcedCompletion) => {}
            Err(err) => panic!("fence {} failed: {err}", fence.seqno()),
        }
    }
    done.store(true, Ordering::Release);
    irq.join().unwrap();

    let mut seqnos: Vec<u32> = fences.iter().map(|f| f.seqno()).collect();
    seqnos.sort_unstable();
    seqnos.dedup();
    assert_eq!(seqnos.len(), fences.len());
    assert_eq!(core.completed_seqno(), fences.len() as u32);
    assert_eq!(core.in_flight_slots(), 0);
    // The worker may still be dropping the last submission.
    let deadline = Instant::now() + Duration::from_secs(2);
    while sim.power.refs() != 0 {
        assert!(Instant::now() < deadline, "power references leaked");
        thread::sleep(Duration::from_millis(1));
    }
}
