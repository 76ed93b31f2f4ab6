use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use vivgpu_core::ring::cmd;
use vivgpu_core::sim::{ChipPreset, SimPlatform};
use vivgpu_core::{
    seqno_after, CommandBuffer, ExecState, FenceTimeline, GpuCore, GpuCoreConfig, MmuContext,
    PerfmonPhase, PerfmonReading, PerfmonRequest,
};

fn completion_order() -> impl Strategy<Value = (u32, Vec<u32>)> {
    (
        any::<u32>(),
        prop::collection::vec(0u32..(1 << 20), 1..32).prop_shuffle(),
    )
}

proptest! {
    #[test]
    fn counter_ends_at_newest_seqno((start, offsets) in completion_order()) {
        let timeline = FenceTimeline::new(start);
        let mut previous = start;
        for off in &offsets {
            timeline.advance(start.wrapping_add(1).wrapping_add(*off));
            let now = timeline.completed();
            prop_assert!(!seqno_after(previous, now));
            previous = now;
        }
        let newest = start.wrapping_add(1).wrapping_add(*offsets.iter().max().unwrap());
        prop_assert_eq!(timeline.completed(), newest);
    }
}

fn wait_slot_free(core: &GpuCore, slot: u32) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while core.in_flight_slots() & (1 << slot) != 0 {
        assert!(Instant::now() < deadline, "slot {slot} never released");
        thread::sleep(Duration::from_millis(1));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn sampled_submission_signals_exactly_once(order in Just(vec![0u32, 1, 2]).prop_shuffle()) {
        let sim = SimPlatform::new(ChipPreset::gc2000());
        let core = GpuCore::new(sim.platform(), GpuCoreConfig::default()).unwrap();
        let ctx = Arc::new(MmuContext::new(1, 0x10_0000));
        let reading = PerfmonReading::new();
        let mut cmds = CommandBuffer::new(0x2000_0000, vec![cmd::OP_NOP, 0]).unwrap();
        let fence = core
            .submit(
                &mut cmds,
                &ctx,
                ExecState::Pipe3d,
                vec![PerfmonRequest {
                    phase: PerfmonPhase::Post,
                    domain: 0,
                    signal: 0,
                    sequence: 1,
                    reading,
                }],
            )
            .unwrap();

        let signals = Arc::new(AtomicUsize::new(0));
        {
            let signals = signals.clone();
            fence.on_signal(move |_| {
                signals.fetch_add(1, Ordering::SeqCst);
            });
        }

        for (delivered, slot) in order.iter().enumerate() {
            prop_assert_eq!(signals.load(Ordering::SeqCst), 0);
            sim.gpu.raise_events(1 << slot);
            core.handle_irq();
            wait_slot_free(&core, *slot);
            if delivered < 2 {
                prop_assert!(!fence.is_signaled());
            }
        }

        prop_assert_eq!(fence.wait(Duration::from_secs(1)), Ok(()));
        // Callbacks run on the worker after the counter has moved.
        let deadline = Instant::now() + Duration::from_secs(2);
        while signals.load(Ordering::SeqCst) == 0 {
            prop_assert!(Instant::now() < deadline, "callback never ran");
            thread::sleep(Duration::from_millis(1));
        }
        // Nothing left to force-complete; the fence stays as it is.
        core.recover().unwrap();
        prop_assert_eq!(signals.load(Ordering::SeqCst), 1);
        prop_assert_eq!(fence.error(), None);
    }
}
