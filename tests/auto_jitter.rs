//! Auto sizing in a closed loop: a jittery sender, the buffer, the estimator.
use rand::{rngs::StdRng, Rng, SeedableRng};
use rtmix_rust::common::{
    audio_frame::{AudioFrame, FrameSize},
    delay_estimator::{DelayEstimator, EstimatorConfig},
    jitter_buffer::{JitterBuffer, PushResult},
};

struct Run {
    /// (tick, new capacity) for every change the estimator asked for
    changes: Vec<(usize, usize)>,
    final_capacity: usize,
    evaluations: usize,
}

/// Every packet is sent on time and shows up somewhere within
/// `max_jitter_frames` frame periods.
fn simulate(seed: u64, max_jitter_frames: f64, seconds: u32, start_capacity: usize) -> Run {
    let mut rng = StdRng::seed_from_u64(seed);
    let size = FrameSize::Samples128;
    let period = size.period_us();
    let ticks = (seconds as f64 * 1_000_000.0 / period) as usize;

    let mut arrivals: Vec<(u128, u16)> = (0..ticks)
        .map(|seq| {
            let jitter = rng.gen_range(0.0..=max_jitter_frames * period);
            ((seq as f64 * period + jitter) as u128, seq as u16)
        })
        .collect();
    arrivals.sort();

    let config = EstimatorConfig {
        frame_size: size,
        ..Default::default()
    };
    let eval_us = config.eval_interval_us;
    let mut estimator = DelayEstimator::new(config);
    let (mut producer, mut consumer) = JitterBuffer::new(start_capacity).unwrap();
    let handle = consumer.handle();
    let frame = AudioFrame::silent(size, 1);

    let mut changes = vec![];
    let mut next = 0;
    for tick in 0..ticks {
        let now = (tick as f64 * period) as u128;
        while next < arrivals.len() && arrivals[next].0 <= now {
            let (at, seq) = arrivals[next];
            if let PushResult::Stored | PushResult::OutOfWindow = producer.push(seq, &frame) {
                estimator.add_arrival(at, seq);
            }
            next += 1;
        }
        consumer.pop();
        let current = handle.capacity();
        if let Some(cap) = estimator.evaluate(now, current, handle.stats().underruns) {
            handle.request_capacity(cap).unwrap();
            changes.push((tick, cap));
        }
    }
    Run {
        changes,
        final_capacity: handle.capacity(),
        evaluations: (seconds as u128 * 1_000_000 / eval_us) as usize,
    }
}

#[test]
fn grows_to_cover_the_jitter_then_holds() {
    for seed in 0..5 {
        let run = simulate(seed, 2.5, 40, 1);
        assert!(run.evaluations >= 19);
        assert!(!run.changes.is_empty(), "seed {}: never adjusted", seed);
        // two and a half frames of jitter need 3 frames plus one of safety
        assert!(
            (3..=5).contains(&run.final_capacity),
            "seed {}: ended at {}",
            seed,
            run.final_capacity
        );
        // converged within the first few evaluations and left alone after
        let (last_tick, _) = *run.changes.last().unwrap();
        let period = FrameSize::Samples128.period_us();
        let last_s = last_tick as f64 * period / 1_000_000.0;
        assert!(last_s < 12.0, "seed {}: still changing at {:.1}s", seed, last_s);
        assert!(run.changes.len() <= 4, "seed {}: {:?}", seed, run.changes);
    }
}

#[test]
fn smooth_network_shrinks_an_oversized_buffer() {
    let run = simulate(7, 0.2, 30, 10);
    assert!(!run.changes.is_empty());
    assert!(run.final_capacity <= 2, "ended at {}", run.final_capacity);
    // never bounces back up
    let mut caps = vec![10];
    caps.extend(run.changes.iter().map(|(_, c)| *c));
    assert!(caps.windows(2).all(|w| w[1] < w[0]), "{:?}", caps);
}
