//! Jitter buffer under scrambled arrivals: random delay, duplicates and loss.
use rand::{rngs::StdRng, Rng, SeedableRng};
use rtmix_rust::common::{
    audio_frame::AudioFrame,
    jitter_buffer::{JitterBuffer, PushResult},
};

/// the sequence number rides in the samples so the test can read it back
fn frame_for(seq: u32) -> AudioFrame {
    AudioFrame::capture(&[seq as f32; 64], None).unwrap()
}
fn seq_in(frame: &AudioFrame) -> u32 {
    frame.channel(0)[0] as u32
}

struct Schedule {
    /// packets landing on each tick, in arrival order
    arrivals: Vec<Vec<u32>>,
}

/// One packet per tick, each delayed 0..=max_delay ticks, some lost, some
/// sent twice.
fn schedule(rng: &mut StdRng, packets: u32, max_delay: usize, loss: f64, dups: f64) -> Schedule {
    let mut arrivals = vec![vec![]; packets as usize + max_delay * 2 + 2];
    for seq in 0..packets {
        if rng.gen_bool(loss) {
            continue;
        }
        let at = seq as usize + rng.gen_range(0..=max_delay);
        arrivals[at].push(seq);
        if rng.gen_bool(dups) {
            let again = seq as usize + rng.gen_range(0..=max_delay * 2);
            arrivals[again].push(seq);
        }
    }
    for tick in arrivals.iter_mut() {
        // same tick arrivals in any order
        let n = tick.len();
        for i in (1..n).rev() {
            tick.swap(i, rng.gen_range(0..=i));
        }
    }
    Schedule { arrivals }
}

#[test]
fn pops_are_unique_and_in_order() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let capacity = rng.gen_range(1..=12);
        let max_delay = rng.gen_range(0..capacity);
        let plan = schedule(&mut rng, 3000, max_delay, 0.02, 0.05);
        let (mut producer, mut consumer) = JitterBuffer::new(capacity).unwrap();
        let handle = consumer.handle();

        let mut played: Vec<u32> = vec![];
        let mut resets = 0;
        let mut last: Option<u32> = None;
        for tick in plan.arrivals.iter() {
            // the audio callback pops first, then the network catches up
            if let Some(frame) = consumer.pop() {
                let seq = seq_in(frame);
                let now_resets = handle.stats().resets;
                if now_resets == resets {
                    if let Some(prev) = last {
                        assert!(seq > prev, "seed {}: {} after {}", seed, seq, prev);
                    }
                }
                resets = now_resets;
                last = Some(seq);
                played.push(seq);
            }
            for seq in tick {
                let res = producer.push(*seq as u16, &frame_for(*seq));
                assert_ne!(res, PushResult::Closed);
            }
        }
        let mut unique = played.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), played.len(), "seed {}: a frame played twice", seed);

        let stats = handle.stats();
        assert_eq!(stats.played as usize, played.len());
        assert!(stats.played <= stats.stored);
        assert!(!played.is_empty(), "seed {}: nothing played", seed);
    }
}

#[test]
fn duplicates_never_play_twice() {
    let mut rng = StdRng::seed_from_u64(42);
    let (mut producer, mut consumer) = JitterBuffer::new(4).unwrap();
    let mut seen = std::collections::HashSet::new();
    for seq in 0..2000u32 {
        let copies = rng.gen_range(1..=3);
        for _ in 0..copies {
            producer.push(seq as u16, &frame_for(seq));
        }
        if let Some(frame) = consumer.pop() {
            assert!(seen.insert(seq_in(frame)));
        }
    }
    let stats = consumer.handle().stats();
    assert!(stats.duplicates > 0);
    assert_eq!(stats.played as usize, seen.len());
}
