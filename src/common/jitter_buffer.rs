//! Sequence indexed jitter buffer between the network thread and the audio clock.
//!
//! One buffer per audio stream.  The network thread owns the [`JitterProducer`]
//! and pushes frames as they arrive, in whatever order they arrive.  The audio
//! callback owns the [`JitterConsumer`] and pops exactly one frame per tick.
//! Neither side ever blocks the other: every slot carries an atomic state word
//! and ownership of the frame storage moves between the two halves by
//! compare-and-swap on that word.
//!
//! The ring always has [`MAX_CAPACITY`] physical slots.  The configured
//! capacity only sets the acceptance window `[read, read + capacity)`, so a
//! capacity change never moves memory.  It is applied by the consumer as a
//! drain-and-reset: the buffer empties and then fills again.
//!
//! Delay through the buffer is exactly `capacity` ticks when the callback pops
//! at the start of its tick.  A frame that arrives during tick `t` is played
//! at tick `t + capacity`.
//!
//! The window follows the earliest arrivals.  Playback starts with the newest
//! frame at the back of the window, and a frame that shows up past the back
//! of a running window moves the window forward (the consumer skips ahead at
//! its next pop).  So a late or lost frame while filling never leaves the
//! cursor trailing the sender.
use serde::Serialize;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::audio_frame::AudioFrame;
use super::delay_estimator::DropoutWindow;
use super::jam_error::CapacityError;

pub const MIN_CAPACITY: usize = 1;
/// Physical slot count.  Has to divide 65536 so sequence wrap lands on the
/// same slot.
pub const MAX_CAPACITY: usize = 64;
pub const DEFAULT_CAPACITY: usize = 4;
/// ticks in the sliding dropout window
pub const DEFAULT_DROPOUT_WINDOW: usize = 1000;
/// this many out of window packets in a row means the sender jumped
const RESYNC_AFTER: u32 = 24;

const EMPTY: u32 = 0;
const WRITING: u32 = 1;
const FULL: u32 = 2;
const READING: u32 = 3;

/// read cursor flag: the next accepted push sets the cursor
const UNSYNCED: u32 = 1 << 16;
/// read cursor flag: filling is over, the consumer moves the cursor
const PRIMED: u32 = 1 << 17;
/// skip request flag, the low 16 bits are where the cursor should be
const SKIP_PENDING: u32 = 1 << 16;

fn pack(state: u32, seq: u16) -> u32 {
    (state << 16) | seq as u32
}
fn state_of(word: u32) -> u32 {
    word >> 16
}
fn seq_of(word: u32) -> u16 {
    (word & 0xFFFF) as u16
}
fn slot_index(seq: u16) -> usize {
    seq as usize % MAX_CAPACITY
}

/// What happened to a pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Stored,
    /// a frame with this sequence number is already waiting
    Duplicate,
    /// too old (already played or skipped) or too far ahead
    OutOfWindow,
    Closed,
}

struct Slot {
    state: AtomicU32,
    frame: UnsafeCell<AudioFrame>,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    duplicates: AtomicU64,
    out_of_window: AtomicU64,
    underruns: AtomicU64,
    played: AtomicU64,
    skipped: AtomicU64,
    resets: AtomicU64,
    window_dropouts: AtomicUsize,
    window_ticks: AtomicUsize,
}

struct Shared {
    slots: Box<[Slot]>,
    /// next sequence to play in the low 16 bits, plus UNSYNCED / PRIMED
    read: AtomicU32,
    /// set by the producer, applied by the consumer at its next pop
    skip_to: AtomicU32,
    capacity: AtomicUsize,
    /// 0 when there is no request outstanding
    pending_capacity: AtomicUsize,
    resync: AtomicBool,
    closed: AtomicBool,
    counters: Counters,
}

// The frame cells are only touched by the side that won the slot's state
// word: the producer between WRITING and FULL, the consumer between READING
// and EMPTY.
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }
    fn is_filling(&self) -> bool {
        let cursor = self.read.load(Ordering::Acquire);
        cursor & UNSYNCED != 0 || cursor & PRIMED == 0
    }
}

/// Snapshot of the buffer counters, published as part of the status JSON
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JitterStats {
    pub capacity: usize,
    pub fill: usize,
    pub filling: bool,
    pub stored: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    pub underruns: u64,
    pub played: u64,
    /// ticks jumped over when the window moved forward
    pub skipped: u64,
    pub resets: u64,
    pub window_dropouts: usize,
    pub window_ticks: usize,
}

impl JitterStats {
    /// fraction of the last window's ticks that came up empty
    pub fn dropout_rate(&self) -> f64 {
        if self.window_ticks == 0 {
            return 0.0;
        }
        self.window_dropouts as f64 / self.window_ticks as f64
    }
    /// how full the acceptance window is, 0.0 .. 1.0
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.fill as f64 / self.capacity as f64).min(1.0)
    }
}

impl fmt::Display for JitterStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ cap: {}, fill: {}, played: {}, underruns: {}, dups: {}, oow: {}, drops: {}/{} }}",
            self.capacity,
            self.fill,
            self.played,
            self.underruns,
            self.duplicates,
            self.out_of_window,
            self.window_dropouts,
            self.window_ticks
        )
    }
}

pub struct JitterBuffer {}

impl JitterBuffer {
    /// Build a buffer and split it into its two halves
    pub fn new(capacity: usize) -> Result<(JitterProducer, JitterConsumer), CapacityError> {
        Self::with_window(capacity, DEFAULT_DROPOUT_WINDOW)
    }
    pub fn with_window(
        capacity: usize,
        dropout_window: usize,
    ) -> Result<(JitterProducer, JitterConsumer), CapacityError> {
        check_capacity(capacity)?;
        let slots: Vec<Slot> = (0..MAX_CAPACITY)
            .map(|_| Slot {
                state: AtomicU32::new(pack(EMPTY, 0)),
                frame: UnsafeCell::new(AudioFrame::default()),
            })
            .collect();
        let shared = Arc::new(Shared {
            slots: slots.into_boxed_slice(),
            read: AtomicU32::new(UNSYNCED),
            skip_to: AtomicU32::new(0),
            capacity: AtomicUsize::new(capacity),
            pending_capacity: AtomicUsize::new(0),
            resync: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });
        Ok((
            JitterProducer {
                shared: shared.clone(),
                misses: 0,
            },
            JitterConsumer {
                shared: shared,
                current: AudioFrame::default(),
                dropouts: DropoutWindow::new(dropout_window),
            },
        ))
    }
}

fn check_capacity(capacity: usize) -> Result<(), CapacityError> {
    if capacity < MIN_CAPACITY || capacity > MAX_CAPACITY {
        return Err(CapacityError {
            requested: capacity,
            min: MIN_CAPACITY,
            max: MAX_CAPACITY,
        });
    }
    Ok(())
}

/// Network side of the buffer.  Not `Clone`: there is exactly one writer.
pub struct JitterProducer {
    shared: Arc<Shared>,
    misses: u32,
}

impl JitterProducer {
    pub fn push(&mut self, seq: u16, frame: &AudioFrame) -> PushResult {
        let shared = &*self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return PushResult::Closed;
        }
        let capacity = shared.capacity();
        let cursor = match self.anchor(seq) {
            Some(c) => c,
            None => return PushResult::Closed,
        };
        let offset = seq.wrapping_sub(cursor as u16) as usize;
        if offset >= 0x8000 {
            // behind the window: already played or skipped
            return self.miss();
        }
        if offset >= MAX_CAPACITY {
            // sender jumped further ahead than the ring reaches
            shared.counters.out_of_window.fetch_add(1, Ordering::Relaxed);
            shared.resync.store(true, Ordering::Release);
            self.misses = 0;
            return PushResult::OutOfWindow;
        }
        self.misses = 0;

        let slot = &shared.slots[slot_index(seq)];
        let word = slot.state.load(Ordering::Acquire);
        let result = match state_of(word) {
            EMPTY => self.write_slot(slot, word, seq, frame),
            FULL if seq_of(word) != seq => {
                // left over from an earlier lap that the reader skipped
                self.write_slot(slot, word, seq, frame)
            }
            _ if seq_of(word) == seq => PushResult::Duplicate,
            // reader is busy with this slot
            _ => PushResult::OutOfWindow,
        };
        match result {
            PushResult::Stored => {
                shared.counters.stored.fetch_add(1, Ordering::Relaxed);
                if offset + 1 >= capacity {
                    self.settle(cursor, seq, capacity);
                }
            }
            PushResult::Duplicate => {
                shared.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            PushResult::OutOfWindow => {
                shared.counters.out_of_window.fetch_add(1, Ordering::Relaxed);
            }
            PushResult::Closed => (),
        }
        result
    }

    /// `seq` was stored at or past the back of the window: make it the back.
    fn settle(&self, cursor: u32, seq: u16, capacity: usize) {
        let start = seq.wrapping_sub(capacity as u16 - 1);
        if cursor & PRIMED == 0 {
            // the consumer leaves a filling cursor alone, so only a reset can
            // beat us here and then the exchange fails, which is what we want
            if self
                .shared
                .read
                .compare_exchange(
                    cursor,
                    start as u32 | PRIMED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // whatever was stored before the new start will never play
                let mut old = cursor as u16;
                while old != start {
                    let slot = &self.shared.slots[slot_index(old)];
                    let _ = slot.state.compare_exchange(
                        pack(FULL, old),
                        pack(EMPTY, old),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    old = old.wrapping_add(1);
                }
            }
        } else if start != cursor as u16 {
            self.shared
                .skip_to
                .store(start as u32 | SKIP_PENDING, Ordering::Release);
        }
    }

    fn miss(&mut self) -> PushResult {
        self.shared
            .counters
            .out_of_window
            .fetch_add(1, Ordering::Relaxed);
        self.misses += 1;
        if self.misses >= RESYNC_AFTER {
            self.misses = 0;
            self.shared.resync.store(true, Ordering::Release);
        }
        PushResult::OutOfWindow
    }

    /// current read cursor, setting it to `seq` if the buffer was reset
    fn anchor(&self, seq: u16) -> Option<u32> {
        let read = &self.shared.read;
        loop {
            let cur = read.load(Ordering::Acquire);
            if cur & UNSYNCED == 0 {
                return Some(cur);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            if read
                .compare_exchange(cur, seq as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(seq as u32);
            }
        }
    }

    fn write_slot(&self, slot: &Slot, seen: u32, seq: u16, frame: &AudioFrame) -> PushResult {
        if slot
            .state
            .compare_exchange(seen, pack(WRITING, seq), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the reader got there first (discarded or took it)
            return PushResult::OutOfWindow;
        }
        // SAFETY: we hold the slot in WRITING, the reader won't touch the cell
        unsafe {
            *slot.frame.get() = *frame;
        }
        slot.state.store(pack(FULL, seq), Ordering::Release);
        PushResult::Stored
    }

    pub fn handle(&self) -> JitterHandle {
        JitterHandle {
            shared: self.shared.clone(),
        }
    }
}

/// Audio callback side of the buffer
pub struct JitterConsumer {
    shared: Arc<Shared>,
    current: AudioFrame,
    dropouts: DropoutWindow,
}

impl JitterConsumer {
    /// Take the frame for this tick.  Never blocks.
    ///
    /// Returns None while the buffer is filling (not counted) or when the
    /// expected frame is missing (an underrun).  Either way the caller plays
    /// silence.
    pub fn pop(&mut self) -> Option<&AudioFrame> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        let pending = self.shared.pending_capacity.swap(0, Ordering::AcqRel);
        if pending != 0 && pending != self.shared.capacity() {
            self.reset(pending);
        }
        if self.shared.resync.swap(false, Ordering::AcqRel) {
            self.reset(self.shared.capacity());
        }

        let shared = &*self.shared;
        let cursor = shared.read.load(Ordering::Acquire);
        if cursor & UNSYNCED != 0 || cursor & PRIMED == 0 {
            return None;
        }
        let seq = self.skip_ahead(cursor as u16);
        let slot = &shared.slots[slot_index(seq)];
        let word = slot.state.load(Ordering::Acquire);
        let mut got = false;
        if word == pack(FULL, seq) {
            if slot
                .state
                .compare_exchange(word, pack(READING, seq), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: READING keeps the producer off the cell
                self.current = unsafe { *slot.frame.get() };
                slot.state.store(pack(EMPTY, seq), Ordering::Release);
                got = true;
            }
        } else if state_of(word) == FULL {
            // stale frame from an earlier lap, nobody will ever want it
            let _ = slot.state.compare_exchange(
                word,
                pack(EMPTY, seq_of(word)),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        // only the consumer moves a primed cursor
        shared
            .read
            .store(seq.wrapping_add(1) as u32 | PRIMED, Ordering::Release);

        self.dropouts.record(!got);
        shared
            .counters
            .window_dropouts
            .store(self.dropouts.count(), Ordering::Relaxed);
        shared
            .counters
            .window_ticks
            .store(self.dropouts.len(), Ordering::Relaxed);
        if got {
            shared.counters.played.fetch_add(1, Ordering::Relaxed);
            Some(&self.current)
        } else {
            shared.counters.underruns.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Apply a pending skip request.  Frames jumped over are dropped.
    fn skip_ahead(&self, read: u16) -> u16 {
        let request = self.shared.skip_to.swap(0, Ordering::AcqRel);
        if request & SKIP_PENDING == 0 {
            return read;
        }
        let target = request as u16;
        let ahead = target.wrapping_sub(read) as usize;
        if ahead == 0 || ahead >= MAX_CAPACITY {
            // stale request, the cursor already got there
            return read;
        }
        let mut seq = read;
        while seq != target {
            let slot = &self.shared.slots[slot_index(seq)];
            let _ = slot.state.compare_exchange(
                pack(FULL, seq),
                pack(EMPTY, seq),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            seq = seq.wrapping_add(1);
        }
        self.shared
            .counters
            .skipped
            .fetch_add(ahead as u64, Ordering::Relaxed);
        target
    }

    /// drain everything and start filling again at `capacity`
    fn reset(&mut self, capacity: usize) {
        let shared = &*self.shared;
        shared.capacity.store(capacity, Ordering::Release);
        shared.skip_to.store(0, Ordering::Release);
        shared.read.store(UNSYNCED, Ordering::Release);
        for slot in shared.slots.iter() {
            let word = slot.state.load(Ordering::Acquire);
            if state_of(word) == FULL {
                let _ = slot.state.compare_exchange(
                    word,
                    pack(EMPTY, seq_of(word)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
        shared.counters.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle(&self) -> JitterHandle {
        JitterHandle {
            shared: self.shared.clone(),
        }
    }
}

/// Shared view of a buffer for stats and control.  Any thread can hold one.
#[derive(Clone)]
pub struct JitterHandle {
    shared: Arc<Shared>,
}

impl JitterHandle {
    /// Ask for a new capacity.  Applied (with a reset) at the next pop.
    pub fn request_capacity(&self, capacity: usize) -> Result<(), CapacityError> {
        check_capacity(capacity)?;
        self.shared
            .pending_capacity
            .store(capacity, Ordering::Release);
        Ok(())
    }
    /// capacity in effect, or the pending one if a change is outstanding
    pub fn capacity(&self) -> usize {
        match self.shared.pending_capacity.load(Ordering::Acquire) {
            0 => self.shared.capacity(),
            n => n,
        }
    }
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
    /// Drain and refill at the next pop, for a stream that starts over (a
    /// new connection numbers its frames from scratch).  A buffer that never
    /// started has nothing to drain.
    pub fn reset(&self) {
        let cursor = self.shared.read.load(Ordering::Acquire);
        if cursor & UNSYNCED != 0 && self.fill() == 0 {
            return;
        }
        self.shared.resync.store(true, Ordering::Release);
    }
    pub fn is_filling(&self) -> bool {
        self.shared.is_filling()
    }
    /// frames waiting to be played
    pub fn fill(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|s| state_of(s.state.load(Ordering::Relaxed)) == FULL)
            .count()
    }
    pub fn stats(&self) -> JitterStats {
        let c = &self.shared.counters;
        JitterStats {
            capacity: self.shared.capacity(),
            fill: self.fill(),
            filling: self.is_filling(),
            stored: c.stored.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            out_of_window: c.out_of_window.load(Ordering::Relaxed),
            underruns: c.underruns.load(Ordering::Relaxed),
            played: c.played.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            resets: c.resets.load(Ordering::Relaxed),
            window_dropouts: c.window_dropouts.load(Ordering::Relaxed),
            window_ticks: c.window_ticks.load(Ordering::Relaxed),
        }
    }
}
