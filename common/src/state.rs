use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Volatile per-boot state shared between the button interrupt and the main
/// loop.
///
/// The interrupt only ever increments `pending` and stores `last_activity_ms`.
/// The main loop is the single consumer of `pending` and the only writer of
/// `in_flight`. Everything is 32 bits wide so it stays lock-free on 32-bit
/// targets; timestamps wrap and are compared with wrapping arithmetic.
#[derive(Debug)]
pub struct DeviceState {
    pending: AtomicU32,
    in_flight: AtomicBool,
    last_activity_ms: AtomicU32,
}

impl DeviceState {
    pub fn new(now_ms: u32) -> Self {
        Self {
            pending: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            last_activity_ms: AtomicU32::new(now_ms),
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Queues one press. Returns the new pending count.
    pub fn push_press(&self) -> u32 {
        self.pending
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    /// Removes one queued press if there is one.
    pub fn take_press(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claims the single dispatch slot. Returns `false` if it is already taken.
    pub fn begin_flight(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_flight(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn touch(&self, now_ms: u32) {
        self.last_activity_ms.store(now_ms, Ordering::Release);
    }

    pub fn last_activity_ms(&self) -> u32 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    /// Time since the last activity. An activity stamp that is newer than
    /// `now_ms` (written by the interrupt after `now_ms` was sampled) counts
    /// as no idle time at all.
    pub fn idle_for(&self, now_ms: u32) -> u32 {
        let elapsed = now_ms.wrapping_sub(self.last_activity_ms());
        if elapsed > u32::MAX / 2 {
            0
        } else {
            elapsed
        }
    }
}
