//! [`IntentSlot`] – single-slot, last-writer-wins handoff from the cognition
//! layer to the actuator loop.
//!
//! Both axes are packed into one `AtomicU64` (`throttle` bits high, `steer`
//! bits low), so a reader always sees a pair written together and neither
//! side ever blocks.  There is no queue: a newer intent overwrites the older
//! one whether or not it was ever read.

use std::sync::atomic::{AtomicU64, Ordering};

use trustgate_types::Intent;

/// Never produced by a clamped intent (both halves would be NaN).
const UNSET: u64 = u64::MAX;

#[derive(Debug)]
pub struct IntentSlot {
    bits: AtomicU64,
}

impl Default for IntentSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentSlot {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(UNSET),
        }
    }

    /// Overwrite the slot.  The intent is clamped on the way in.
    pub fn store(&self, intent: Intent) {
        self.bits.store(pack(intent.clamped()), Ordering::Release);
    }

    /// The newest intent, or `None` if nothing was ever stored.
    pub fn latest(&self) -> Option<Intent> {
        match self.bits.load(Ordering::Acquire) {
            UNSET => None,
            bits => Some(unpack(bits)),
        }
    }

    /// The newest intent, neutral if nothing was ever stored.
    pub fn load(&self) -> Intent {
        self.latest().unwrap_or(Intent::NEUTRAL)
    }

    /// Forget the stored intent so the loop falls back to neutral.
    pub fn clear(&self) {
        self.bits.store(UNSET, Ordering::Release);
    }
}

fn pack(intent: Intent) -> u64 {
    (u64::from(intent.throttle.to_bits()) << 32) | u64::from(intent.steer.to_bits())
}

fn unpack(bits: u64) -> Intent {
    Intent {
        throttle: f32::from_bits((bits >> 32) as u32),
        steer: f32::from_bits(bits as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_slot_reads_neutral() {
        let slot = IntentSlot::new();
        assert_eq!(slot.latest(), None);
        assert_eq!(slot.load(), Intent::NEUTRAL);
    }

    #[test]
    fn newest_write_wins() {
        let slot = IntentSlot::new();
        slot.store(Intent::new(0.2, 0.1));
        slot.store(Intent::new(0.9, -0.4));
        assert_eq!(slot.load(), Intent::new(0.9, -0.4));
        slot.clear();
        assert_eq!(slot.latest(), None);
    }

    #[test]
    fn stores_are_clamped_and_nan_safe() {
        let slot = IntentSlot::new();
        slot.store(Intent::new(3.0, f32::NAN));
        assert_eq!(slot.load(), Intent::new(1.0, 0.0));
        slot.store(Intent::new(f32::NAN, f32::NAN));
        assert_eq!(slot.latest(), Some(Intent::NEUTRAL));
    }

    #[test]
    fn readers_never_see_torn_pairs() {
        let slot = Arc::new(IntentSlot::new());
        let writer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for i in 0..10_000 {
                    let v = if i % 2 == 0 { 0.25 } else { 0.75 };
                    slot.store(Intent::new(v, v));
                }
            })
        };
        for _ in 0..10_000 {
            if let Some(i) = slot.latest() {
                assert_eq!(i.throttle, i.steer);
            }
        }
        writer.join().unwrap();
    }
}
