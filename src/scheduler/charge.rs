//! Request charge accumulator
//!
//! Fetch completions add their charge from many tasks; the consumer reads and
//! resets it once per page. The `f64` lives in an `AtomicU64` as raw bits.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free accumulator of request charge
#[derive(Debug, Default)]
pub struct RequestChargeTracker {
    bits: AtomicU64,
}

impl RequestChargeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a charge; negative and non-finite charges are ignored
    pub fn add_charge(&self, charge: f64) {
        if !charge.is_finite() || charge <= 0.0 {
            return;
        }
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some((f64::from_bits(bits) + charge).to_bits())
        });
    }

    /// Charge accumulated so far
    pub fn total(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Read the accumulated charge and reset it to zero in one step
    pub fn get_and_reset(&self) -> f64 {
        f64::from_bits(self.bits.swap(0.0f64.to_bits(), Ordering::AcqRel))
    }
}
