// src/types.rs
//
// Common shared types for the tapesim replay engine.

use serde::{Deserialize, Serialize};

/// Nanosecond timestamp. Within a replay this is the PCAP capture clock,
/// which is monotone across a whole capture and unambiguous for ordering.
pub type TimestampNs = u64;

/// Buy or sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Decode a raw XDP side byte. The feed uses both ASCII ('B'/'S') and
    /// numeric (1/2) encodings depending on gateway version.
    pub fn from_wire(raw: u8) -> Option<Side> {
        match raw {
            b'B' | 1 => Some(Side::Buy),
            b'S' | 2 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }
}

/// Fixed-point price in integer micro-dollars, used as the ladder key.
///
/// XDP prices decode from a u32 raw value times a power-of-ten multiplier,
/// so every observed price is exact in this representation and map keys
/// never suffer accumulated float error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Px(pub i64);

impl Px {
    pub const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

    /// Quantize a dollar price to the nearest micro-dollar.
    pub fn from_dollars(dollars: f64) -> Px {
        Px((dollars * Self::MICROS_PER_DOLLAR).round() as i64)
    }

    pub fn to_dollars(self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_DOLLAR
    }

    /// Whole cents part of the fractional dollar, in [0, 100).
    ///
    /// Used by the resistance-level classifier; negative prices do not
    /// occur on the feed.
    pub fn fractional_cents(self) -> i64 {
        (self.0.rem_euclid(1_000_000) + 5_000) / 10_000 % 100
    }

    /// True when the price carries significance past two decimal places.
    pub fn has_sub_cent_precision(self) -> bool {
        // Tolerance of 100 micro-dollars matches the feed's 0.0001 cutoff.
        let cents = ((self.0 as f64 / 10_000.0).round() as i64) * 10_000;
        (self.0 - cents).abs() > 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_from_wire_accepts_both_encodings() {
        assert_eq!(Side::from_wire(b'B'), Some(Side::Buy));
        assert_eq!(Side::from_wire(1), Some(Side::Buy));
        assert_eq!(Side::from_wire(b'S'), Some(Side::Sell));
        assert_eq!(Side::from_wire(2), Some(Side::Sell));
        assert_eq!(Side::from_wire(b'X'), None);
        assert_eq!(Side::from_wire(0), None);
    }

    #[test]
    fn px_round_trips_feed_prices() {
        // Raw XDP integer times 1e-6 is exact in micro-dollars.
        let p = Px::from_dollars(150_123_400u32 as f64 * 1e-6);
        assert_eq!(p, Px(150_123_400));
        assert!((p.to_dollars() - 150.1234).abs() < 1e-9);
    }

    #[test]
    fn fractional_cents_extracts_cents_part() {
        assert_eq!(Px::from_dollars(25.95).fractional_cents(), 95);
        assert_eq!(Px::from_dollars(25.01).fractional_cents(), 1);
        assert_eq!(Px::from_dollars(25.00).fractional_cents(), 0);
        assert_eq!(Px::from_dollars(103.99).fractional_cents(), 99);
    }

    #[test]
    fn sub_cent_precision_detection() {
        assert!(!Px::from_dollars(10.25).has_sub_cent_precision());
        assert!(Px::from_dollars(10.2501).has_sub_cent_precision());
        assert!(Px::from_dollars(10.255).has_sub_cent_precision());
        assert!(!Px::from_dollars(10.0).has_sub_cent_precision());
    }
}
