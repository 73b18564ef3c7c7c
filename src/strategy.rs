// src/strategy.rs
//
// Two-sided market-making strategy. Two instances coexist per symbol and
// consume the same book snapshots: `baseline` quotes a fixed spread,
// `toxicity` widens with the average level toxicity, tilts on order-book
// imbalance, and suppresses quoting entirely when flow looks informed or
// the expected edge is gone.
//
// Position accounting realizes PnL on the closing portion of every fill
// and flips the remainder through zero at the fill price, so realized PnL
// is path-deterministic given the fill sequence.

use serde::{Deserialize, Serialize};

use crate::book::BookSnapshot;

/// Levels per side considered when averaging toxicity.
pub const TOXICITY_LEVELS: usize = 3;

/// Expected-PnL floor below which the toxicity strategy stops quoting.
pub const MIN_EXPECTED_PNL: f64 = 0.0005;

/// A two-sided quote emitted by `update_market_data`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quote {
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_size: u32,
    pub ask_size: u32,
    pub is_quoted: bool,
}

/// Cumulative per-strategy statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_fills: i64,
    pub buy_fills: i64,
    pub sell_fills: i64,
    pub total_volume_traded: u64,
    pub avg_fill_price_buy: f64,
    pub avg_fill_price_sell: f64,
    pub max_inventory: f64,
    pub min_inventory: f64,
    pub quotes_suppressed: i64,
}

impl StrategyStats {
    pub fn total_pnl(&self) -> f64 {
        self.realized_pnl + self.unrealized_pnl
    }
}

/// Market-maker strategy state and parameters.
///
/// Parameter defaults are the elite-HFT calibration: penny spreads at the
/// NBBO, large size, very gentle skew, and a high suppression threshold.
#[derive(Debug, Clone)]
pub struct MarketMakerStrategy {
    use_toxicity_screen: bool,

    inventory: i64,
    realized_pnl: f64,
    unrealized_pnl: f64,
    avg_entry_price: f64,
    fee_per_share: f64,

    current_quote: Quote,
    current_toxicity: f64,
    override_toxicity: Option<f64>,

    // Quoting parameters.
    base_spread: f64,
    min_spread: f64,
    max_spread: f64,
    base_quote_size: u32,
    max_position: f64,
    tick_size: f64,
    inventory_skew_coefficient: f64,
    toxicity_spread_multiplier: f64,
    toxicity_quote_threshold: f64,
    obi_threshold: f64,

    // Expected-PnL model (calibrated).
    mu_adverse: f64,
    gamma_risk: f64,
    fill_probability: f64,

    stats: StrategyStats,
}

impl MarketMakerStrategy {
    pub fn new(use_toxicity_screen: bool) -> Self {
        Self {
            use_toxicity_screen,
            inventory: 0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            avg_entry_price: 0.0,
            fee_per_share: 0.0,
            current_quote: Quote::default(),
            current_toxicity: 0.0,
            override_toxicity: None,
            base_spread: 0.01,
            min_spread: 0.01,
            max_spread: 0.10,
            base_quote_size: 1000,
            max_position: 100_000.0,
            tick_size: 0.01,
            inventory_skew_coefficient: 0.02,
            toxicity_spread_multiplier: 1.0,
            toxicity_quote_threshold: 0.75,
            obi_threshold: 0.50,
            mu_adverse: 0.003,
            gamma_risk: 0.0005,
            fill_probability: 0.35,
            stats: StrategyStats::default(),
        }
    }

    // --- Configuration -----------------------------------------------------

    pub fn set_fee_per_share(&mut self, fee: f64) {
        self.fee_per_share = fee;
    }

    pub fn set_base_spread(&mut self, spread: f64) {
        self.base_spread = spread;
    }

    pub fn set_max_position(&mut self, max_position: f64) {
        if max_position > 0.0 {
            self.max_position = max_position;
        }
    }

    pub fn set_toxicity_multiplier(&mut self, multiplier: f64) {
        self.toxicity_spread_multiplier = multiplier;
    }

    pub fn set_toxicity_threshold(&mut self, threshold: f64) {
        self.toxicity_quote_threshold = threshold;
    }

    /// Inject an externally predicted toxicity (the online model) in place
    /// of the level average.
    pub fn set_override_toxicity(&mut self, toxicity: f64) {
        self.override_toxicity = Some(toxicity);
    }

    pub fn clear_override_toxicity(&mut self) {
        self.override_toxicity = None;
    }

    // --- Accessors ---------------------------------------------------------

    pub fn inventory(&self) -> i64 {
        self.inventory
    }

    pub fn current_quote(&self) -> Quote {
        self.current_quote
    }

    pub fn current_toxicity(&self) -> f64 {
        self.current_toxicity
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.unrealized_pnl
    }

    pub fn stats(&self) -> StrategyStats {
        let mut s = self.stats;
        s.realized_pnl = self.realized_pnl;
        s.unrealized_pnl = self.unrealized_pnl;
        s
    }

    pub fn reset(&mut self) {
        let use_toxicity = self.use_toxicity_screen;
        let fee = self.fee_per_share;
        *self = MarketMakerStrategy::new(use_toxicity);
        self.fee_per_share = fee;
    }

    // --- Quoting -----------------------------------------------------------

    fn round_to_tick(&self, price: f64) -> f64 {
        (price / self.tick_size).round() * self.tick_size
    }

    /// Mean toxicity over the top levels of both sides, or the model
    /// override when one is installed.
    fn average_toxicity(&self, snap: &BookSnapshot) -> f64 {
        if let Some(t) = self.override_toxicity {
            return t;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        for level in snap.bids.iter().take(TOXICITY_LEVELS) {
            sum += level.toxicity;
            count += 1;
        }
        for level in snap.asks.iter().take(TOXICITY_LEVELS) {
            sum += level.toxicity;
            count += 1;
        }
        if count > 0 {
            sum / count as f64
        } else {
            0.0
        }
    }

    /// Toxicity-adjusted quoted spread, clamped to the configured band.
    fn adjusted_spread(&self, avg_toxicity: f64) -> f64 {
        if !self.use_toxicity_screen {
            return self.base_spread;
        }
        let widened = self.base_spread * (1.0 + avg_toxicity * self.toxicity_spread_multiplier);
        widened.clamp(self.min_spread, self.max_spread)
    }

    /// Linear plus quadratic inventory skew, in dollars.
    fn inventory_skew(&self) -> f64 {
        let r = self.inventory as f64 / self.max_position;
        -r * self.inventory_skew_coefficient
            - 0.5 * r * r.abs() * self.inventory_skew_coefficient
    }

    /// Expected per-share PnL of quoting at `half_spread` under the
    /// calibrated fill/adverse-selection model.
    pub fn expected_pnl(&self, half_spread: f64, toxicity: f64) -> f64 {
        let inventory_risk = (self.inventory as f64 / self.max_position).abs();
        self.fill_probability * (half_spread - self.mu_adverse * toxicity)
            - self.gamma_risk * inventory_risk
            - self.fee_per_share
    }

    /// Recompute the two-sided quote from a book snapshot.
    pub fn update_market_data(&mut self, snap: &BookSnapshot) {
        let stats = &snap.stats;
        if !stats.has_bbo() {
            self.current_quote.is_quoted = false;
            self.current_quote.bid_size = 0;
            self.current_quote.ask_size = 0;
            return;
        }

        let avg_toxicity = self.average_toxicity(snap);
        self.current_toxicity = avg_toxicity;

        let mid = stats.mid_price;
        let spread_half = self.adjusted_spread(avg_toxicity) / 2.0;
        let skew = self.inventory_skew();

        let mut bid_price = self.round_to_tick(mid - spread_half + skew);
        let mut ask_price = self.round_to_tick(mid + spread_half + skew);
        if bid_price >= ask_price {
            bid_price = self.round_to_tick(mid - self.tick_size);
            ask_price = self.round_to_tick(mid + self.tick_size);
        }

        // Inventory-banded sizing: lean hard against a concentrated book.
        let ratio = self.inventory as f64 / self.max_position;
        let (mut bid_size, mut ask_size) = (self.base_quote_size, self.base_quote_size);
        if ratio > 0.7 {
            bid_size = 0;
            ask_size = self.base_quote_size * 3;
        } else if ratio < -0.7 {
            bid_size = self.base_quote_size * 3;
            ask_size = 0;
        } else if ratio > 0.3 {
            bid_size = self.base_quote_size / 2;
            ask_size = self.base_quote_size * 2;
        } else if ratio < -0.3 {
            bid_size = self.base_quote_size * 2;
            ask_size = self.base_quote_size / 2;
        }

        if self.use_toxicity_screen {
            // Order-book imbalance tilt: fade the heavy side.
            let total = (stats.total_bid_qty + stats.total_ask_qty) as f64;
            if total > 0.0 {
                let obi = (stats.total_bid_qty as f64 - stats.total_ask_qty as f64) / total;
                if obi > self.obi_threshold {
                    ask_size /= 2;
                    ask_price += self.tick_size;
                } else if obi < -self.obi_threshold {
                    bid_size /= 2;
                    bid_price -= self.tick_size;
                }
            }

            if avg_toxicity > self.toxicity_quote_threshold {
                self.stats.quotes_suppressed += 1;
                self.mark_unrealized(snap, mid);
                self.current_quote = Quote {
                    bid_price,
                    ask_price,
                    bid_size: 0,
                    ask_size: 0,
                    is_quoted: false,
                };
                return;
            }

            if self.expected_pnl(spread_half, avg_toxicity) <= MIN_EXPECTED_PNL {
                self.stats.quotes_suppressed += 1;
                self.mark_unrealized(snap, mid);
                self.current_quote = Quote {
                    bid_price,
                    ask_price,
                    bid_size: 0,
                    ask_size: 0,
                    is_quoted: false,
                };
                return;
            }
        }

        self.mark_unrealized(snap, mid);
        self.current_quote = Quote {
            bid_price,
            ask_price,
            bid_size,
            ask_size,
            is_quoted: true,
        };
    }

    /// Mark open inventory against the last trade when one exists, else mid.
    fn mark_unrealized(&mut self, snap: &BookSnapshot, mid: f64) {
        let mark = if snap.last_traded_price > 0.0 {
            snap.last_traded_price
        } else {
            mid
        };
        self.unrealized_pnl = if self.inventory > 0 {
            (mark - self.avg_entry_price) * self.inventory as f64
        } else if self.inventory < 0 {
            (self.avg_entry_price - mark) * (-self.inventory) as f64
        } else {
            0.0
        };
    }

    // --- Fill accounting ---------------------------------------------------

    /// Apply a virtual fill. Realizes PnL on the closing portion, flips
    /// the overshoot through zero at the fill price, and charges the
    /// per-share fee (negative fee = rebate).
    pub fn on_fill(&mut self, is_buy: bool, price: f64, size: u32) {
        let qty = i64::from(size);

        if is_buy {
            if self.inventory >= 0 {
                // Opening or adding to a long: VWAP the entry.
                let new_pos = self.inventory + qty;
                if new_pos != 0 {
                    self.avg_entry_price = (self.avg_entry_price * self.inventory as f64
                        + price * qty as f64)
                        / new_pos as f64;
                } else {
                    self.avg_entry_price = 0.0;
                }
                self.inventory = new_pos;
            } else {
                // Covering a short; any overshoot flips long at the fill.
                let cover = qty.min(-self.inventory);
                self.realized_pnl += (self.avg_entry_price - price) * cover as f64;
                self.inventory += cover;
                let remaining = qty - cover;
                if self.inventory == 0 && remaining > 0 {
                    self.inventory = remaining;
                    self.avg_entry_price = price;
                } else if self.inventory == 0 {
                    self.avg_entry_price = 0.0;
                }
            }
            self.stats.buy_fills += 1;
            self.stats.avg_fill_price_buy = (self.stats.avg_fill_price_buy
                * (self.stats.buy_fills - 1) as f64
                + price)
                / self.stats.buy_fills as f64;
        } else {
            if self.inventory <= 0 {
                // Opening or adding to a short.
                let new_short_abs = -self.inventory + qty;
                if new_short_abs != 0 {
                    self.avg_entry_price = (self.avg_entry_price * (-self.inventory) as f64
                        + price * qty as f64)
                        / new_short_abs as f64;
                } else {
                    self.avg_entry_price = 0.0;
                }
                self.inventory -= qty;
            } else {
                // Selling down a long; overshoot flips short at the fill.
                let close = qty.min(self.inventory);
                self.realized_pnl += (price - self.avg_entry_price) * close as f64;
                self.inventory -= close;
                let remaining = qty - close;
                if self.inventory == 0 && remaining > 0 {
                    self.inventory = -remaining;
                    self.avg_entry_price = price;
                } else if self.inventory == 0 {
                    self.avg_entry_price = 0.0;
                }
            }
            self.stats.sell_fills += 1;
            self.stats.avg_fill_price_sell = (self.stats.avg_fill_price_sell
                * (self.stats.sell_fills - 1) as f64
                + price)
                / self.stats.sell_fills as f64;
        }

        self.realized_pnl -= self.fee_per_share * size as f64;

        self.stats.total_fills += 1;
        self.stats.total_volume_traded += u64::from(size);
        let inv = self.inventory as f64;
        if inv > self.stats.max_inventory {
            self.stats.max_inventory = inv;
        }
        if inv < self.stats.min_inventory {
            self.stats.min_inventory = inv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookStats, LevelView};

    fn snapshot(best_bid: f64, best_ask: f64, bid_qty: u64, ask_qty: u64) -> BookSnapshot {
        BookSnapshot {
            stats: BookStats {
                best_bid,
                best_ask,
                spread: best_ask - best_bid,
                mid_price: (best_bid + best_ask) / 2.0,
                total_bid_qty: bid_qty,
                total_ask_qty: ask_qty,
                bid_levels: 1,
                ask_levels: 1,
            },
            bids: vec![LevelView {
                price: best_bid,
                qty: bid_qty,
                toxicity: 0.0,
            }],
            asks: vec![LevelView {
                price: best_ask,
                qty: ask_qty,
                toxicity: 0.0,
            }],
            last_traded_price: 0.0,
            last_traded_volume: 0,
        }
    }

    #[test]
    fn no_bbo_means_no_quote() {
        let mut mm = MarketMakerStrategy::new(false);
        let snap = BookSnapshot::default();
        mm.update_market_data(&snap);
        assert!(!mm.current_quote().is_quoted);
        assert_eq!(mm.current_quote().bid_size, 0);
    }

    #[test]
    fn baseline_quotes_around_mid() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.update_market_data(&snapshot(99.99, 100.01, 5_000, 5_000));
        let q = mm.current_quote();
        assert!(q.is_quoted);
        assert!(q.bid_price < q.ask_price);
        assert!((q.bid_price + q.ask_price) / 2.0 - 100.0 <= 0.0051);
        assert_eq!(q.bid_size, 1000);
        assert_eq!(q.ask_size, 1000);
    }

    #[test]
    fn crossed_quote_falls_back_to_mid_pm_tick() {
        let mut mm = MarketMakerStrategy::new(false);
        // A sub-tick spread rounds both sides onto the mid; the fallback
        // must re-open the quote to mid +- one tick.
        mm.set_base_spread(0.001);
        mm.update_market_data(&snapshot(99.99, 100.01, 1_000, 1_000));
        let q = mm.current_quote();
        assert!((q.bid_price - 99.99).abs() < 1e-9);
        assert!((q.ask_price - 100.01).abs() < 1e-9);
    }

    #[test]
    fn long_inventory_skews_quotes_down() {
        let mut long_mm = MarketMakerStrategy::new(false);
        long_mm.set_max_position(1_000.0);
        long_mm.on_fill(true, 100.0, 500); // 50% long

        let mut flat_mm = MarketMakerStrategy::new(false);
        flat_mm.set_max_position(1_000.0);

        let snap = snapshot(99.90, 100.10, 5_000, 5_000);
        long_mm.update_market_data(&snap);
        flat_mm.update_market_data(&snap);
        assert!(
            long_mm.current_quote().bid_price <= flat_mm.current_quote().bid_price,
            "a long book must not quote a more aggressive bid"
        );
    }

    #[test]
    fn sizing_bands_lean_against_inventory() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.set_max_position(1_000.0);
        mm.on_fill(true, 100.0, 800); // 80% long
        mm.update_market_data(&snapshot(99.90, 100.10, 5_000, 5_000));
        let q = mm.current_quote();
        assert_eq!(q.bid_size, 0, "same-direction side zeroed past 70%");
        assert_eq!(q.ask_size, 3000, "opposite side tripled past 70%");

        let mut mm = MarketMakerStrategy::new(false);
        mm.set_max_position(1_000.0);
        mm.on_fill(false, 100.0, 400); // 40% short
        mm.update_market_data(&snapshot(99.90, 100.10, 5_000, 5_000));
        let q = mm.current_quote();
        assert_eq!(q.bid_size, 2000);
        assert_eq!(q.ask_size, 500);
    }

    #[test]
    fn obi_tilt_fades_heavy_bid_side() {
        let mut mm = MarketMakerStrategy::new(true);
        // Massive bid imbalance: obi well above 0.5.
        let snap = snapshot(99.90, 100.10, 90_000, 5_000);
        mm.update_market_data(&snap);
        let q = mm.current_quote();
        assert!(q.is_quoted);
        assert_eq!(q.ask_size, 500, "ask halved under heavy bid pressure");
        assert_eq!(q.bid_size, 1000);

        let mut baseline = MarketMakerStrategy::new(false);
        baseline.update_market_data(&snap);
        assert!(
            q.ask_price > baseline.current_quote().ask_price,
            "ask widened one tick under heavy bid pressure"
        );
    }

    #[test]
    fn toxicity_suppression_counts_and_unquotes() {
        let mut mm = MarketMakerStrategy::new(true);
        mm.set_override_toxicity(0.9); // above the 0.75 threshold
        mm.update_market_data(&snapshot(99.90, 100.10, 5_000, 5_000));
        assert!(!mm.current_quote().is_quoted);
        assert_eq!(mm.stats().quotes_suppressed, 1);

        mm.clear_override_toxicity();
        mm.update_market_data(&snapshot(99.90, 100.10, 5_000, 5_000));
        assert!(mm.current_quote().is_quoted);
        assert_eq!(mm.stats().quotes_suppressed, 1);
    }

    #[test]
    fn negative_expected_pnl_suppresses() {
        let mut mm = MarketMakerStrategy::new(true);
        // A punitive per-share fee pushes expected PnL below the floor
        // even on a wide book.
        mm.set_fee_per_share(0.05);
        mm.update_market_data(&snapshot(99.90, 100.10, 5_000, 5_000));
        assert!(!mm.current_quote().is_quoted);
        assert_eq!(mm.stats().quotes_suppressed, 1);
    }

    #[test]
    fn baseline_never_suppresses() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.set_fee_per_share(0.05);
        mm.set_override_toxicity(1.0);
        mm.update_market_data(&snapshot(99.90, 100.10, 5_000, 5_000));
        assert!(mm.current_quote().is_quoted);
        assert_eq!(mm.stats().quotes_suppressed, 0);
    }

    #[test]
    fn buy_then_sell_realizes_spread() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.on_fill(true, 100.00, 100);
        assert_eq!(mm.inventory(), 100);
        mm.on_fill(false, 100.10, 100);
        assert_eq!(mm.inventory(), 0);
        assert!((mm.realized_pnl() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sell_through_zero_flips_short_at_fill_price() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.on_fill(true, 50.00, 100); // long 100 @ 50.00
        mm.on_fill(false, 51.00, 150); // sell 150 @ 51.00

        assert!((mm.realized_pnl() - 100.0).abs() < 1e-9, "(51-50)*100");
        assert_eq!(mm.inventory(), -50);
        // The 50-share overshoot opens a short at the fill price.
        let snap = snapshot(50.99, 51.01, 100, 100);
        let mut mm2 = mm.clone();
        mm2.update_market_data(&snap);
        assert!((mm2.unrealized_pnl() - 0.0).abs() < 1e-6);
    }

    #[test]
    fn cover_short_through_zero_flips_long() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.on_fill(false, 100.00, 100); // short 100 @ 100
        mm.on_fill(true, 99.00, 150); // cover 100, flip long 50 @ 99

        assert!((mm.realized_pnl() - 100.0).abs() < 1e-9, "(100-99)*100");
        assert_eq!(mm.inventory(), 50);
    }

    #[test]
    fn fees_reduce_realized_linearly() {
        let fee = 0.001;
        let mut with_fee = MarketMakerStrategy::new(false);
        with_fee.set_fee_per_share(fee);
        let mut no_fee = MarketMakerStrategy::new(false);

        for mm in [&mut with_fee, &mut no_fee] {
            mm.on_fill(true, 100.00, 300);
            mm.on_fill(false, 100.05, 300);
        }
        let total_shares = 600.0;
        assert!(
            (no_fee.realized_pnl() - with_fee.realized_pnl() - fee * total_shares).abs() < 1e-9,
            "net = gross - fee * shares"
        );
    }

    #[test]
    fn rebate_fee_adds_to_pnl() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.set_fee_per_share(-0.002); // net rebate
        mm.on_fill(true, 100.0, 100);
        assert!((mm.realized_pnl() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn inventory_extremes_are_tracked() {
        let mut mm = MarketMakerStrategy::new(false);
        mm.on_fill(true, 100.0, 500);
        mm.on_fill(false, 100.0, 1_200);
        let s = mm.stats();
        assert_eq!(s.max_inventory, 500.0);
        assert_eq!(s.min_inventory, -700.0);
        assert_eq!(s.total_fills, 2);
        assert_eq!(s.total_volume_traded, 1_700);
    }
}
