// src/book.rs
//
// Per-symbol limit order book with order-level tracking and per-level
// toxicity accumulators.
//
// Ladders are keyed by fixed-point micro-dollar prices so map keys are
// exact; bids iterate descending, asks ascending. Aggregate side volumes
// are maintained incrementally so stats reads never scan the ladders.
//
// The book trusts the feed: adds of duplicate ids and mutations of unknown
// ids are silent no-ops, and the ladders reflect the inputs verbatim (the
// source data may momentarily cross).
//
// Toxicity history is intentionally kept when a level empties: the
// counters are path-dependent and a level that drains and re-forms at the
// same price continues accumulating.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{Px, Side, TimestampNs};

/// A resting order as tracked by the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub price: Px,
    pub volume: u32,
    pub side: Side,
    pub admitted_at: TimestampNs,
}

/// Per-level toxicity tallies, updated on adds and cancels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToxicityMetrics {
    pub adds: u32,
    pub cancels: u32,
    pub volume_added: u64,
    pub volume_cancelled: u64,
    /// Orders with volume < 10.
    pub ping_count: u32,
    /// Orders with volume > 200.
    pub large_order_count: u32,
    /// Orders whose volume is not a multiple of 100.
    pub odd_lot_count: u32,
    /// Prices with more than 2 decimal places of significance.
    pub high_precision_price_count: u32,
    /// Prices whose cents part is .01, .05, .95, .98 or .99.
    pub resistance_level_count: u32,
}

/// The five per-level ratios consumed by the feature vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureRatios {
    pub cancel_ratio: f64,
    pub ping_ratio: f64,
    pub odd_lot_ratio: f64,
    pub precision_ratio: f64,
    pub resistance_ratio: f64,
}

impl ToxicityMetrics {
    fn on_add(&mut self, price: Px, volume: u32) {
        self.adds += 1;
        self.volume_added += u64::from(volume);

        if volume < 10 {
            self.ping_count += 1;
        }
        if volume > 200 {
            self.large_order_count += 1;
        }
        if volume % 100 != 0 {
            self.odd_lot_count += 1;
        }

        if price.has_sub_cent_precision() {
            self.high_precision_price_count += 1;
        }
        if matches!(price.fractional_cents(), 1 | 5 | 95 | 98 | 99) {
            self.resistance_level_count += 1;
        }
    }

    fn on_cancel(&mut self, volume: u32) {
        self.cancels += 1;
        self.volume_cancelled += u64::from(volume);
    }

    pub fn feature_ratios(&self) -> FeatureRatios {
        let total = self.adds + self.cancels;
        if total == 0 {
            return FeatureRatios::default();
        }
        let total = f64::from(total);
        FeatureRatios {
            cancel_ratio: f64::from(self.cancels) / total,
            ping_ratio: f64::from(self.ping_count) / total,
            odd_lot_ratio: f64::from(self.odd_lot_count) / total,
            precision_ratio: f64::from(self.high_precision_price_count) / total,
            resistance_ratio: f64::from(self.resistance_level_count) / total,
        }
    }

    /// Toxicity score in [0, 1]. The weights are the hand-calibrated
    /// baseline that the learned model is evaluated against; they are the
    /// defaults on purpose.
    pub fn toxicity_score(&self) -> f64 {
        if self.adds + self.cancels == 0 {
            return 0.0;
        }
        let r = self.feature_ratios();
        let score = 0.40 * r.cancel_ratio
            + 0.20 * r.ping_ratio
            + 0.15 * r.odd_lot_ratio
            + 0.15 * r.precision_ratio
            + 0.10 * r.resistance_ratio;
        score.min(1.0)
    }

    /// Human-readable activity summary for diagnostics.
    pub fn explanation(&self) -> String {
        if self.adds + self.cancels == 0 {
            return "No activity".to_string();
        }
        let mut s = format!("Events: {} adds, {} cancels", self.adds, self.cancels);
        if self.ping_count > 0 {
            s.push_str(&format!(" | Pings: {}", self.ping_count));
        }
        if self.odd_lot_count > 0 {
            s.push_str(&format!(" | Odd lots: {}", self.odd_lot_count));
        }
        if self.high_precision_price_count > 0 {
            s.push_str(&format!(
                " | High precision: {}",
                self.high_precision_price_count
            ));
        }
        if self.resistance_level_count > 0 {
            s.push_str(&format!(
                " | Resistance levels: {}",
                self.resistance_level_count
            ));
        }
        s
    }
}

/// O(1) derived book statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookStats {
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub mid_price: f64,
    pub total_bid_qty: u64,
    pub total_ask_qty: u64,
    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl BookStats {
    /// True when both sides have at least one level.
    pub fn has_bbo(&self) -> bool {
        self.best_bid > 0.0 && self.best_ask > 0.0
    }
}

/// One ladder level as exposed to strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelView {
    pub price: f64,
    pub qty: u64,
    pub toxicity: f64,
}

/// Copy of the book state sufficient for quoting decisions: stats plus the
/// top levels of each side with their toxicity scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub stats: BookStats,
    pub bids: Vec<LevelView>,
    pub asks: Vec<LevelView>,
    pub last_traded_price: f64,
    pub last_traded_volume: u32,
}

/// Per-symbol order book.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<Px, u64>,
    asks: BTreeMap<Px, u64>,
    active_orders: HashMap<u64, Order>,
    bid_toxicity: BTreeMap<Px, ToxicityMetrics>,
    ask_toxicity: BTreeMap<Px, ToxicityMetrics>,
    total_bid_volume: u64,
    total_ask_volume: u64,
    last_traded_price: f64,
    last_traded_volume: u32,
}

impl OrderBook {
    pub fn new() -> OrderBook {
        OrderBook::default()
    }

    /// Drop all state, toxicity history included.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.active_orders.clear();
        self.bid_toxicity.clear();
        self.ask_toxicity.clear();
        self.total_bid_volume = 0;
        self.total_ask_volume = 0;
        self.last_traded_price = 0.0;
        self.last_traded_volume = 0;
    }

    /// Admit a new resting order. Silent no-op when the id already exists;
    /// the protocol is assumed well-formed.
    pub fn add_order(&mut self, order_id: u64, price: Px, volume: u32, side: Side, now: TimestampNs) {
        if self.active_orders.contains_key(&order_id) {
            return;
        }
        match side {
            Side::Buy => {
                *self.bids.entry(price).or_insert(0) += u64::from(volume);
                self.total_bid_volume += u64::from(volume);
                self.bid_toxicity.entry(price).or_default().on_add(price, volume);
            }
            Side::Sell => {
                *self.asks.entry(price).or_insert(0) += u64::from(volume);
                self.total_ask_volume += u64::from(volume);
                self.ask_toxicity.entry(price).or_default().on_add(price, volume);
            }
        }
        self.active_orders.insert(
            order_id,
            Order {
                order_id,
                price,
                volume,
                side,
                admitted_at: now,
            },
        );
    }

    /// Move an order to a new price/volume. Side is preserved; the
    /// protocol does not permit side changes. Unknown id: no-op.
    pub fn modify_order(&mut self, order_id: u64, new_price: Px, new_volume: u32) {
        let Some(order) = self.active_orders.get_mut(&order_id) else {
            return;
        };
        let (old_price, old_volume, side) = (order.price, order.volume, order.side);
        order.price = new_price;
        order.volume = new_volume;

        match side {
            Side::Buy => {
                remove_level_volume(&mut self.bids, old_price, u64::from(old_volume));
                self.total_bid_volume -= u64::from(old_volume);
                *self.bids.entry(new_price).or_insert(0) += u64::from(new_volume);
                self.total_bid_volume += u64::from(new_volume);
            }
            Side::Sell => {
                remove_level_volume(&mut self.asks, old_price, u64::from(old_volume));
                self.total_ask_volume -= u64::from(old_volume);
                *self.asks.entry(new_price).or_insert(0) += u64::from(new_volume);
                self.total_ask_volume += u64::from(new_volume);
            }
        }
    }

    /// Cancel a resting order. Counts the cancel against the level's
    /// toxicity before removing volume. Unknown id: no-op.
    pub fn delete_order(&mut self, order_id: u64) {
        let Some(order) = self.active_orders.remove(&order_id) else {
            return;
        };
        match order.side {
            Side::Buy => {
                self.bid_toxicity
                    .entry(order.price)
                    .or_default()
                    .on_cancel(order.volume);
                remove_level_volume(&mut self.bids, order.price, u64::from(order.volume));
                self.total_bid_volume -= u64::from(order.volume);
            }
            Side::Sell => {
                self.ask_toxicity
                    .entry(order.price)
                    .or_default()
                    .on_cancel(order.volume);
                remove_level_volume(&mut self.asks, order.price, u64::from(order.volume));
                self.total_ask_volume -= u64::from(order.volume);
            }
        }
    }

    /// Apply a trade against a resting order. Full fills remove the order;
    /// executions never touch the cancel counters. Unknown id: no-op.
    pub fn execute_order(&mut self, order_id: u64, executed_qty: u32, trade_price: f64) {
        let (price, side, remaining) = match self.active_orders.get(&order_id) {
            Some(o) => (o.price, o.side, o.volume),
            None => return,
        };

        let removed = if remaining > executed_qty {
            // Partial fill: the order keeps its place at a reduced size.
            if let Some(o) = self.active_orders.get_mut(&order_id) {
                o.volume -= executed_qty;
            }
            executed_qty
        } else {
            self.active_orders.remove(&order_id);
            remaining
        };
        match side {
            Side::Buy => {
                remove_level_volume(&mut self.bids, price, u64::from(removed));
                self.total_bid_volume -= u64::from(removed);
            }
            Side::Sell => {
                remove_level_volume(&mut self.asks, price, u64::from(removed));
                self.total_ask_volume -= u64::from(removed);
            }
        }

        self.last_traded_price = trade_price;
        self.last_traded_volume = executed_qty;
    }

    /// Seed the book from externally captured ladders. Toxicity counters
    /// are cleared: they are path-dependent and not reconstructible from a
    /// checkpoint.
    pub fn restore(
        &mut self,
        bids: BTreeMap<Px, u64>,
        asks: BTreeMap<Px, u64>,
        active_orders: HashMap<u64, Order>,
    ) {
        self.total_bid_volume = bids.values().sum();
        self.total_ask_volume = asks.values().sum();
        self.bids = bids;
        self.asks = asks;
        self.active_orders = active_orders;
        self.bid_toxicity.clear();
        self.ask_toxicity.clear();
    }

    /// Derived stats, O(1) from running totals and ladder endpoints.
    pub fn stats(&self) -> BookStats {
        let best_bid = self
            .bids
            .keys()
            .next_back()
            .map(|p| p.to_dollars())
            .unwrap_or(0.0);
        let best_ask = self
            .asks
            .keys()
            .next()
            .map(|p| p.to_dollars())
            .unwrap_or(0.0);
        let (spread, mid_price) = if best_bid > 0.0 && best_ask > 0.0 {
            (best_ask - best_bid, (best_bid + best_ask) / 2.0)
        } else {
            (0.0, 0.0)
        };
        BookStats {
            best_bid,
            best_ask,
            spread,
            mid_price,
            total_bid_qty: self.total_bid_volume,
            total_ask_qty: self.total_ask_volume,
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }

    /// Snapshot for strategy evaluation: stats plus the top `depth` levels
    /// on each side with toxicity scores.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(&price, &qty)| LevelView {
                price: price.to_dollars(),
                qty,
                toxicity: self.toxicity(price, Side::Buy),
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(&price, &qty)| LevelView {
                price: price.to_dollars(),
                qty,
                toxicity: self.toxicity(price, Side::Sell),
            })
            .collect();
        BookSnapshot {
            stats: self.stats(),
            bids,
            asks,
            last_traded_price: self.last_traded_price,
            last_traded_volume: self.last_traded_volume,
        }
    }

    /// Toxicity score for a price level; 0 for untouched levels.
    pub fn toxicity(&self, price: Px, side: Side) -> f64 {
        let map = match side {
            Side::Buy => &self.bid_toxicity,
            Side::Sell => &self.ask_toxicity,
        };
        map.get(&price).map(|m| m.toxicity_score()).unwrap_or(0.0)
    }

    pub fn toxicity_metrics(&self, price: Px, side: Side) -> ToxicityMetrics {
        let map = match side {
            Side::Buy => &self.bid_toxicity,
            Side::Sell => &self.ask_toxicity,
        };
        map.get(&price).copied().unwrap_or_default()
    }

    /// Feature ratios averaged over the top `depth` levels of both sides.
    /// Used to build indices 0-4 of the online feature vector.
    pub fn averaged_feature_ratios(&self, depth: usize) -> FeatureRatios {
        let mut acc = FeatureRatios::default();
        let mut count = 0usize;
        for (&price, _) in self.bids.iter().rev().take(depth) {
            let r = self
                .bid_toxicity
                .get(&price)
                .map(|m| m.feature_ratios())
                .unwrap_or_default();
            accumulate(&mut acc, &r);
            count += 1;
        }
        for (&price, _) in self.asks.iter().take(depth) {
            let r = self
                .ask_toxicity
                .get(&price)
                .map(|m| m.feature_ratios())
                .unwrap_or_default();
            accumulate(&mut acc, &r);
            count += 1;
        }
        if count > 0 {
            let n = count as f64;
            acc.cancel_ratio /= n;
            acc.ping_ratio /= n;
            acc.odd_lot_ratio /= n;
            acc.precision_ratio /= n;
            acc.resistance_ratio /= n;
        }
        acc
    }

    /// Visible aggregate volume at a price level, 0 when the level does
    /// not exist. Drives the queue-position model.
    pub fn level_volume(&self, price: Px, side: Side) -> u64 {
        let map = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        map.get(&price).copied().unwrap_or(0)
    }

    pub fn order(&self, order_id: u64) -> Option<&Order> {
        self.active_orders.get(&order_id)
    }

    pub fn last_traded_price(&self) -> f64 {
        self.last_traded_price
    }

    /// Cross-check the incremental state against a full scan. Test and
    /// debugging aid; not called on the hot path.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut bid_sum = 0u64;
        let mut ask_sum = 0u64;
        for order in self.active_orders.values() {
            match order.side {
                Side::Buy => bid_sum += u64::from(order.volume),
                Side::Sell => ask_sum += u64::from(order.volume),
            }
        }
        let bid_scan: u64 = self.bids.values().sum();
        let ask_scan: u64 = self.asks.values().sum();
        if bid_sum != bid_scan {
            return Err(format!(
                "bid volume mismatch: orders {bid_sum} vs levels {bid_scan}"
            ));
        }
        if ask_sum != ask_scan {
            return Err(format!(
                "ask volume mismatch: orders {ask_sum} vs levels {ask_scan}"
            ));
        }
        if bid_scan != self.total_bid_volume {
            return Err(format!(
                "bid running total {t} disagrees with scan {bid_scan}",
                t = self.total_bid_volume
            ));
        }
        if ask_scan != self.total_ask_volume {
            return Err(format!(
                "ask running total {t} disagrees with scan {ask_scan}",
                t = self.total_ask_volume
            ));
        }
        if let Some((_, qty)) = self.bids.iter().find(|(_, &q)| q == 0) {
            return Err(format!("empty bid level not erased (qty {qty})"));
        }
        if let Some((_, qty)) = self.asks.iter().find(|(_, &q)| q == 0) {
            return Err(format!("empty ask level not erased (qty {qty})"));
        }
        for order in self.active_orders.values() {
            let map = match order.side {
                Side::Buy => &self.bids,
                Side::Sell => &self.asks,
            };
            if !map.contains_key(&order.price) {
                return Err(format!(
                    "order {} rests at a missing level {:?}",
                    order.order_id, order.price
                ));
            }
        }
        Ok(())
    }
}

fn remove_level_volume(levels: &mut BTreeMap<Px, u64>, price: Px, volume: u64) {
    if let Some(qty) = levels.get_mut(&price) {
        if *qty <= volume {
            levels.remove(&price);
        } else {
            *qty -= volume;
        }
    }
}

fn accumulate(acc: &mut FeatureRatios, r: &FeatureRatios) {
    acc.cancel_ratio += r.cancel_ratio;
    acc.ping_ratio += r.ping_ratio;
    acc.odd_lot_ratio += r.odd_lot_ratio;
    acc.precision_ratio += r.precision_ratio;
    acc.resistance_ratio += r.resistance_ratio;
}
