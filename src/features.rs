// src/features.rs
//
// Fixed-size ring-buffer trackers for the temporal features of the online
// toxicity model. All three are flat arrays with a head cursor; the oldest
// entry is overwritten once the window is full, and reads cost one pass at
// most. No heap allocation.

const TRADE_FLOW_WINDOW: usize = 100;
const CHANGE_RATE_WINDOW: usize = 50;

/// Executed-trade flow over the last `WINDOW` executions.
#[derive(Debug, Clone)]
pub struct TradeFlowTracker {
    buffer: [(bool, u32); TRADE_FLOW_WINDOW],
    head: usize,
    count: usize,
}

impl Default for TradeFlowTracker {
    fn default() -> Self {
        Self {
            buffer: [(false, 0); TRADE_FLOW_WINDOW],
            head: 0,
            count: 0,
        }
    }
}

impl TradeFlowTracker {
    pub const WINDOW: usize = TRADE_FLOW_WINDOW;

    pub fn record_trade(&mut self, is_buy: bool, volume: u32) {
        self.buffer[self.head] = (is_buy, volume);
        self.head = (self.head + 1) % Self::WINDOW;
        if self.count < Self::WINDOW {
            self.count += 1;
        }
    }

    /// Signed volume imbalance in [-1, 1]; 0 when no trades recorded.
    pub fn imbalance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut buy_vol = 0.0f64;
        let mut sell_vol = 0.0f64;
        for &(is_buy, volume) in &self.buffer[..self.count] {
            if is_buy {
                buy_vol += f64::from(volume);
            } else {
                sell_vol += f64::from(volume);
            }
        }
        let total = buy_vol + sell_vol;
        if total > 0.0 {
            (buy_vol - sell_vol) / total
        } else {
            0.0
        }
    }
}

/// Relative change between the oldest and newest value in a ring of
/// `WINDOW` observations. Shared by the spread and momentum trackers.
#[derive(Debug, Clone)]
struct ChangeRateRing {
    buffer: [f64; CHANGE_RATE_WINDOW],
    head: usize,
    count: usize,
}

impl ChangeRateRing {
    const WINDOW: usize = CHANGE_RATE_WINDOW;

    fn new() -> Self {
        Self {
            buffer: [0.0; Self::WINDOW],
            head: 0,
            count: 0,
        }
    }

    fn record(&mut self, value: f64) {
        self.buffer[self.head] = value;
        self.head = (self.head + 1) % Self::WINDOW;
        if self.count < Self::WINDOW {
            self.count += 1;
        }
    }

    fn change_rate(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let newest = self.buffer[(self.head + Self::WINDOW - 1) % Self::WINDOW];
        let oldest_idx = if self.count < Self::WINDOW { 0 } else { self.head };
        let oldest = self.buffer[oldest_idx];
        if oldest > 1e-10 {
            (newest - oldest) / oldest
        } else {
            0.0
        }
    }
}

/// Spread change rate over the last 50 observed spreads.
#[derive(Debug, Clone)]
pub struct SpreadTracker {
    ring: ChangeRateRing,
}

impl Default for SpreadTracker {
    fn default() -> Self {
        Self {
            ring: ChangeRateRing::new(),
        }
    }
}

impl SpreadTracker {
    pub fn record_spread(&mut self, spread: f64) {
        self.ring.record(spread);
    }

    pub fn spread_change_rate(&self) -> f64 {
        self.ring.change_rate()
    }
}

/// Mid-price momentum over the last 50 observed mids.
#[derive(Debug, Clone)]
pub struct MomentumTracker {
    ring: ChangeRateRing,
}

impl Default for MomentumTracker {
    fn default() -> Self {
        Self {
            ring: ChangeRateRing::new(),
        }
    }
}

impl MomentumTracker {
    pub fn record_mid(&mut self, mid: f64) {
        self.ring.record(mid);
    }

    pub fn momentum(&self) -> f64 {
        self.ring.change_rate()
    }
}
