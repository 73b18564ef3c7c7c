// src/config.rs
//
// Central configuration for the tapesim replay engine.
// This is the single source of truth for the execution model, the online
// learning loop, and output routing. Defaults correspond to the calibrated
// elite-HFT parameter set (colocated, FPGA-class latency, top-tier maker
// rebate) that the toxicity study was run against.

use std::path::PathBuf;

/// How an execution is matched against a virtual quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill whenever the execution price crosses the quote (default).
    Cross,
    /// Fill only when the execution price equals the quote within 1e-12.
    Match,
}

/// Execution-model parameters: latency, queue position, adverse selection,
/// fees, and per-symbol risk limits.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Base seed; each symbol derives its own stream from this.
    pub seed: u64,

    /// One-way wire latency mean, microseconds.
    pub latency_us_mean: f64,
    /// Latency jitter (standard deviation), microseconds.
    pub latency_us_jitter: f64,
    /// Minimum interval between quote recomputations, microseconds.
    pub quote_update_interval_us: u64,

    /// Fraction of visible depth assumed ahead of us on arrival.
    pub queue_position_fraction: f64,
    /// Relative variance of the sampled queue position.
    pub queue_position_variance: f64,

    /// How long after a fill the mid is re-read to measure adverse moves,
    /// microseconds.
    pub adverse_lookforward_us: u64,
    /// Fraction of the adverse move charged against PnL.
    pub adverse_selection_multiplier: f64,

    /// Stale-quote exposure window during cancel-replace, microseconds.
    pub quote_exposure_window_us: u64,

    /// Maker rebate per share (positive = we receive).
    pub maker_rebate_per_share: f64,
    /// Clearing fee per share (positive = we pay).
    pub clearing_fee_per_share: f64,

    /// Hard inventory cap per symbol, shares.
    pub max_position_per_symbol: f64,
    /// Stop quoting a symbol after this much total loss, dollars.
    pub max_daily_loss_per_symbol: f64,

    /// Eligibility gates: spread band and minimum side depth.
    pub min_spread_to_trade: f64,
    pub max_spread_to_trade: f64,
    pub min_depth_to_trade: u32,

    pub fill_mode: FillMode,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            // 5us one-way: FPGA + kernel bypass + direct exchange feed.
            latency_us_mean: 5.0,
            latency_us_jitter: 1.0,
            quote_update_interval_us: 10,
            // Effectively front of queue: 0.5% of visible depth ahead.
            queue_position_fraction: 0.005,
            queue_position_variance: 0.1,
            adverse_lookforward_us: 250,
            adverse_selection_multiplier: 0.03,
            quote_exposure_window_us: 10,
            // NYSE Tier 1 maker economics.
            maker_rebate_per_share: 0.0025,
            clearing_fee_per_share: 0.00008,
            max_position_per_symbol: 50_000.0,
            max_daily_loss_per_symbol: 5_000.0,
            min_spread_to_trade: 0.01,
            max_spread_to_trade: 0.20,
            min_depth_to_trade: 100,
            fill_mode: FillMode::Cross,
        }
    }
}

impl ExecutionConfig {
    /// Net per-share fee seen by the strategies: clearing cost minus
    /// rebate. Negative means the maker is paid on balance.
    pub fn net_fee_per_share(&self) -> f64 {
        -(self.maker_rebate_per_share - self.clearing_fee_per_share)
    }
}

/// Online toxicity-model hyperparameters.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Whether the online SGD loop runs at all.
    pub enabled: bool,
    /// Base learning rate before decay.
    pub learning_rate: f64,
    /// Measured fills before the learned weights take over.
    pub warmup_fills: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            learning_rate: 0.01,
            warmup_fills: 50,
        }
    }
}

/// Top-level replay configuration assembled from the CLI.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    pub exec: ExecutionConfig,
    pub learning: LearningConfig,

    /// Only simulate this ticker when set.
    pub filter_ticker: Option<String>,

    /// CLI override for the toxicity suppression threshold; 0 keeps the
    /// strategy default.
    pub toxicity_threshold: f64,
    /// CLI override for the toxicity spread multiplier; 0 keeps the
    /// strategy default.
    pub toxicity_multiplier: f64,

    /// Directory for per-group CSV/JSON artifacts; None = stdout summary
    /// only.
    pub output_dir: Option<PathBuf>,

    /// Worker count for group fan-out; 0 = host parallelism.
    pub threads: usize,
    /// Cap on files per group; 0 = no cap.
    pub files_per_group: usize,
    /// One thread per file over a shared sharded table instead of
    /// one thread per disjoint file group.
    pub no_hybrid: bool,
    /// Force everything onto the calling thread (bit-deterministic).
    pub sequential: bool,
}

impl SimConfig {
    /// True when completed fills must be retained for CSV output.
    pub fn keep_completed_fills(&self) -> bool {
        self.output_dir.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_fee_is_negative_for_rebate_dominated_schedule() {
        let exec = ExecutionConfig::default();
        let net = exec.net_fee_per_share();
        assert!(net < 0.0, "tier-1 maker schedule should net a rebate");
        assert!((net - (-(0.0025 - 0.00008))).abs() < 1e-12);
    }

    #[test]
    fn defaults_match_calibrated_model() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.seed, 42);
        assert_eq!(exec.adverse_lookforward_us, 250);
        assert_eq!(exec.quote_update_interval_us, 10);
        assert_eq!(exec.fill_mode, FillMode::Cross);
    }
}
