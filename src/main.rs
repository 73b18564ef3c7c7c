// src/main.rs
//
// CLI entrypoint: parse flags, assemble the replay configuration, load the
// symbol map, run, summarize. Exit 0 on success, 1 on argument error or
// fatal runtime failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tapesim::config::{FillMode, SimConfig};
use tapesim::report;
use tapesim::runner;
use tapesim::symbols::SymbolMap;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FillModeArg {
    Cross,
    Match,
}

#[derive(Debug, Parser)]
#[command(
    name = "tapesim",
    about = "Replay NYSE XDP captures through competing market-making strategies",
    version
)]
struct Args {
    /// PCAP capture files to replay.
    #[arg(required = true)]
    pcap_files: Vec<PathBuf>,

    /// Only simulate this ticker.
    #[arg(short = 't', long = "ticker")]
    ticker: Option<String>,

    /// Symbol map file (11-field CSV or legacy SYMBOL|EXCHANGE|INDEX).
    #[arg(short = 's', long = "symbol-file")]
    symbol_file: Option<PathBuf>,

    /// Base RNG seed; each symbol derives an independent stream.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// One-way latency mean, microseconds.
    #[arg(long = "latency-us", default_value_t = 5.0)]
    latency_us: f64,

    /// Latency jitter (standard deviation), microseconds.
    #[arg(long = "latency-jitter-us", default_value_t = 1.0)]
    latency_jitter_us: f64,

    /// Fraction of visible depth assumed ahead of a fresh quote.
    #[arg(long = "queue-fraction", default_value_t = 0.005)]
    queue_fraction: f64,

    /// Microseconds to wait before measuring adverse selection on a fill.
    #[arg(long = "adverse-lookforward-us", default_value_t = 250)]
    adverse_lookforward_us: u64,

    /// Fraction of the adverse move charged against PnL.
    #[arg(long = "adverse-multiplier", default_value_t = 0.03)]
    adverse_multiplier: f64,

    /// Maker rebate per share, dollars.
    #[arg(long = "maker-rebate", default_value_t = 0.0025)]
    maker_rebate: f64,

    /// Hard inventory cap per symbol, shares.
    #[arg(long = "max-position", default_value_t = 50_000.0)]
    max_position: f64,

    /// Stop quoting a symbol after this much total loss, dollars.
    #[arg(long = "max-loss", default_value_t = 5_000.0)]
    max_loss: f64,

    /// Minimum interval between quote recomputations, microseconds.
    #[arg(long = "quote-interval-us", default_value_t = 10)]
    quote_interval_us: u64,

    /// Fill eligibility: cross on price, or exact price match.
    #[arg(long = "fill-mode", value_enum, default_value = "cross")]
    fill_mode: FillModeArg,

    /// Override the toxicity suppression threshold (0 keeps the default).
    #[arg(long = "toxicity-threshold", default_value_t = 0.0)]
    toxicity_threshold: f64,

    /// Override the toxicity spread multiplier (0 keeps the default).
    #[arg(long = "toxicity-multiplier", default_value_t = 0.0)]
    toxicity_multiplier: f64,

    /// Directory for per-group CSV/JSON artifacts.
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Train the online toxicity model during the replay.
    #[arg(long = "online-learning")]
    online_learning: bool,

    /// Base learning rate for the online model.
    #[arg(long = "learning-rate", default_value_t = 0.01)]
    learning_rate: f64,

    /// Measured fills before the learned weights take over.
    #[arg(long = "warmup-fills", default_value_t = 50)]
    warmup_fills: u32,

    /// Worker threads (0 = host parallelism).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Cap on files per worker group (0 = no cap).
    #[arg(long = "files-per-group", default_value_t = 0)]
    files_per_group: usize,

    /// One thread per file over a shared simulator table instead of
    /// disjoint file groups. Faster iteration; per-symbol event order is
    /// NOT preserved across captures that overlap in time.
    #[arg(long = "no-hybrid")]
    no_hybrid: bool,

    /// Replay everything on one thread (bit-deterministic).
    #[arg(long)]
    sequential: bool,
}

impl Args {
    fn into_config(self) -> (Vec<PathBuf>, Option<PathBuf>, SimConfig) {
        let mut cfg = SimConfig::default();
        cfg.exec.seed = self.seed;
        cfg.exec.latency_us_mean = self.latency_us;
        cfg.exec.latency_us_jitter = self.latency_jitter_us;
        cfg.exec.queue_position_fraction = self.queue_fraction;
        cfg.exec.adverse_lookforward_us = self.adverse_lookforward_us;
        cfg.exec.adverse_selection_multiplier = self.adverse_multiplier;
        cfg.exec.maker_rebate_per_share = self.maker_rebate;
        cfg.exec.max_position_per_symbol = self.max_position;
        cfg.exec.max_daily_loss_per_symbol = self.max_loss;
        cfg.exec.quote_update_interval_us = self.quote_interval_us;
        cfg.exec.fill_mode = match self.fill_mode {
            FillModeArg::Cross => FillMode::Cross,
            FillModeArg::Match => FillMode::Match,
        };
        cfg.filter_ticker = self.ticker;
        cfg.toxicity_threshold = self.toxicity_threshold;
        cfg.toxicity_multiplier = self.toxicity_multiplier;
        cfg.output_dir = self.output_dir;
        cfg.learning.enabled = self.online_learning;
        cfg.learning.learning_rate = self.learning_rate;
        cfg.learning.warmup_fills = self.warmup_fills;
        cfg.threads = self.threads;
        cfg.files_per_group = self.files_per_group;
        cfg.no_hybrid = self.no_hybrid;
        cfg.sequential = self.sequential;
        (self.pcap_files, self.symbol_file, cfg)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap renders help/version through the same error path.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let (files, symbol_file, cfg) = args.into_config();

    let mut symbols = SymbolMap::new();
    if let Some(path) = &symbol_file {
        match symbols.load(path) {
            Ok(count) => println!("Loaded {count} symbol mappings from {}", path.display()),
            Err(e) => {
                eprintln!("error: cannot read symbol file {}: {e}", path.display());
                return ExitCode::from(1);
            }
        }
    }

    println!(
        "tapesim | files={} | seed={} | mode={} | online_learning={}",
        files.len(),
        cfg.exec.seed,
        if cfg.sequential {
            "sequential"
        } else if cfg.no_hybrid {
            "threaded"
        } else {
            "hybrid"
        },
        cfg.learning.enabled,
    );

    let learning_enabled = cfg.learning.enabled;
    match runner::run(&files, Arc::new(symbols), Arc::new(cfg)) {
        Ok(results) => {
            report::print_summary(&results, learning_enabled);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}
